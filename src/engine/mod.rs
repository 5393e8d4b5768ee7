//! Lip-sync backends.
//!
//! Each backend pairs a resource bundle (source tree + checkpoints) with a
//! settings record and knows how to provision itself and turn an
//! [`InferenceJob`] into a child process invocation.

pub mod sadtalker;
pub mod wav2lip;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use crate::download::Downloader;
use crate::error::LipSyncError;
use crate::provision::{ProvisionOptions, ResourceStatus};
use crate::runner::{CommandRunner, CommandSpec};
use crate::ui::prelude::*;

pub use sadtalker::{Preprocess, SadTalkerBackend, SadTalkerResources, SadTalkerSettings};
pub use wav2lip::{Wav2LipBackend, Wav2LipResources, Wav2LipSettings};

/// Which backend handles a request
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    #[value(name = "sadtalker")]
    SadTalker,
    #[value(name = "wav2lip")]
    Wav2Lip,
}

impl Engine {
    pub const ALL: [Engine; 2] = [Engine::SadTalker, Engine::Wav2Lip];

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::SadTalker => "sadtalker",
            Engine::Wav2Lip => "wav2lip",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Engine::SadTalker => "SadTalker",
            Engine::Wav2Lip => "Wav2Lip",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = LipSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sadtalker" => Ok(Engine::SadTalker),
            "wav2lip" => Ok(Engine::Wav2Lip),
            _ => Err(LipSyncError::Configuration(format!(
                "Unsupported engine: '{}'. Expected: sadtalker or wav2lip",
                s
            ))),
        }
    }
}

/// Programs the pipeline shells out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub python: PathBuf,
    pub git: PathBuf,
    pub ffmpeg: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            git: PathBuf::from("git"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

/// Collaborators injected into every stage.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub runner: &'a dyn CommandRunner,
    pub downloader: &'a dyn Downloader,
    pub events: &'a dyn EventSink,
}

/// Inputs for one backend invocation
#[derive(Debug, Clone, Copy)]
pub struct InferenceJob<'a> {
    pub image: &'a Path,
    pub audio: &'a Path,
    pub destination: &'a Path,
    pub fps: u32,
    pub resolution: u32,
}

/// Trait implemented by both lip-sync backends
pub trait LipSyncBackend {
    fn engine(&self) -> Engine;

    /// Make sure the source tree and checkpoints exist and are valid.
    /// Safe to call on every run.
    fn ensure(
        &self,
        services: &Services<'_>,
        tools: &ToolPaths,
        options: &ProvisionOptions,
    ) -> Result<(), LipSyncError>;

    /// The inference invocation for `job`, without running it.
    fn command(&self, tools: &ToolPaths, job: &InferenceJob<'_>) -> CommandSpec;

    /// Run inference and return the produced video.
    fn run(
        &self,
        services: &Services<'_>,
        tools: &ToolPaths,
        job: &InferenceJob<'_>,
    ) -> Result<PathBuf, LipSyncError>;

    /// Whether the source tree is already cloned.
    fn repo_present(&self) -> bool;

    fn status(&self) -> Vec<ResourceStatus>;

    fn validate(&self) -> Result<(), LipSyncError>;
}

/// Run an inference command and translate its exit status.
pub(crate) fn execute_inference(
    services: &Services<'_>,
    engine: Engine,
    command: &CommandSpec,
) -> Result<(), LipSyncError> {
    services.events.emit(
        Level::Info,
        &format!("inference.{engine}.start"),
        &format!(
            "Executing {} inference: {}",
            engine.display_name(),
            command.display()
        ),
        Some(serde_json::json!({ "args": command.args_lossy() })),
    );

    let outcome = services
        .runner
        .run(command)
        .map_err(|err| {
            services.events.emit(
                Level::Error,
                &format!("inference.{engine}.spawn_failed"),
                &format!("Could not start {}: {}", command.program_lossy(), err),
                None,
            );
            LipSyncError::InferenceProcess {
                engine,
                command: format!("{} (could not start: {err})", command.display()),
                code: None,
            }
        })?;

    if !outcome.success() {
        return Err(LipSyncError::InferenceProcess {
            engine,
            command: command.display(),
            code: outcome.code,
        });
    }
    Ok(())
}

/// Pick the generated video among the `.mp4` files directly inside `directory`.
///
/// The most recently modified file wins; files sharing that modification
/// time are ordered by path and the first is taken. Whenever more than one
/// candidate exists, a warning lists all of them.
pub(crate) fn select_generated_video(
    directory: &Path,
    events: &dyn EventSink,
) -> Result<PathBuf, LipSyncError> {
    let entries = fs::read_dir(directory).map_err(|err| LipSyncError::MissingOutput {
        path: directory.to_path_buf(),
        detail: format!("output directory is unreadable: {err}"),
    })?;

    let mut candidates: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("mp4"))
        })
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (path, modified)
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let Some(newest) = candidates.iter().map(|(_, modified)| *modified).max() else {
        return Err(LipSyncError::MissingOutput {
            path: directory.to_path_buf(),
            detail: "no .mp4 file was produced".to_string(),
        });
    };

    let selected = candidates
        .iter()
        .find(|(_, modified)| *modified == newest)
        .map(|(path, _)| path.clone())
        .unwrap_or_else(|| candidates[0].0.clone());

    if candidates.len() > 1 {
        let names: Vec<String> = candidates
            .iter()
            .map(|(path, _)| path.display().to_string())
            .collect();
        events.emit(
            Level::Warn,
            "inference.output.ambiguous",
            &format!(
                "Multiple outputs detected ({}); selecting most recent {}",
                names.join(", "),
                selected.display()
            ),
            Some(serde_json::json!({
                "candidates": names,
                "selected": selected.display().to_string(),
            })),
        );
    }

    Ok(selected)
}

/// Render a float the way Python's `str()` does for typical values: shortest
/// round-trip digits, always with a decimal point.
pub(crate) fn format_float(value: f64) -> String {
    format!("{value:?}")
}
