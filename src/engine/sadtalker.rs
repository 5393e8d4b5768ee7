use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::{
    Engine, InferenceJob, LipSyncBackend, Services, ToolPaths, execute_inference, format_float,
    select_generated_video,
};
use crate::common::paths::engine_cache_dir;
use crate::error::LipSyncError;
use crate::provision::{
    ProvisionOptions, ResourceStatus, clone_repository, create_root, dir_has_entries,
    directory_status, lock_root, repo_status, run_acquisition,
};
use crate::runner::CommandSpec;
use crate::ui::prelude::*;

pub const SADTALKER_REPO_URL: &str = "https://github.com/OpenTalker/SadTalker.git";
pub const SADTALKER_MODELS_SCRIPT: &str = "scripts/download_models.py";

/// SadTalker's `--preprocess` modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Preprocess {
    Crop,
    #[value(alias = "extreme_crop")]
    #[serde(alias = "extreme_crop")]
    Extcrop,
    Resize,
    #[default]
    Full,
    Extfull,
}

impl Preprocess {
    pub fn as_str(self) -> &'static str {
        match self {
            Preprocess::Crop => "crop",
            Preprocess::Extcrop => "extcrop",
            Preprocess::Resize => "resize",
            Preprocess::Full => "full",
            Preprocess::Extfull => "extfull",
        }
    }
}

/// Source tree and checkpoints for SadTalker. Checkpoints live inside the
/// cloned repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SadTalkerResources {
    pub root_dir: PathBuf,
    pub repo_url: String,
    /// Helper that downloads the checkpoints, relative to the repository.
    pub models_script: String,
    pub checkpoints_subdir: String,
}

impl Default for SadTalkerResources {
    fn default() -> Self {
        Self::new(engine_cache_dir(Engine::SadTalker))
    }
}

impl SadTalkerResources {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            repo_url: SADTALKER_REPO_URL.to_string(),
            models_script: SADTALKER_MODELS_SCRIPT.to_string(),
            checkpoints_subdir: "checkpoints".to_string(),
        }
    }

    pub fn repo_path(&self) -> PathBuf {
        self.root_dir.join("repo")
    }

    pub fn checkpoints_path(&self) -> PathBuf {
        self.repo_path().join(&self.checkpoints_subdir)
    }

    pub fn models_script_path(&self) -> PathBuf {
        self.repo_path().join(&self.models_script)
    }

    fn ready(&self) -> bool {
        self.repo_path().exists() && dir_has_entries(&self.checkpoints_path())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SadTalkerSettings {
    pub preprocess: Preprocess,
    pub expression_scale: f64,
    pub still_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhancer: Option<String>,
}

impl Default for SadTalkerSettings {
    fn default() -> Self {
        Self {
            preprocess: Preprocess::Full,
            expression_scale: 1.0,
            still_mode: true,
            enhancer: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SadTalkerBackend {
    pub resources: SadTalkerResources,
    pub settings: SadTalkerSettings,
}

impl SadTalkerBackend {
    fn download_checkpoints(
        &self,
        services: &Services<'_>,
        tools: &ToolPaths,
        options: &ProvisionOptions,
    ) -> Result<(), LipSyncError> {
        let repo = self.resources.repo_path();
        let script = self.resources.models_script_path();
        if !script.is_file() {
            return Err(LipSyncError::Acquisition {
                resource: "SadTalker checkpoints".to_string(),
                reason: format!("download script not found at {}", script.display()),
            });
        }

        let checkpoints = self.resources.checkpoints_path();
        fs::create_dir_all(&checkpoints).map_err(|err| {
            LipSyncError::filesystem(format!("creating {}", checkpoints.display()), err)
        })?;

        let interpreter: &Path = if script.extension().is_some_and(|ext| ext == "sh") {
            Path::new("bash")
        } else {
            &tools.python
        };
        let command = CommandSpec::new(interpreter)
            .arg(&script)
            .arg("--model_folder")
            .arg(&checkpoints)
            .arg("--resolution")
            .arg(options.resolution.to_string())
            .current_dir(&repo);

        services.events.emit(
            Level::Info,
            "provision.sadtalker.checkpoints",
            "Downloading SadTalker checkpoints via helper script",
            Some(serde_json::json!({ "command": command.display() })),
        );

        run_acquisition(services, &command, "SadTalker checkpoints")?;
        if !dir_has_entries(&checkpoints) {
            return Err(LipSyncError::Acquisition {
                resource: "SadTalker checkpoints".to_string(),
                reason: format!("helper script left {} empty", checkpoints.display()),
            });
        }
        Ok(())
    }
}

impl LipSyncBackend for SadTalkerBackend {
    fn engine(&self) -> Engine {
        Engine::SadTalker
    }

    fn ensure(
        &self,
        services: &Services<'_>,
        tools: &ToolPaths,
        options: &ProvisionOptions,
    ) -> Result<(), LipSyncError> {
        if self.resources.ready() {
            services.events.emit(
                Level::Debug,
                "provision.sadtalker.present",
                &format!(
                    "SadTalker resources already available in {}",
                    self.resources.root_dir.display()
                ),
                None,
            );
            return Ok(());
        }

        create_root(&self.resources.root_dir)?;
        let _lock = lock_root(&self.resources.root_dir, services.events)?;

        let repo = self.resources.repo_path();
        if !repo.exists() {
            clone_repository(services, &tools.git, &self.resources.repo_url, &repo, "SadTalker")?;
        }
        if !dir_has_entries(&self.resources.checkpoints_path()) {
            self.download_checkpoints(services, tools, options)?;
        }

        services.events.emit(
            Level::Success,
            "provision.sadtalker.ready",
            &format!(
                "SadTalker resources ready in {}",
                self.resources.root_dir.display()
            ),
            None,
        );
        Ok(())
    }

    fn command(&self, tools: &ToolPaths, job: &InferenceJob<'_>) -> CommandSpec {
        let repo = self.resources.repo_path();
        let checkpoints = self.resources.checkpoints_path();

        let mut command = CommandSpec::new(&tools.python)
            .arg(repo.join("inference.py"))
            .arg("--driven_audio")
            .arg(job.audio)
            .arg("--source_image")
            .arg(job.image)
            .arg("--checkpoint_dir")
            .arg(&checkpoints)
            .arg("--result_dir")
            .arg(job.destination)
            .args(["--preprocess", self.settings.preprocess.as_str()])
            .arg("--expression_scale")
            .arg(format_float(self.settings.expression_scale))
            .arg("--size")
            .arg(job.resolution.to_string())
            .arg("--fps")
            .arg(job.fps.to_string());

        if self.settings.still_mode {
            command = command.arg("--still");
        }
        if let Some(enhancer) = &self.settings.enhancer {
            command = command.args(["--enhancer", enhancer.as_str()]);
        }

        command
            .current_dir(&repo)
            .env_default("PYTHONPATH", &repo)
            .env_default("SADTALKER_CHECKPOINTS", &checkpoints)
    }

    fn run(
        &self,
        services: &Services<'_>,
        tools: &ToolPaths,
        job: &InferenceJob<'_>,
    ) -> Result<PathBuf, LipSyncError> {
        let command = self.command(tools, job);
        execute_inference(services, Engine::SadTalker, &command)?;
        select_generated_video(job.destination, services.events)
    }

    fn repo_present(&self) -> bool {
        self.resources.repo_path().exists()
    }

    fn status(&self) -> Vec<ResourceStatus> {
        vec![
            repo_status("SadTalker repository", &self.resources.repo_path()),
            directory_status("SadTalker checkpoints", &self.resources.checkpoints_path()),
        ]
    }

    fn validate(&self) -> Result<(), LipSyncError> {
        let scale = self.settings.expression_scale;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(LipSyncError::Configuration(format!(
                "expression scale must be a positive number, got {scale}"
            )));
        }
        if self
            .settings
            .enhancer
            .as_deref()
            .is_some_and(|e| e.trim().is_empty())
        {
            return Err(LipSyncError::Configuration(
                "enhancer name must not be empty".to_string(),
            ));
        }
        if self.resources.repo_url.trim().is_empty() {
            return Err(LipSyncError::Configuration(
                "SadTalker repository URL must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
