//! End-to-end orchestration of a lip-sync run.
//!
//! A run moves through [`Stage`]s in order: provision the selected backend,
//! run inference into a scratch directory next to the output, then either
//! upscale or move the produced video to the requested path. The scratch
//! directory is removed afterwards unless intermediates are kept; when a
//! stage fails it is left in place for inspection.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::engine::{
    Engine, InferenceJob, LipSyncBackend, SadTalkerBackend, Services, ToolPaths, Wav2LipBackend,
};
use crate::error::LipSyncError;
use crate::provision::ProvisionOptions;
use crate::ui::prelude::*;
use crate::upscale::UpscaleStage;

pub const SUPPORTED_RESOLUTIONS: [u32; 2] = [256, 512];

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub engine: Engine,
    pub fps: u32,
    /// Face model resolution passed to provisioning and SadTalker's `--size`.
    pub resolution: u32,
    pub upscale_to_1080p: bool,
    pub keep_intermediate: bool,
    pub tools: ToolPaths,
    pub sadtalker: SadTalkerBackend,
    pub wav2lip: Wav2LipBackend,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            engine: Engine::SadTalker,
            fps: 25,
            resolution: 512,
            upscale_to_1080p: true,
            keep_intermediate: false,
            tools: ToolPaths::default(),
            sadtalker: SadTalkerBackend::default(),
            wav2lip: Wav2LipBackend::default(),
        }
    }
}

impl PipelineConfig {
    /// The backend for the selected engine. The other one is never touched.
    pub fn backend(&self) -> &dyn LipSyncBackend {
        match self.engine {
            Engine::SadTalker => &self.sadtalker,
            Engine::Wav2Lip => &self.wav2lip,
        }
    }

    pub fn backend_for(&self, engine: Engine) -> &dyn LipSyncBackend {
        match engine {
            Engine::SadTalker => &self.sadtalker,
            Engine::Wav2Lip => &self.wav2lip,
        }
    }

    pub fn provision_options(&self) -> ProvisionOptions {
        ProvisionOptions {
            resolution: self.resolution,
        }
    }

    pub fn validate(&self) -> Result<(), LipSyncError> {
        if self.fps == 0 {
            return Err(LipSyncError::Configuration(
                "fps must be greater than zero".to_string(),
            ));
        }
        if !SUPPORTED_RESOLUTIONS.contains(&self.resolution) {
            return Err(LipSyncError::Configuration(format!(
                "resolution must be 256 or 512, got {}",
                self.resolution
            )));
        }
        self.backend().validate()
    }
}

/// Milestones of a run, emitted as `pipeline.stage.<name>` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    ResourcesEnsured,
    Inferred,
    Upscaled,
    Rearchived,
    Cleaned,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::ResourcesEnsured => "resources_ensured",
            Stage::Inferred => "inferred",
            Stage::Upscaled => "upscaled",
            Stage::Rearchived => "rearchived",
            Stage::Cleaned => "cleaned",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

/// Paths for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub image: PathBuf,
    pub audio: PathBuf,
    pub output: PathBuf,
    pub scratch_dir: PathBuf,
}

impl RunContext {
    pub fn new(
        image: &Path,
        audio: &Path,
        output: &Path,
        engine: Engine,
    ) -> Result<Self, LipSyncError> {
        Ok(Self {
            image: image.to_path_buf(),
            audio: audio.to_path_buf(),
            output: output.to_path_buf(),
            scratch_dir: scratch_dir_for(output, engine)?,
        })
    }
}

fn output_parent(output: &Path) -> &Path {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// `<output parent>/<output stem>_<engine>`
pub fn scratch_dir_for(output: &Path, engine: Engine) -> Result<PathBuf, LipSyncError> {
    let stem = output.file_stem().ok_or_else(|| {
        LipSyncError::Configuration(format!(
            "output path {} has no file name",
            output.display()
        ))
    })?;
    let mut name = stem.to_os_string();
    name.push(format!("_{engine}"));
    Ok(output_parent(output).join(name))
}

pub struct LipSyncPipeline<'a> {
    pub config: PipelineConfig,
    services: Services<'a>,
}

impl<'a> LipSyncPipeline<'a> {
    pub fn new(config: PipelineConfig, services: Services<'a>) -> Self {
        Self { config, services }
    }

    /// Produce a lip-synced video at `output` and return its path.
    pub fn run(&self, image: &Path, audio: &Path, output: &Path) -> Result<PathBuf, LipSyncError> {
        let mut stage = None;
        let result = self.run_stages(image, audio, output, &mut stage);
        if let Err(err) = &result {
            let last = stage.map(Stage::as_str).unwrap_or("none");
            self.services.events.emit(
                Level::Error,
                "pipeline.stage.failed",
                &format!("Pipeline failed (last completed stage: {last}): {err}"),
                Some(serde_json::json!({
                    "stage": Stage::Failed.as_str(),
                    "last_stage": last,
                    "category": err.category().as_str(),
                })),
            );
        }
        result
    }

    fn enter(&self, current: &mut Option<Stage>, next: Stage, message: String) {
        *current = Some(next);
        let level = if next == Stage::Done {
            Level::Success
        } else {
            Level::Info
        };
        self.services.events.emit(
            level,
            &format!("pipeline.stage.{}", next.as_str()),
            &message,
            Some(serde_json::json!({ "stage": next.as_str() })),
        );
    }

    fn run_stages(
        &self,
        image: &Path,
        audio: &Path,
        output: &Path,
        stage: &mut Option<Stage>,
    ) -> Result<PathBuf, LipSyncError> {
        let config = &self.config;
        config.validate()?;
        check_input(image, "image")?;
        check_input(audio, "audio")?;

        let context = RunContext::new(image, audio, output, config.engine)?;
        let parent = output_parent(&context.output);
        fs::create_dir_all(parent).map_err(|err| {
            LipSyncError::filesystem(format!("creating output directory {}", parent.display()), err)
        })?;
        prepare_scratch_dir(&context.scratch_dir, config.keep_intermediate)?;
        self.enter(
            stage,
            Stage::Init,
            format!(
                "Starting {} run, intermediates in {}",
                config.engine.display_name(),
                context.scratch_dir.display()
            ),
        );

        let backend = config.backend();
        backend.ensure(&self.services, &config.tools, &config.provision_options())?;
        self.enter(
            stage,
            Stage::ResourcesEnsured,
            format!("{} resources ready", backend.engine().display_name()),
        );

        let job = InferenceJob {
            image: &context.image,
            audio: &context.audio,
            destination: &context.scratch_dir,
            fps: config.fps,
            resolution: config.resolution,
        };
        let produced = backend.run(&self.services, &config.tools, &job)?;
        self.enter(
            stage,
            Stage::Inferred,
            format!("Inference produced {}", produced.display()),
        );

        if config.upscale_to_1080p {
            UpscaleStage::new(&config.tools.ffmpeg).run(
                &self.services,
                &produced,
                &context.output,
            )?;
            self.enter(
                stage,
                Stage::Upscaled,
                format!("Upscaled video written to {}", context.output.display()),
            );
        } else {
            move_file(&produced, &context.output)?;
            self.enter(
                stage,
                Stage::Rearchived,
                format!("Moved video to {}", context.output.display()),
            );
        }

        if !config.keep_intermediate {
            if let Err(err) = fs::remove_dir_all(&context.scratch_dir) {
                self.services.events.emit(
                    Level::Warn,
                    "pipeline.cleanup.failed",
                    &format!(
                        "Could not remove {}: {}",
                        context.scratch_dir.display(),
                        err
                    ),
                    None,
                );
            }
        }
        self.enter(stage, Stage::Cleaned, "Intermediate files handled".to_string());

        self.enter(
            stage,
            Stage::Done,
            format!("Lip-synced video ready at {}", context.output.display()),
        );
        Ok(context.output)
    }
}

fn check_input(path: &Path, kind: &str) -> Result<(), LipSyncError> {
    if path.is_file() {
        return Ok(());
    }
    let reason = if path.exists() {
        format!("{kind} input is not a regular file")
    } else {
        format!("{kind} input does not exist")
    };
    Err(LipSyncError::Input {
        path: path.to_path_buf(),
        reason,
    })
}

fn prepare_scratch_dir(scratch: &Path, keep_intermediate: bool) -> Result<(), LipSyncError> {
    if !keep_intermediate && scratch.exists() {
        fs::remove_dir_all(scratch).map_err(|err| {
            LipSyncError::filesystem(format!("clearing {}", scratch.display()), err)
        })?;
    }
    fs::create_dir_all(scratch)
        .map_err(|err| LipSyncError::filesystem(format!("creating {}", scratch.display()), err))
}

/// Rename `source` to `destination`, copying when they are on different
/// filesystems.
pub fn move_file(source: &Path, destination: &Path) -> Result<(), LipSyncError> {
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(source, destination).map_err(|err| {
                LipSyncError::filesystem(
                    format!("copying {} to {}", source.display(), destination.display()),
                    err,
                )
            })?;
            fs::remove_file(source).map_err(|err| {
                LipSyncError::filesystem(format!("removing {}", source.display()), err)
            })
        }
        Err(err) => Err(LipSyncError::filesystem(
            format!("moving {} to {}", source.display(), destination.display()),
            err,
        )),
    }
}
