use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use super::{
    Engine, InferenceJob, LipSyncBackend, Services, ToolPaths, execute_inference, format_float,
};
use crate::common::paths::engine_cache_dir;
use crate::error::LipSyncError;
use crate::provision::{
    CheckpointSource, ProvisionOptions, ResourceStatus, checkpoint_ready, checkpoint_status,
    clone_repository, create_root, ensure_checkpoint, file_present, lock_root, mirror_file,
    repo_status,
};
use crate::runner::CommandSpec;
use crate::ui::prelude::*;

pub const WAV2LIP_REPO_URL: &str = "https://github.com/Rudrabha/Wav2Lip.git";
pub const WAV2LIP_CHECKPOINT_URL: &str =
    "https://drive.google.com/uc?export=download&id=1cwRmZm4EUdS6WZfiP2spXK7pbybY2coh";
pub const S3FD_CHECKPOINT_URL: &str =
    "https://drive.google.com/uc?export=download&id=1ER8mWj4lfUYSS-uMndZX45phBORp_ZO7";

const RESULT_FILE_NAME: &str = "result.mp4";

/// Source tree plus the lip-sync and face detector checkpoints. Checkpoints
/// are kept beside the repository, not inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wav2LipResources {
    pub root_dir: PathBuf,
    pub repo_url: String,
    pub checkpoints_subdir: String,
    pub wav2lip: CheckpointSource,
    pub face_detector: CheckpointSource,
}

impl Default for Wav2LipResources {
    fn default() -> Self {
        Self::new(engine_cache_dir(Engine::Wav2Lip))
    }
}

impl Wav2LipResources {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            repo_url: WAV2LIP_REPO_URL.to_string(),
            checkpoints_subdir: "checkpoints".to_string(),
            wav2lip: CheckpointSource::new("wav2lip.pth", WAV2LIP_CHECKPOINT_URL),
            face_detector: CheckpointSource::new("s3fd.pth", S3FD_CHECKPOINT_URL),
        }
    }

    pub fn repo_path(&self) -> PathBuf {
        self.root_dir.join("repo")
    }

    pub fn checkpoints_path(&self) -> PathBuf {
        self.root_dir.join(&self.checkpoints_subdir)
    }

    pub fn wav2lip_checkpoint(&self) -> PathBuf {
        self.checkpoints_path().join(&self.wav2lip.filename)
    }

    pub fn face_detector_checkpoint(&self) -> PathBuf {
        self.checkpoints_path().join(&self.face_detector.filename)
    }

    /// Where the repository's face detection code loads S3FD from.
    pub fn face_detector_mirror(&self) -> PathBuf {
        self.repo_path()
            .join("face_detection")
            .join("detection")
            .join("sfd")
            .join(&self.face_detector.filename)
    }

    fn ready(&self) -> bool {
        self.repo_path().exists()
            && checkpoint_ready(&self.wav2lip_checkpoint(), &self.wav2lip)
            && checkpoint_ready(&self.face_detector_checkpoint(), &self.face_detector)
            && file_present(&self.face_detector_mirror())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wav2LipSettings {
    /// Face box padding: top, bottom, left, right.
    pub pads: [i32; 4],
    #[serde(rename = "static")]
    pub static_mode: bool,
    pub nosmooth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wav2lip_batch_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_det_batch_size: Option<u32>,
    pub resize_factor: f64,
    /// Crop box: x1, y1, x2, y2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop: Option<[i32; 4]>,
}

impl Default for Wav2LipSettings {
    fn default() -> Self {
        Self {
            pads: [0, 10, 0, 0],
            static_mode: true,
            nosmooth: false,
            wav2lip_batch_size: None,
            face_det_batch_size: None,
            resize_factor: 1.0,
            crop: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Wav2LipBackend {
    pub resources: Wav2LipResources,
    pub settings: Wav2LipSettings,
}

impl LipSyncBackend for Wav2LipBackend {
    fn engine(&self) -> Engine {
        Engine::Wav2Lip
    }

    fn ensure(
        &self,
        services: &Services<'_>,
        tools: &ToolPaths,
        _options: &ProvisionOptions,
    ) -> Result<(), LipSyncError> {
        let resources = &self.resources;
        if resources.ready() {
            services.events.emit(
                Level::Debug,
                "provision.wav2lip.present",
                &format!(
                    "Wav2Lip resources already available in {}",
                    resources.root_dir.display()
                ),
                None,
            );
            return Ok(());
        }

        create_root(&resources.root_dir)?;
        let _lock = lock_root(&resources.root_dir, services.events)?;

        let repo = resources.repo_path();
        if !repo.exists() {
            clone_repository(services, &tools.git, &resources.repo_url, &repo, "Wav2Lip")?;
        }

        ensure_checkpoint(
            services,
            &resources.wav2lip,
            &resources.wav2lip_checkpoint(),
            "Wav2Lip",
        )?;
        let detector_fetched = ensure_checkpoint(
            services,
            &resources.face_detector,
            &resources.face_detector_checkpoint(),
            "S3FD face detector",
        )?;

        let mirror = resources.face_detector_mirror();
        if mirror_file(&resources.face_detector_checkpoint(), &mirror, detector_fetched)? {
            services.events.emit(
                Level::Debug,
                "provision.wav2lip.mirror",
                &format!("Copied S3FD checkpoint into {}", mirror.display()),
                None,
            );
        }

        services.events.emit(
            Level::Success,
            "provision.wav2lip.ready",
            &format!("Wav2Lip resources ready in {}", resources.root_dir.display()),
            None,
        );
        Ok(())
    }

    fn command(&self, tools: &ToolPaths, job: &InferenceJob<'_>) -> CommandSpec {
        let repo = self.resources.repo_path();
        let settings = &self.settings;

        let mut command = CommandSpec::new(&tools.python)
            .arg(repo.join("inference.py"))
            .arg("--checkpoint_path")
            .arg(self.resources.wav2lip_checkpoint())
            .arg("--face")
            .arg(job.image)
            .arg("--audio")
            .arg(job.audio)
            .arg("--outfile")
            .arg(job.destination.join(RESULT_FILE_NAME))
            .arg("--fps")
            .arg(job.fps.to_string())
            .arg("--pads")
            .args(settings.pads.iter().map(|p| p.to_string()));

        // inference.py parses --static with type=bool, so it needs a value.
        if settings.static_mode {
            command = command.args(["--static", "True"]);
        }
        if settings.nosmooth {
            command = command.arg("--nosmooth");
        }
        if let Some(size) = settings.wav2lip_batch_size {
            command = command.arg("--wav2lip_batch_size").arg(size.to_string());
        }
        if let Some(size) = settings.face_det_batch_size {
            command = command.arg("--face_det_batch_size").arg(size.to_string());
        }
        if settings.resize_factor != 1.0 {
            command = command
                .arg("--resize_factor")
                .arg(format_float(settings.resize_factor));
        }
        if let Some(crop) = settings.crop {
            command = command
                .arg("--crop")
                .args(crop.iter().map(|c| c.to_string()));
        }

        command
            .current_dir(&repo)
            .env_default("PYTHONPATH", &repo)
            .env_default("WAV2LIP_CHECKPOINT_PATH", self.resources.wav2lip_checkpoint())
            .env_default("S3FD_PATH", self.resources.face_detector_checkpoint())
    }

    fn run(
        &self,
        services: &Services<'_>,
        tools: &ToolPaths,
        job: &InferenceJob<'_>,
    ) -> Result<PathBuf, LipSyncError> {
        let output = job.destination.join(RESULT_FILE_NAME);
        if output.exists() {
            fs::remove_file(&output).map_err(|err| {
                LipSyncError::filesystem(format!("removing stale {}", output.display()), err)
            })?;
        }

        let command = self.command(tools, job);
        execute_inference(services, Engine::Wav2Lip, &command)?;

        if !output.is_file() {
            return Err(LipSyncError::MissingOutput {
                path: output,
                detail: "Wav2Lip exited successfully but did not create the file".to_string(),
            });
        }
        Ok(output)
    }

    fn repo_present(&self) -> bool {
        self.resources.repo_path().exists()
    }

    fn status(&self) -> Vec<ResourceStatus> {
        let resources = &self.resources;
        vec![
            repo_status("Wav2Lip repository", &resources.repo_path()),
            checkpoint_status(
                "Wav2Lip checkpoint",
                &resources.wav2lip_checkpoint(),
                &resources.wav2lip,
            ),
            checkpoint_status(
                "S3FD checkpoint",
                &resources.face_detector_checkpoint(),
                &resources.face_detector,
            ),
            checkpoint_status(
                "S3FD repository copy",
                &resources.face_detector_mirror(),
                &CheckpointSource::new(&resources.face_detector.filename, ""),
            ),
        ]
    }

    fn validate(&self) -> Result<(), LipSyncError> {
        let settings = &self.settings;
        if !settings.resize_factor.is_finite() || settings.resize_factor <= 0.0 {
            return Err(LipSyncError::Configuration(format!(
                "resize factor must be a positive number, got {}",
                settings.resize_factor
            )));
        }
        if settings.wav2lip_batch_size == Some(0) {
            return Err(LipSyncError::Configuration(
                "wav2lip batch size must be at least 1".to_string(),
            ));
        }
        if settings.face_det_batch_size == Some(0) {
            return Err(LipSyncError::Configuration(
                "face detection batch size must be at least 1".to_string(),
            ));
        }
        for source in [&self.resources.wav2lip, &self.resources.face_detector] {
            if source.filename.trim().is_empty() || source.url.trim().is_empty() {
                return Err(LipSyncError::Configuration(format!(
                    "checkpoint '{}' needs both a file name and a URL",
                    source.filename
                )));
            }
        }
        Ok(())
    }
}
