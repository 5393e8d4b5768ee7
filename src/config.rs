use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::paths::{self, expand_path};
use crate::engine::{
    Engine, SadTalkerBackend, SadTalkerResources, SadTalkerSettings, ToolPaths, Wav2LipBackend,
    Wav2LipResources, Wav2LipSettings,
};
use crate::error::LipSyncError;
use crate::pipeline::PipelineConfig;
use crate::provision::CheckpointSource;

/// Persistent defaults, read from `~/.config/lipsync/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LipSyncConfig {
    /// Engine used when `--engine` is not given (sadtalker or wav2lip)
    pub engine: String,
    pub fps: u32,
    /// SadTalker face model size (256 or 512)
    pub resolution: u32,
    pub upscale_to_1080p: bool,
    pub keep_intermediate: bool,
    pub tools: ToolPaths,
    pub sadtalker: SadTalkerSection,
    pub wav2lip: Wav2LipSection,
}

impl Default for LipSyncConfig {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            engine: pipeline.engine.to_string(),
            fps: pipeline.fps,
            resolution: pipeline.resolution,
            upscale_to_1080p: pipeline.upscale_to_1080p,
            keep_intermediate: pipeline.keep_intermediate,
            tools: ToolPaths::default(),
            sadtalker: SadTalkerSection::default(),
            wav2lip: Wav2LipSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SadTalkerSection {
    /// Overrides `~/.cache/lipsync/sadtalker`; `~` and `$VARS` are expanded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    pub repo_url: String,
    pub models_script: String,
    pub settings: SadTalkerSettings,
}

impl Default for SadTalkerSection {
    fn default() -> Self {
        let resources = SadTalkerResources::new(PathBuf::new());
        Self {
            cache_dir: None,
            repo_url: resources.repo_url,
            models_script: resources.models_script,
            settings: SadTalkerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wav2LipSection {
    /// Overrides `~/.cache/lipsync/wav2lip`; `~` and `$VARS` are expanded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    pub repo_url: String,
    pub checkpoint: CheckpointSource,
    pub face_detector: CheckpointSource,
    pub settings: Wav2LipSettings,
}

impl Default for Wav2LipSection {
    fn default() -> Self {
        let resources = Wav2LipResources::new(PathBuf::new());
        Self {
            cache_dir: None,
            repo_url: resources.repo_url,
            checkpoint: resources.wav2lip,
            face_detector: resources.face_detector,
            settings: Wav2LipSettings::default(),
        }
    }
}

impl LipSyncConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults and is not created.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => paths::default_config_path()?,
        };
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading lipsync config from {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing lipsync config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("creating lipsync config directory {}", parent.display())
            })?;
        }

        let toml = self.to_toml()?;
        fs::write(path, toml)
            .with_context(|| format!("writing lipsync config to {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing lipsync config")
    }

    pub fn engine(&self) -> Result<Engine, LipSyncError> {
        self.engine.parse()
    }

    fn cache_root(configured: Option<&str>, engine: Engine) -> PathBuf {
        configured
            .map(expand_path)
            .unwrap_or_else(|| paths::engine_cache_dir(engine))
    }

    /// Build the pipeline configuration described by this file.
    pub fn to_pipeline_config(&self) -> Result<PipelineConfig, LipSyncError> {
        let sadtalker = SadTalkerBackend {
            resources: SadTalkerResources {
                repo_url: self.sadtalker.repo_url.clone(),
                models_script: self.sadtalker.models_script.clone(),
                ..SadTalkerResources::new(Self::cache_root(
                    self.sadtalker.cache_dir.as_deref(),
                    Engine::SadTalker,
                ))
            },
            settings: self.sadtalker.settings.clone(),
        };

        let wav2lip = Wav2LipBackend {
            resources: Wav2LipResources {
                repo_url: self.wav2lip.repo_url.clone(),
                wav2lip: self.wav2lip.checkpoint.clone(),
                face_detector: self.wav2lip.face_detector.clone(),
                ..Wav2LipResources::new(Self::cache_root(
                    self.wav2lip.cache_dir.as_deref(),
                    Engine::Wav2Lip,
                ))
            },
            settings: self.wav2lip.settings.clone(),
        };

        Ok(PipelineConfig {
            engine: self.engine()?,
            fps: self.fps,
            resolution: self.resolution,
            upscale_to_1080p: self.upscale_to_1080p,
            keep_intermediate: self.keep_intermediate,
            tools: self.tools.clone(),
            sadtalker,
            wav2lip,
        })
    }
}
