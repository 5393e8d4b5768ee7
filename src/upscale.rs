use std::path::{Path, PathBuf};

use crate::engine::Services;
use crate::error::LipSyncError;
use crate::runner::CommandSpec;
use crate::ui::prelude::*;

/// Re-encodes a video to 1920x1080 with ffmpeg, copying the audio stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaleStage {
    pub ffmpeg: PathBuf,
}

impl Default for UpscaleStage {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

impl UpscaleStage {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    pub fn command(&self, source: &Path, destination: &Path) -> CommandSpec {
        CommandSpec::new(&self.ffmpeg)
            .args(["-y", "-i"])
            .arg(source)
            .args([
                "-vf",
                "scale=1920:1080:flags=bicubic",
                "-c:v",
                "libx264",
                "-preset",
                "medium",
                "-crf",
                "18",
                "-c:a",
                "copy",
            ])
            .arg(destination)
    }

    pub fn run(
        &self,
        services: &Services<'_>,
        source: &Path,
        destination: &Path,
    ) -> Result<(), LipSyncError> {
        let command = self.command(source, destination);
        services.events.emit(
            Level::Info,
            "upscale.start",
            &format!("Upscaling video to 1080p: {}", command.display()),
            None,
        );

        let outcome = services
            .runner
            .run(&command)
            .map_err(|err| LipSyncError::Upscale {
                command: format!("{} (could not start: {err})", command.display()),
                code: None,
            })?;

        if !outcome.success() {
            return Err(LipSyncError::Upscale {
                command: command.display(),
                code: outcome.code,
            });
        }
        Ok(())
    }
}
