use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::Engine;

/// Failures raised by provisioning, inference and post-processing.
///
/// Nothing in the pipeline retries; each variant carries enough context to
/// diagnose the failure without running again.
#[derive(Error, Debug)]
pub enum LipSyncError {
    #[error("Failed to acquire {resource}: {reason}")]
    Acquisition { resource: String, reason: String },

    #[error(
        "Checksum mismatch for {}: expected {expected}, got {actual}",
        .path.display()
    )]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("{engine} inference failed ({}): {command}", describe_code(.code))]
    InferenceProcess {
        engine: Engine,
        command: String,
        code: Option<i32>,
    },

    #[error("Expected output is missing at {}: {detail}", .path.display())]
    MissingOutput { path: PathBuf, detail: String },

    #[error("Upscale failed ({}): {command}", describe_code(.code))]
    Upscale { command: String, code: Option<i32> },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid input {}: {reason}", .path.display())]
    Input { path: PathBuf, reason: String },

    #[error("{context}")]
    Filesystem {
        context: String,
        #[source]
        source: io::Error,
    },
}

/// Which part of the system an operator should look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Resources,
    Inference,
    PostProcessing,
    Configuration,
    Input,
    Filesystem,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Resources => "resources",
            ErrorCategory::Inference => "inference",
            ErrorCategory::PostProcessing => "post-processing",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Input => "input",
            ErrorCategory::Filesystem => "filesystem",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Resources => {
                "Could not obtain model resources. Check network access and retry the download."
            }
            ErrorCategory::Inference => {
                "Model execution failed. Check the Python environment, GPU and driver."
            }
            ErrorCategory::PostProcessing => {
                "Post-processing failed. Check that ffmpeg is installed and supports libx264."
            }
            ErrorCategory::Configuration => "Check the command line flags and config file.",
            ErrorCategory::Input => "Check the input image and audio paths.",
            ErrorCategory::Filesystem => "Check permissions and free space for the output directory.",
        }
    }
}

impl LipSyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LipSyncError::Acquisition { .. } | LipSyncError::Integrity { .. } => {
                ErrorCategory::Resources
            }
            LipSyncError::InferenceProcess { .. } | LipSyncError::MissingOutput { .. } => {
                ErrorCategory::Inference
            }
            LipSyncError::Upscale { .. } => ErrorCategory::PostProcessing,
            LipSyncError::Configuration(_) => ErrorCategory::Configuration,
            LipSyncError::Input { .. } => ErrorCategory::Input,
            LipSyncError::Filesystem { .. } => ErrorCategory::Filesystem,
        }
    }

    pub fn filesystem(context: impl Into<String>, source: io::Error) -> Self {
        LipSyncError::Filesystem {
            context: context.into(),
            source,
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_include_diagnostic_context() {
        let err = LipSyncError::Integrity {
            path: PathBuf::from("/cache/wav2lip.pth"),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        let text = err.to_string();
        assert!(text.contains("/cache/wav2lip.pth"));
        assert!(text.contains("expected aa"));
        assert!(text.contains("got bb"));

        let err = LipSyncError::InferenceProcess {
            engine: Engine::Wav2Lip,
            command: "python3 inference.py".into(),
            code: Some(2),
        };
        assert_eq!(
            err.to_string(),
            "wav2lip inference failed (exit code 2): python3 inference.py"
        );
    }

    #[test]
    fn categories_separate_resources_inference_and_post_processing() {
        let acquisition = LipSyncError::Acquisition {
            resource: "repo".into(),
            reason: "offline".into(),
        };
        let missing = LipSyncError::MissingOutput {
            path: PathBuf::from("x"),
            detail: "gone".into(),
        };
        let upscale = LipSyncError::Upscale {
            command: "ffmpeg".into(),
            code: None,
        };
        assert_eq!(acquisition.category(), ErrorCategory::Resources);
        assert_eq!(missing.category(), ErrorCategory::Inference);
        assert_eq!(upscale.category(), ErrorCategory::PostProcessing);
        assert!(upscale.to_string().contains("no exit code"));
    }
}
