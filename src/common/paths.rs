use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::engine::Engine;

/// Centralized path management for lipsync

/// Get the lipsync config directory
pub fn lipsync_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Unable to determine user config directory")?
        .join("lipsync");
    Ok(config_dir)
}

/// Get the default config file path
pub fn default_config_path() -> Result<PathBuf> {
    Ok(lipsync_config_dir()?.join("config.toml"))
}

/// Root of all cached backend repositories and checkpoints.
///
/// Falls back to `.cache/lipsync` relative to the working directory when the
/// platform has no cache directory.
pub fn lipsync_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("lipsync")
}

/// Default cache root for one engine, e.g. `~/.cache/lipsync/wav2lip`
pub fn engine_cache_dir(engine: Engine) -> PathBuf {
    lipsync_cache_dir().join(engine.as_str())
}

/// Expand `~` and environment variables in a user supplied path
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
    }
}
