//! Python packages the backends import at inference time.

use std::path::Path;

use crate::engine::Services;
use crate::error::LipSyncError;
use crate::provision::run_acquisition;
use crate::runner::CommandSpec;
use crate::ui::prelude::*;

/// A pip distribution and the module it provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PythonPackage {
    pub name: &'static str,
    pub module: &'static str,
}

impl PythonPackage {
    const fn same(name: &'static str) -> Self {
        Self { name, module: name }
    }

    const fn new(name: &'static str, module: &'static str) -> Self {
        Self { name, module }
    }
}

pub const DEFAULT_PACKAGES: &[PythonPackage] = &[
    PythonPackage::same("torch"),
    PythonPackage::same("torchvision"),
    PythonPackage::same("numpy"),
    PythonPackage::new("opencv-python", "cv2"),
    PythonPackage::new("ffmpeg-python", "ffmpeg"),
    PythonPackage::same("librosa"),
    PythonPackage::same("tqdm"),
    PythonPackage::same("scipy"),
    PythonPackage::same("audioread"),
    PythonPackage::new("face-alignment", "face_alignment"),
    PythonPackage::same("lpips"),
    PythonPackage::same("gfpgan"),
    PythonPackage::same("imageio"),
    PythonPackage::same("requests"),
];

/// Packages whose module cannot be imported by `python`.
pub fn missing_packages(
    services: &Services<'_>,
    python: &Path,
    packages: &[PythonPackage],
) -> Result<Vec<PythonPackage>, LipSyncError> {
    let mut missing = Vec::new();
    for package in packages {
        let command = CommandSpec::new(python)
            .arg("-c")
            .arg(format!("import {}", package.module))
            .quiet();
        let outcome = services.runner.run(&command).map_err(|err| {
            LipSyncError::Configuration(format!(
                "could not run Python interpreter {}: {err}",
                python.display()
            ))
        })?;
        services.events.emit(
            Level::Debug,
            "deps.check",
            &format!(
                "{} ({}): {}",
                package.name,
                package.module,
                if outcome.success() { "ok" } else { "missing" }
            ),
            None,
        );
        if !outcome.success() {
            missing.push(*package);
        }
    }
    Ok(missing)
}

/// Install whatever is missing with `python -m pip install`. Returns the
/// installed package names.
pub fn ensure_dependencies(
    services: &Services<'_>,
    python: &Path,
    packages: &[PythonPackage],
) -> Result<Vec<String>, LipSyncError> {
    let missing = missing_packages(services, python, packages)?;
    if missing.is_empty() {
        services.events.emit(
            Level::Success,
            "deps.satisfied",
            "All Python dependencies are installed",
            None,
        );
        return Ok(Vec::new());
    }

    let names: Vec<String> = missing.iter().map(|p| p.name.to_string()).collect();
    services.events.emit(
        Level::Info,
        "deps.install",
        &format!("Installing missing dependencies: {}", names.join(", ")),
        Some(serde_json::json!({ "packages": names })),
    );

    let command = CommandSpec::new(python)
        .args(["-m", "pip", "install"])
        .args(&names);
    run_acquisition(services, &command, "Python dependencies")?;

    services.events.emit(
        Level::Success,
        "deps.installed",
        &format!("Installed {} package(s)", names.len()),
        None,
    );
    Ok(names)
}
