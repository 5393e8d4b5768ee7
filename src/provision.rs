//! Shared resource provisioning: repository clones, checkpoint downloads with
//! optional SHA-256 verification, and the per-cache-root provisioning lock.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::common::hash::{compute_file_hash, digests_match};
use crate::engine::Services;
use crate::error::LipSyncError;
use crate::runner::CommandSpec;
use crate::ui::prelude::*;

const LOCK_FILE_NAME: &str = ".provision.lock";

/// Parameters forwarded to helper scripts during acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionOptions {
    pub resolution: u32,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self { resolution: 512 }
    }
}

/// Where a checkpoint comes from and how to check it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSource {
    pub filename: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl CheckpointSource {
    pub fn new(filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            url: url.into(),
            sha256: None,
        }
    }

    #[cfg(test)]
    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }
}

/// One line of `lipsync resources` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    pub label: String,
    pub path: PathBuf,
    pub present: bool,
    pub detail: Option<String>,
}

/// Exclusive advisory lock on a cache root, released on drop.
pub struct ProvisionLock {
    _lock: Flock<File>,
}

/// Take the provisioning lock for `root`, waiting if another run holds it.
pub fn lock_root(root: &Path, events: &dyn EventSink) -> Result<ProvisionLock, LipSyncError> {
    let lock_path = root.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|err| {
            LipSyncError::filesystem(format!("opening lock file {}", lock_path.display()), err)
        })?;

    let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((file, Errno::EWOULDBLOCK)) => {
            events.emit(
                Level::Info,
                "provision.lock.wait",
                &format!(
                    "Waiting for another run to finish provisioning {}",
                    root.display()
                ),
                None,
            );
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
                LipSyncError::filesystem(
                    format!("locking {}", lock_path.display()),
                    std::io::Error::from(errno),
                )
            })?
        }
        Err((_, errno)) => {
            return Err(LipSyncError::filesystem(
                format!("locking {}", lock_path.display()),
                std::io::Error::from(errno),
            ));
        }
    };

    Ok(ProvisionLock { _lock: lock })
}

pub fn create_root(root: &Path) -> Result<(), LipSyncError> {
    fs::create_dir_all(root).map_err(|err| {
        LipSyncError::filesystem(format!("creating cache directory {}", root.display()), err)
    })
}

/// A file that exists and is not empty.
pub fn file_present(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

/// A directory with at least one entry.
pub fn dir_has_entries(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_some())
}

/// Sidecar recording the digest a checkpoint was last verified against.
fn stamp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".sha256");
    path.with_file_name(name)
}

fn stamp_matches(path: &Path, expected: &str) -> bool {
    fs::read_to_string(stamp_path(path)).is_ok_and(|stamp| digests_match(expected, &stamp))
}

fn write_stamp(path: &Path, digest: &str) -> Result<(), LipSyncError> {
    let stamp = stamp_path(path);
    fs::write(&stamp, format!("{digest}\n"))
        .map_err(|err| LipSyncError::filesystem(format!("writing {}", stamp.display()), err))
}

/// Present and, when a checksum is declared, already verified.
///
/// Only looks at file metadata and the verification stamp; never hashes.
pub fn checkpoint_ready(path: &Path, source: &CheckpointSource) -> bool {
    file_present(path)
        && source
            .sha256
            .as_deref()
            .is_none_or(|expected| stamp_matches(path, expected))
}

/// Clone `url` into `target` with a depth-1 clone.
pub fn clone_repository(
    services: &Services<'_>,
    git: &Path,
    url: &str,
    target: &Path,
    label: &str,
) -> Result<(), LipSyncError> {
    let command = CommandSpec::new(git)
        .args(["clone", "--depth", "1", url])
        .arg(target);

    services.events.emit(
        Level::Info,
        "provision.clone",
        &format!("Cloning {} repository into {}", label, target.display()),
        Some(serde_json::json!({ "url": url })),
    );

    run_acquisition(services, &command, &format!("{label} repository"))
}

/// Run a provisioning command; any spawn failure or non-zero exit is an
/// acquisition failure for `resource`.
pub fn run_acquisition(
    services: &Services<'_>,
    command: &CommandSpec,
    resource: &str,
) -> Result<(), LipSyncError> {
    let outcome = services
        .runner
        .run(command)
        .map_err(|err| LipSyncError::Acquisition {
            resource: resource.to_string(),
            reason: format!("could not run `{}`: {err}", command.display()),
        })?;

    if !outcome.success() {
        let status = match outcome.code {
            Some(code) => format!("code {code}"),
            None => "no exit code".to_string(),
        };
        return Err(LipSyncError::Acquisition {
            resource: resource.to_string(),
            reason: format!("`{}` exited with {status}", command.display()),
        });
    }
    Ok(())
}

/// Make sure the checkpoint at `path` is present and valid, downloading it
/// from `source.url` when it is not. Returns whether a download happened.
pub fn ensure_checkpoint(
    services: &Services<'_>,
    source: &CheckpointSource,
    path: &Path,
    label: &str,
) -> Result<bool, LipSyncError> {
    if file_present(path) {
        match source.sha256.as_deref() {
            None => return Ok(false),
            Some(expected) if stamp_matches(path, expected) => return Ok(false),
            Some(expected) => {
                let actual = compute_file_hash(path).map_err(|err| {
                    LipSyncError::filesystem(format!("hashing {}", path.display()), err)
                })?;
                if digests_match(expected, &actual) {
                    write_stamp(path, &actual)?;
                    return Ok(false);
                }
                services.events.emit(
                    Level::Warn,
                    "provision.checkpoint.corrupt",
                    &format!(
                        "{} checkpoint at {} does not match its checksum; downloading again",
                        label,
                        path.display()
                    ),
                    Some(serde_json::json!({ "expected": expected, "actual": actual })),
                );
                fs::remove_file(path).map_err(|err| {
                    LipSyncError::filesystem(format!("removing {}", path.display()), err)
                })?;
            }
        }
    }

    download_checkpoint(services, source, path, label)?;
    Ok(true)
}

fn download_checkpoint(
    services: &Services<'_>,
    source: &CheckpointSource,
    path: &Path,
    label: &str,
) -> Result<(), LipSyncError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| {
        LipSyncError::filesystem(format!("creating {}", parent.display()), err)
    })?;

    services.events.emit(
        Level::Info,
        "provision.checkpoint.download",
        &format!("Downloading {} checkpoint", label),
        Some(serde_json::json!({ "url": source.url, "path": path.display().to_string() })),
    );

    // Removed automatically unless persisted below.
    let partial = tempfile::Builder::new()
        .prefix(&format!(".{}", source.filename))
        .suffix(".part")
        .tempfile_in(parent)
        .map_err(|err| {
            LipSyncError::filesystem(
                format!("creating temporary file in {}", parent.display()),
                err,
            )
        })?;

    let bytes = services
        .downloader
        .download(&source.url, partial.path())
        .map_err(|err| LipSyncError::Acquisition {
            resource: format!("{label} checkpoint"),
            reason: format!("download from {} failed: {err}", source.url),
        })?;

    if bytes == 0 {
        return Err(LipSyncError::Acquisition {
            resource: format!("{label} checkpoint"),
            reason: format!("download from {} was empty", source.url),
        });
    }

    let verified = match source.sha256.as_deref() {
        Some(expected) => {
            let actual = compute_file_hash(partial.path()).map_err(|err| {
                LipSyncError::filesystem(format!("hashing {}", partial.path().display()), err)
            })?;
            if !digests_match(expected, &actual) {
                return Err(LipSyncError::Integrity {
                    path: path.to_path_buf(),
                    expected: expected.to_string(),
                    actual,
                });
            }
            Some(actual)
        }
        None => None,
    };

    partial.persist(path).map_err(|err| {
        LipSyncError::filesystem(format!("moving download into {}", path.display()), err.error)
    })?;

    if let Some(digest) = verified {
        write_stamp(path, &digest)?;
    }

    services.events.emit(
        Level::Success,
        "provision.checkpoint.ready",
        &format!("{} checkpoint saved to {}", label, path.display()),
        Some(serde_json::json!({ "bytes": bytes })),
    );
    Ok(())
}

/// Copy `source` to `target` when `target` is missing or empty, or when
/// `refresh` is set because `source` was just replaced.
pub fn mirror_file(source: &Path, target: &Path, refresh: bool) -> Result<bool, LipSyncError> {
    if !refresh && file_present(target) {
        return Ok(false);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            LipSyncError::filesystem(format!("creating {}", parent.display()), err)
        })?;
    }
    fs::copy(source, target).map_err(|err| {
        LipSyncError::filesystem(
            format!("copying {} to {}", source.display(), target.display()),
            err,
        )
    })?;
    Ok(true)
}

/// Status of a cloned repository, including its HEAD commit when readable.
pub fn repo_status(label: &str, path: &Path) -> ResourceStatus {
    let present = path.is_dir();
    let detail = if present {
        git2::Repository::open(path)
            .ok()
            .and_then(|repo| {
                let commit = repo.head().ok()?.peel_to_commit().ok()?;
                let id = commit.id().to_string();
                Some(format!("HEAD {}", &id[..id.len().min(10)]))
            })
            .or_else(|| Some("not a git checkout".to_string()))
    } else {
        None
    };
    ResourceStatus {
        label: label.to_string(),
        path: path.to_path_buf(),
        present,
        detail,
    }
}

pub fn checkpoint_status(label: &str, path: &Path, source: &CheckpointSource) -> ResourceStatus {
    let size = fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len());
    let detail = size.map(|len| {
        let verification = match source.sha256.as_deref() {
            None => "no checksum",
            Some(expected) if stamp_matches(path, expected) => "verified",
            Some(_) => "unverified",
        };
        format!("{}, {}", format_size(len), verification)
    });
    ResourceStatus {
        label: label.to_string(),
        path: path.to_path_buf(),
        present: file_present(path),
        detail,
    }
}

pub fn directory_status(label: &str, path: &Path) -> ResourceStatus {
    let count = fs::read_dir(path).map(|entries| entries.count()).ok();
    ResourceStatus {
        label: label.to_string(),
        path: path.to_path_buf(),
        present: dir_has_entries(path),
        detail: count.map(|n| format!("{n} entries")),
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDownloader, FakeRunner, RecordingSink, sha256_hex};

    const URL: &str = "https://example.com/wav2lip.pth";

    fn services<'a>(
        runner: &'a FakeRunner,
        downloader: &'a FakeDownloader,
        sink: &'a RecordingSink,
    ) -> Services<'a> {
        Services {
            runner,
            downloader,
            events: sink,
        }
    }

    #[test]
    fn checksum_mismatch_is_an_integrity_error_and_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wav2lip.pth");
        let runner = FakeRunner::succeeding();
        let downloader = FakeDownloader::default().with_payload(URL, b"corrupted weights");
        let sink = RecordingSink::default();
        let source = CheckpointSource::new("wav2lip.pth", URL).with_sha256(sha256_hex(b"real"));

        let services = services(&runner, &downloader, &sink);
        let err = ensure_checkpoint(&services, &source, &path, "Wav2Lip").unwrap_err();

        match err {
            LipSyncError::Integrity {
                expected, actual, ..
            } => {
                assert_eq!(expected, sha256_hex(b"real"));
                assert_eq!(actual, sha256_hex(b"corrupted weights"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!checkpoint_ready(&path, &source));
        assert!(!file_present(&path));
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert!(leftovers.is_empty(), "partial download was not cleaned up");
    }

    #[test]
    fn verified_download_is_stamped_and_not_fetched_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wav2lip.pth");
        let runner = FakeRunner::succeeding();
        let downloader = FakeDownloader::default().with_payload(URL, b"weights");
        let sink = RecordingSink::default();
        let source = CheckpointSource::new("wav2lip.pth", URL).with_sha256(sha256_hex(b"weights"));
        let services = services(&runner, &downloader, &sink);

        assert!(ensure_checkpoint(&services, &source, &path, "Wav2Lip").unwrap());
        assert!(checkpoint_ready(&path, &source));
        assert!(!ensure_checkpoint(&services, &source, &path, "Wav2Lip").unwrap());
        assert_eq!(downloader.calls(), vec![URL.to_string()]);
    }

    #[test]
    fn existing_file_that_fails_verification_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s3fd.pth");
        fs::write(&path, b"truncated").unwrap();
        let runner = FakeRunner::succeeding();
        let downloader = FakeDownloader::default().with_payload(URL, b"detector");
        let sink = RecordingSink::default();
        let source = CheckpointSource::new("s3fd.pth", URL).with_sha256(sha256_hex(b"detector"));

        assert!(
            ensure_checkpoint(&services(&runner, &downloader, &sink), &source, &path, "S3FD")
                .unwrap()
        );
        assert_eq!(fs::read(&path).unwrap(), b"detector");
        assert!(sink.codes().contains(&"provision.checkpoint.corrupt".to_string()));
    }

    #[test]
    fn mirror_replaces_empty_copies_and_refreshes_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("s3fd.pth");
        let target = dir.path().join("repo/sfd/s3fd.pth");
        fs::write(&source, b"detector").unwrap();

        assert!(mirror_file(&source, &target, false).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"detector");
        assert!(!mirror_file(&source, &target, false).unwrap());

        fs::write(&target, b"").unwrap();
        assert!(mirror_file(&source, &target, false).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"detector");

        fs::write(&source, b"new detector").unwrap();
        assert!(mirror_file(&source, &target, true).unwrap());
        assert_eq!(fs::read(&target).unwrap(), b"new detector");
    }

    #[test]
    fn failed_download_is_an_acquisition_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wav2lip.pth");
        let runner = FakeRunner::succeeding();
        let downloader = FakeDownloader::default();
        let sink = RecordingSink::default();
        let source = CheckpointSource::new("wav2lip.pth", URL);

        let services = services(&runner, &downloader, &sink);
        let err = ensure_checkpoint(&services, &source, &path, "Wav2Lip").unwrap_err();
        assert!(matches!(err, LipSyncError::Acquisition { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn failed_clone_reports_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(|_| Some(128));
        let downloader = FakeDownloader::default();
        let sink = RecordingSink::default();

        let err = clone_repository(
            &services(&runner, &downloader, &sink),
            Path::new("git"),
            "https://github.com/Rudrabha/Wav2Lip.git",
            &dir.path().join("repo"),
            "Wav2Lip",
        )
        .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("git clone --depth 1 https://github.com/Rudrabha/Wav2Lip.git"));
        assert!(text.contains("code 128"));
    }

    #[test]
    fn empty_files_and_directories_are_not_present() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pth");
        fs::write(&empty, b"").unwrap();
        assert!(!file_present(&empty));
        assert!(!dir_has_entries(dir.path().join("missing").as_path()));

        let sub = dir.path().join("checkpoints");
        fs::create_dir(&sub).unwrap();
        assert!(!dir_has_entries(&sub));
        fs::write(sub.join("model.safetensors"), b"x").unwrap();
        assert!(dir_has_entries(&sub));
    }

    #[test]
    fn lock_can_be_taken_again_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::default();
        let first = lock_root(dir.path(), &sink).unwrap();
        drop(first);
        let _second = lock_root(dir.path(), &sink).unwrap();
        assert!(sink.codes().is_empty());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(435 * 1024 * 1024), "435.0 MiB");
    }
}
