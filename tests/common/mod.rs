use anyhow::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch tree with stand-in `git`, `python3` and `ffmpeg` scripts and a
/// config file pointing lipsync at them.
pub struct TestEnvironment {
    temp_dir: TempDir,
}

const FAKE_GIT: &str = r##"#!/bin/sh
echo "git $*" >> "__LOG__"
for target; do :; done
mkdir -p "$target/scripts"
echo "# helper" > "$target/scripts/download_models.py"
"##;

const FAKE_PYTHON: &str = r##"#!/bin/sh
echo "python $*" >> "__LOG__"
script="$1"
shift
case "$script" in
  *download_models.py)
    while [ $# -gt 0 ]; do
      if [ "$1" = "--model_folder" ]; then
        mkdir -p "$2"
        echo weights > "$2/SadTalker_V0.0.2_512.safetensors"
      fi
      shift
    done
    ;;
  *inference.py)
    if [ -n "$LIPSYNC_FAKE_INFERENCE_EXIT" ]; then
      exit "$LIPSYNC_FAKE_INFERENCE_EXIT"
    fi
    while [ $# -gt 0 ]; do
      case "$1" in
        --result_dir) echo video > "$2/2024_01_01_00.00.00.mp4" ;;
        --outfile) echo video > "$2" ;;
      esac
      shift
    done
    ;;
esac
exit 0
"##;

const FAKE_FFMPEG: &str = r##"#!/bin/sh
echo "ffmpeg $*" >> "__LOG__"
for last; do :; done
echo upscaled > "$last"
"##;

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        let env = Self {
            temp_dir: tempfile::tempdir()?,
        };
        fs::create_dir_all(env.bin_dir())?;
        fs::create_dir_all(env.media_dir())?;
        env.write_tool("git", FAKE_GIT)?;
        env.write_tool("python3", FAKE_PYTHON)?;
        env.write_tool("ffmpeg", FAKE_FFMPEG)?;
        fs::write(env.image(), b"portrait")?;
        fs::write(env.audio(), b"speech")?;
        env.write_config()?;
        Ok(env)
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.path().join("bin")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.path().join("media")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.path().join("cache")
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("config.toml")
    }

    pub fn log_path(&self) -> PathBuf {
        self.path().join("invocations.log")
    }

    pub fn image(&self) -> PathBuf {
        self.media_dir().join("face.png")
    }

    pub fn audio(&self) -> PathBuf {
        self.media_dir().join("voice.wav")
    }

    /// Lines written by the fake tools, one per invocation.
    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Lay out Wav2Lip's repository and checkpoints so no download happens.
    pub fn provision_wav2lip(&self) -> Result<()> {
        let root = self.cache_dir().join("wav2lip");
        let sfd = root.join("repo/face_detection/detection/sfd");
        fs::create_dir_all(&sfd)?;
        fs::create_dir_all(root.join("checkpoints"))?;
        fs::write(root.join("checkpoints/wav2lip.pth"), b"lipsync weights")?;
        fs::write(root.join("checkpoints/s3fd.pth"), b"detector weights")?;
        fs::write(sfd.join("s3fd.pth"), b"detector weights")?;
        Ok(())
    }

    fn write_tool(&self, name: &str, script: &str) -> Result<()> {
        let path = self.bin_dir().join(name);
        let log = self.log_path();
        fs::write(&path, script.replace("__LOG__", &log.to_string_lossy()))?;
        let mut permissions = fs::metadata(&path)?.permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions)?;
        Ok(())
    }

    fn write_config(&self) -> Result<()> {
        let bin = self.bin_dir();
        let cache = self.cache_dir();
        let config = format!(
            r#"engine = "sadtalker"

[tools]
python = "{python}"
git = "{git}"
ffmpeg = "{ffmpeg}"

[sadtalker]
cache_dir = "{sadtalker}"

[wav2lip]
cache_dir = "{wav2lip}"
"#,
            python = bin.join("python3").display(),
            git = bin.join("git").display(),
            ffmpeg = bin.join("ffmpeg").display(),
            sadtalker = cache.join("sadtalker").display(),
            wav2lip = cache.join("wav2lip").display(),
        );
        fs::write(self.config_path(), config)?;
        Ok(())
    }
}
