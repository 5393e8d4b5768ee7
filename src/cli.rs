use clap::{Args, Parser, Subcommand, ValueHint};
use std::path::PathBuf;

use crate::conflicts::DEFAULT_EXCLUDES;
use crate::engine::{Engine, Preprocess};
use crate::ui::OutputFormat;

/// Generate lip-synced portrait videos with SadTalker or Wav2Lip
#[derive(Parser, Debug)]
#[command(name = "lipsync", author, version, about, long_about = None)]
pub struct Cli {
    /// Show debug events
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Event output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Config file to use instead of ~/.config/lipsync/config.toml
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a lip-synced video from an image and an audio clip
    Run(RunArgs),
    /// Download backend repositories and checkpoints ahead of time
    Provision(ProvisionArgs),
    /// Show which backend resources are present in the cache
    Resources(ResourcesArgs),
    /// Check (and optionally install) the Python packages the backends need
    Deps(DepsArgs),
    /// Scan files for unresolved git merge conflict markers
    Conflicts(ConflictsArgs),
    /// Print the effective configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Input portrait image
    #[arg(value_hint = ValueHint::FilePath)]
    pub image: PathBuf,

    /// Input speech audio
    #[arg(value_hint = ValueHint::FilePath)]
    pub audio: PathBuf,

    /// Where to write the generated video
    #[arg(value_hint = ValueHint::FilePath)]
    pub output: PathBuf,

    /// Backend used for lip-sync generation
    #[arg(long, value_enum)]
    pub engine: Option<Engine>,

    /// Directory caching the engine's repository and checkpoints
    #[arg(long, value_hint = ValueHint::DirPath)]
    pub cache_dir: Option<PathBuf>,

    /// Frames per second of the generated video
    #[arg(long)]
    pub fps: Option<u32>,

    /// Generation resolution before upscaling (256 or 512)
    #[arg(long)]
    pub resolution: Option<u32>,

    /// Skip the final 1080p upscale
    #[arg(long)]
    pub no_upscale: bool,

    /// Keep intermediate files next to the output
    #[arg(long)]
    pub keep_temp: bool,

    /// Install missing Python packages before running
    #[arg(long)]
    pub install_deps: bool,

    #[command(flatten)]
    pub sadtalker: SadTalkerArgs,

    #[command(flatten)]
    pub wav2lip: Wav2LipArgs,
}

#[derive(Args, Debug, Clone, Default)]
#[command(next_help_heading = "SadTalker options")]
pub struct SadTalkerArgs {
    /// Preprocessing mode passed to SadTalker
    #[arg(long, value_enum)]
    pub preprocess: Option<Preprocess>,

    /// Expression scale (higher gives bigger motion)
    #[arg(long)]
    pub expression_scale: Option<f64>,

    /// Disable still mode for more head motion
    #[arg(long)]
    pub no_still: bool,

    /// Face enhancer, e.g. gfpgan
    #[arg(long)]
    pub enhancer: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
#[command(next_help_heading = "Wav2Lip options")]
pub struct Wav2LipArgs {
    /// Treat the face input as a single static image
    #[arg(long, overrides_with = "wav2lip_no_static")]
    pub wav2lip_static: bool,

    /// Allow dynamic face input
    #[arg(long, overrides_with = "wav2lip_static")]
    pub wav2lip_no_static: bool,

    /// Disable face box smoothing
    #[arg(long)]
    pub wav2lip_nosmooth: bool,

    /// Batch size for the lip-sync model
    #[arg(long)]
    pub wav2lip_batch_size: Option<u32>,

    /// Batch size for the face detector
    #[arg(long)]
    pub wav2lip_face_det_batch_size: Option<u32>,

    /// Resize factor applied to frames before inference
    #[arg(long)]
    pub wav2lip_resize_factor: Option<f64>,

    /// Crop rectangle
    #[arg(
        long,
        num_args = 4,
        value_names = ["X1", "Y1", "X2", "Y2"],
        allow_negative_numbers = true
    )]
    pub wav2lip_crop: Option<Vec<i32>>,

    /// Padding around the detected face
    #[arg(
        long,
        num_args = 4,
        value_names = ["TOP", "BOTTOM", "LEFT", "RIGHT"],
        allow_negative_numbers = true
    )]
    pub wav2lip_pads: Option<Vec<i32>>,
}

impl Wav2LipArgs {
    /// `Some(true)` / `Some(false)` when a static flag was given.
    pub fn static_mode(&self) -> Option<bool> {
        if self.wav2lip_no_static {
            Some(false)
        } else if self.wav2lip_static {
            Some(true)
        } else {
            None
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProvisionArgs {
    /// Engine to provision (defaults to the configured engine)
    #[arg(long, value_enum, conflicts_with = "all")]
    pub engine: Option<Engine>,

    /// Provision both engines
    #[arg(long)]
    pub all: bool,

    /// Resolution forwarded to the SadTalker checkpoint helper
    #[arg(long)]
    pub resolution: Option<u32>,

    /// Cache directory override for the provisioned engine
    #[arg(long, value_hint = ValueHint::DirPath, conflicts_with = "all")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ResourcesArgs {
    /// Only show this engine
    #[arg(long, value_enum)]
    pub engine: Option<Engine>,
}

#[derive(Args, Debug, Clone)]
pub struct DepsArgs {
    /// Install the missing packages with pip
    #[arg(long)]
    pub install: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ConflictsArgs {
    /// Files or directories to scan (defaults to the current directory)
    #[arg(value_hint = ValueHint::AnyPath)]
    pub paths: Vec<PathBuf>,

    /// Exit with an error when markers are found
    #[arg(long)]
    pub fail_on_found: bool,

    /// Directory names to skip
    #[arg(long, num_args = 0.., default_values = DEFAULT_EXCLUDES)]
    pub exclude: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Write the effective configuration to the config file
    #[arg(long)]
    pub init: bool,

    /// Overwrite an existing config file with --init
    #[arg(long, requires = "init")]
    pub force: bool,
}
