//! Subcommand handlers. Everything here works in `anyhow::Result`; the
//! pipeline's typed errors pass through untouched so `main` can categorise
//! them.

use anyhow::{Context, Result, bail};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use std::env;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use crate::cli::{
    Cli, Commands, ConfigArgs, ConflictsArgs, DepsArgs, ProvisionArgs, ResourcesArgs, RunArgs,
};
use crate::common::paths;
use crate::config::LipSyncConfig;
use crate::conflicts::find_conflicts;
use crate::deps::{DEFAULT_PACKAGES, ensure_dependencies, missing_packages};
use crate::download::HttpDownloader;
use crate::engine::{Engine, Services};
use crate::error::LipSyncError;
use crate::pipeline::{LipSyncPipeline, PipelineConfig};
use crate::provision::ResourceStatus;
use crate::runner::SystemRunner;
use crate::ui::prelude::*;

pub fn dispatch(cli: Cli, sink: &ConsoleSink) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => handle_run(args, config_path, sink),
        Commands::Provision(args) => handle_provision(args, config_path, sink),
        Commands::Resources(args) => handle_resources(args, config_path, sink),
        Commands::Deps(args) => handle_deps(args, config_path, sink),
        Commands::Conflicts(args) => handle_conflicts(args, sink),
        Commands::Config(args) => handle_config(args, config_path, sink),
    }
}

fn load_pipeline_config(config_path: Option<&Path>) -> Result<PipelineConfig> {
    let config = LipSyncConfig::load(config_path)?;
    Ok(config.to_pipeline_config()?)
}

fn set_cache_dir(config: &mut PipelineConfig, engine: Engine, dir: &Path) {
    let root = paths::expand_path(&dir.to_string_lossy());
    match engine {
        Engine::SadTalker => config.sadtalker.resources.root_dir = root,
        Engine::Wav2Lip => config.wav2lip.resources.root_dir = root,
    }
}

/// Fold command line overrides into the configured pipeline.
fn apply_run_args(config: &mut PipelineConfig, args: &RunArgs) -> Result<()> {
    if let Some(engine) = args.engine {
        config.engine = engine;
    }
    if let Some(dir) = &args.cache_dir {
        set_cache_dir(config, config.engine, dir);
    }
    if let Some(fps) = args.fps {
        config.fps = fps;
    }
    if let Some(resolution) = args.resolution {
        config.resolution = resolution;
    }
    if args.no_upscale {
        config.upscale_to_1080p = false;
    }
    if args.keep_temp {
        config.keep_intermediate = true;
    }

    let sadtalker = &mut config.sadtalker.settings;
    if let Some(preprocess) = args.sadtalker.preprocess {
        sadtalker.preprocess = preprocess;
    }
    if let Some(scale) = args.sadtalker.expression_scale {
        sadtalker.expression_scale = scale;
    }
    if args.sadtalker.no_still {
        sadtalker.still_mode = false;
    }
    if let Some(enhancer) = &args.sadtalker.enhancer {
        sadtalker.enhancer = Some(enhancer.clone());
    }

    let wav2lip = &mut config.wav2lip.settings;
    if let Some(static_mode) = args.wav2lip.static_mode() {
        wav2lip.static_mode = static_mode;
    }
    if args.wav2lip.wav2lip_nosmooth {
        wav2lip.nosmooth = true;
    }
    if let Some(size) = args.wav2lip.wav2lip_batch_size {
        wav2lip.wav2lip_batch_size = Some(size);
    }
    if let Some(size) = args.wav2lip.wav2lip_face_det_batch_size {
        wav2lip.face_det_batch_size = Some(size);
    }
    if let Some(factor) = args.wav2lip.wav2lip_resize_factor {
        wav2lip.resize_factor = factor;
    }
    if let Some(crop) = &args.wav2lip.wav2lip_crop {
        wav2lip.crop = Some(four_values(crop, "--wav2lip-crop")?);
    }
    if let Some(pads) = &args.wav2lip.wav2lip_pads {
        wav2lip.pads = four_values(pads, "--wav2lip-pads")?;
    }
    Ok(())
}

fn four_values(values: &[i32], flag: &str) -> Result<[i32; 4]> {
    values.try_into().map_err(|_| {
        LipSyncError::Configuration(format!(
            "{flag} takes exactly 4 values, got {}",
            values.len()
        ))
        .into()
    })
}

/// Make sure the external programs a run needs can be found on PATH.
fn preflight(config: &PipelineConfig) -> Result<(), LipSyncError> {
    let mut required: Vec<(&str, &Path)> = vec![("python", config.tools.python.as_path())];
    if !config.backend().repo_present() {
        required.push(("git", config.tools.git.as_path()));
    }
    if config.upscale_to_1080p {
        required.push(("ffmpeg", config.tools.ffmpeg.as_path()));
    }

    let missing: Vec<String> = required
        .into_iter()
        .filter(|(_, program)| which::which(program).is_err())
        .map(|(role, program)| format!("{role} ({})", program.display()))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(LipSyncError::Configuration(format!(
            "required programs not found on PATH: {}",
            missing.join(", ")
        )))
    }
}

fn show_progress(sink: &ConsoleSink) -> bool {
    !sink.is_json() && io::stderr().is_terminal()
}

fn handle_run(args: RunArgs, config_path: Option<&Path>, sink: &ConsoleSink) -> Result<()> {
    let mut config = load_pipeline_config(config_path)?;
    apply_run_args(&mut config, &args)?;
    config.validate()?;
    preflight(&config)?;

    let runner = SystemRunner;
    let downloader = HttpDownloader::new(show_progress(sink)).context("creating HTTP client")?;
    let services = Services {
        runner: &runner,
        downloader: &downloader,
        events: sink,
    };

    if args.install_deps {
        ensure_dependencies(&services, &config.tools.python, DEFAULT_PACKAGES)?;
    }

    let pipeline = LipSyncPipeline::new(config, services);
    let output = pipeline.run(&args.image, &args.audio, &args.output)?;
    sink.emit(
        Level::Success,
        "run.complete",
        &format!("Lip-synced video saved to {}", output.display()),
        Some(serde_json::json!({ "output": output.display().to_string() })),
    );
    Ok(())
}

fn handle_provision(
    args: ProvisionArgs,
    config_path: Option<&Path>,
    sink: &ConsoleSink,
) -> Result<()> {
    let mut config = load_pipeline_config(config_path)?;
    if let Some(resolution) = args.resolution {
        config.resolution = resolution;
    }
    let engines: Vec<Engine> = if args.all {
        Engine::ALL.to_vec()
    } else {
        vec![args.engine.unwrap_or(config.engine)]
    };
    if let (Some(dir), [engine]) = (&args.cache_dir, engines.as_slice()) {
        set_cache_dir(&mut config, *engine, dir);
    }

    let runner = SystemRunner;
    let downloader = HttpDownloader::new(show_progress(sink)).context("creating HTTP client")?;
    let services = Services {
        runner: &runner,
        downloader: &downloader,
        events: sink,
    };

    for engine in engines {
        config.engine = engine;
        config.validate()?;
        config
            .backend()
            .ensure(&services, &config.tools, &config.provision_options())?;
    }
    Ok(())
}

fn handle_resources(
    args: ResourcesArgs,
    config_path: Option<&Path>,
    sink: &ConsoleSink,
) -> Result<()> {
    let config = load_pipeline_config(config_path)?;
    let engines: Vec<Engine> = match args.engine {
        Some(engine) => vec![engine],
        None => Engine::ALL.to_vec(),
    };

    let rows: Vec<(Engine, ResourceStatus)> = engines
        .into_iter()
        .flat_map(|engine| {
            config
                .backend_for(engine)
                .status()
                .into_iter()
                .map(move |status| (engine, status))
        })
        .collect();

    if sink.is_json() {
        for (engine, status) in &rows {
            sink.emit(
                Level::Info,
                "resources.status",
                &status.label,
                Some(serde_json::json!({ "engine": engine, "status": status })),
            );
        }
        return Ok(());
    }

    println!("{}", render_resource_table(&rows));
    Ok(())
}

fn render_resource_table(rows: &[(Engine, ResourceStatus)]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Engine", "Resource", "Present", "Path", "Details"]);
    for (engine, status) in rows {
        table.add_row(vec![
            engine.display_name().to_string(),
            status.label.clone(),
            if status.present { "yes" } else { "no" }.to_string(),
            status.path.display().to_string(),
            status.detail.clone().unwrap_or_default(),
        ]);
    }
    table
}

fn handle_deps(args: DepsArgs, config_path: Option<&Path>, sink: &ConsoleSink) -> Result<()> {
    let config = load_pipeline_config(config_path)?;
    let runner = SystemRunner;
    let downloader = HttpDownloader::new(false).context("creating HTTP client")?;
    let services = Services {
        runner: &runner,
        downloader: &downloader,
        events: sink,
    };

    if args.install {
        ensure_dependencies(&services, &config.tools.python, DEFAULT_PACKAGES)?;
        return Ok(());
    }

    let missing = missing_packages(&services, &config.tools.python, DEFAULT_PACKAGES)?;
    if missing.is_empty() {
        sink.emit(
            Level::Success,
            "deps.satisfied",
            "All Python dependencies are installed",
            None,
        );
    } else {
        let names: Vec<&str> = missing.iter().map(|p| p.name).collect();
        sink.emit(
            Level::Warn,
            "deps.missing",
            &format!(
                "Missing Python packages: {} (run `lipsync deps --install`)",
                names.join(", ")
            ),
            Some(serde_json::json!({ "packages": names })),
        );
    }
    Ok(())
}

fn handle_conflicts(args: ConflictsArgs, sink: &ConsoleSink) -> Result<()> {
    let cwd = env::current_dir().context("reading current directory")?;
    let roots: Vec<PathBuf> = if args.paths.is_empty() {
        vec![cwd.clone()]
    } else {
        args.paths.clone()
    };

    let conflicts = find_conflicts(&roots, &args.exclude);
    if conflicts.is_empty() {
        sink.emit(
            Level::Success,
            "conflicts.none",
            "No unresolved merge conflict markers found.",
            None,
        );
        return Ok(());
    }

    for conflict in &conflicts {
        let shown = conflict.path.strip_prefix(&cwd).unwrap_or(&conflict.path);
        sink.emit(
            Level::Warn,
            "conflicts.marker",
            &format!(
                "{}:{}: contains '{}' marker",
                shown.display(),
                conflict.line_number,
                conflict.marker
            ),
            Some(serde_json::json!(conflict)),
        );
    }

    if args.fail_on_found {
        bail!("found {} unresolved conflict marker(s)", conflicts.len());
    }
    Ok(())
}

fn handle_config(args: ConfigArgs, config_path: Option<&Path>, sink: &ConsoleSink) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => paths::default_config_path()?,
    };
    let config = LipSyncConfig::load_from_path(&path)?;

    if args.init {
        if path.exists() && !args.force {
            bail!(
                "{} already exists; pass --force to overwrite it",
                path.display()
            );
        }
        config.save_to_path(&path)?;
        sink.emit(
            Level::Success,
            "config.written",
            &format!("Wrote configuration to {}", path.display()),
            None,
        );
        return Ok(());
    }

    if sink.is_json() {
        sink.emit(
            Level::Info,
            "config.effective",
            &path.display().to_string(),
            Some(serde_json::to_value(&config).context("serializing lipsync config")?),
        );
    } else {
        println!("# {}", path.display());
        print!("{}", config.to_toml()?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{SadTalkerArgs, Wav2LipArgs};

    fn run_args() -> RunArgs {
        RunArgs {
            image: PathBuf::from("face.png"),
            audio: PathBuf::from("voice.wav"),
            output: PathBuf::from("out.mp4"),
            engine: None,
            cache_dir: None,
            fps: None,
            resolution: None,
            no_upscale: false,
            keep_temp: false,
            install_deps: false,
            sadtalker: SadTalkerArgs::default(),
            wav2lip: Wav2LipArgs::default(),
        }
    }

    #[test]
    fn flags_override_configured_values() {
        let mut config = PipelineConfig::default();
        let mut args = run_args();
        args.engine = Some(Engine::Wav2Lip);
        args.cache_dir = Some(PathBuf::from("/srv/wav2lip"));
        args.fps = Some(30);
        args.no_upscale = true;
        args.wav2lip.wav2lip_crop = Some(vec![0, 0, 100, 100]);
        args.wav2lip.wav2lip_resize_factor = Some(0.5);
        args.wav2lip.wav2lip_no_static = true;

        apply_run_args(&mut config, &args).unwrap();

        assert_eq!(config.engine, Engine::Wav2Lip);
        assert_eq!(config.wav2lip.resources.root_dir, PathBuf::from("/srv/wav2lip"));
        assert_ne!(
            config.sadtalker.resources.root_dir,
            PathBuf::from("/srv/wav2lip")
        );
        assert_eq!(config.fps, 30);
        assert!(!config.upscale_to_1080p);
        assert_eq!(config.wav2lip.settings.crop, Some([0, 0, 100, 100]));
        assert_eq!(config.wav2lip.settings.resize_factor, 0.5);
        assert!(!config.wav2lip.settings.static_mode);
    }

    #[test]
    fn unset_flags_leave_configuration_alone() {
        let mut config = PipelineConfig::default();
        config.wav2lip.settings.nosmooth = true;
        apply_run_args(&mut config, &run_args()).unwrap();

        let mut expected = PipelineConfig::default();
        expected.wav2lip.settings.nosmooth = true;
        assert_eq!(config, expected);
    }

    #[test]
    fn preflight_reports_missing_programs() {
        let mut config = PipelineConfig::default();
        config.tools.ffmpeg = PathBuf::from("lipsync-missing-ffmpeg");
        let err = preflight(&config).unwrap_err();
        assert!(err.to_string().contains("ffmpeg (lipsync-missing-ffmpeg)"));

        config.upscale_to_1080p = false;
        if let Err(err) = preflight(&config) {
            assert!(!err.to_string().contains("ffmpeg"));
        }
    }

    #[test]
    fn resource_table_lists_every_row() {
        let rows = vec![(
            Engine::Wav2Lip,
            ResourceStatus {
                label: "Wav2Lip checkpoint".into(),
                path: PathBuf::from("/cache/wav2lip/checkpoints/wav2lip.pth"),
                present: false,
                detail: None,
            },
        )];
        let rendered = render_resource_table(&rows).to_string();
        assert!(rendered.contains("Wav2Lip checkpoint"));
        assert!(rendered.contains("no"));
    }
}
