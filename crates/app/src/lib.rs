use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use glacier_core::architecture::TrainConfig;
use glacier_core::backend::{ExecutionContext, InferenceBackend};
use glacier_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig, InferenceConfig,
};
use glacier_core::engine::{self, InferenceOptions};
use glacier_core::export::{write_outputs, OutputNames, DEFAULT_PNG_CHANNELS};
use glacier_core::geotiff::read_geotiff;
use glacier_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use glacier_core::model::OnnxSegmentationModel;
use glacier_core::preprocess::{ChannelPipeline, TilePreprocessor};
use glacier_core::runtime;
use glacier_core::tiling::{next_multiple, StitchStrategy};

#[derive(Parser)]
#[command(
    name = "glacier-mapping",
    about = "Tiled glacier segmentation of multi-band GeoTIFF rasters"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory holding config.toml, logs and caches")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment a raster and write the GeoTIFF and PNG products.
    Infer(InferArgs),
    /// Show the padded extent and tile grid for a raster without running a model.
    Plan(PlanArgs),
}

#[derive(Args, Debug, Clone)]
struct TilingArgs {
    #[arg(long, help = "Tile edge length in pixels [config: inference.tile_size]")]
    tile_size: Option<usize>,
    #[arg(long, help = "Overlap between neighbouring tiles [config: inference.overlap]")]
    overlap: Option<usize>,
}

#[derive(Args, Debug)]
struct InferArgs {
    #[arg(short = 'm', long, help = "Exported ONNX model")]
    model: PathBuf,
    #[arg(short = 'i', long, help = "GeoTIFF to draw inference on")]
    input: PathBuf,
    #[arg(
        short = 't',
        long = "train-conf",
        help = "Training config (TOML or JSON) used to validate channel counts"
    )]
    train_conf: Option<PathBuf>,
    #[arg(
        short = 'p',
        long = "process-conf",
        help = "Preprocessing config (TOML or JSON)"
    )]
    process_conf: PathBuf,
    #[arg(
        short = 'c',
        long,
        value_delimiter = ',',
        help = "Raw raster channels for the input PNG [default: 2,4,5]"
    )]
    channels: Option<Vec<usize>>,
    #[arg(short = 'o', long = "output-dir", help = "Output directory [config: paths.output_dir]")]
    output_dir: Option<PathBuf>,
    #[command(flatten)]
    tiling: TilingArgs,
    #[arg(long, help = "overwrite, average or max [config: inference.stitch]")]
    stitch: Option<String>,
    #[arg(long, help = "cpu, cuda or tensorrt [config: inference.backend]")]
    backend: Option<String>,
    #[arg(long, help = "Accelerator index [config: inference.device_id]")]
    device_id: Option<i32>,
    #[arg(long, help = "Tile worker threads [config: inference.workers]")]
    workers: Option<usize>,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[arg(short = 'i', long, help = "GeoTIFF to plan tiles for")]
    input: PathBuf,
    #[command(flatten)]
    tiling: TilingArgs,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let lib_status = runtime::setup_runtime_libs(Some(resolved_data_dir.as_path()));
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    runtime::log_runtime_lib_status(&lib_status);
    log_startup_metadata(&resolved_data_dir);

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = AppConfig::load_from_path(&config_path(&resolved_data_dir))?;

    match cli.command {
        Commands::Infer(args) => run_infer(args, &config, &resolved_data_dir),
        Commands::Plan(args) => run_plan(args, &config),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_logging_filters(&init_options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console_filter, "console"));

    let file_sink = logging::build_file_sink_plan(&init_options);
    let fallback_reason = file_sink.fallback_reason().map(ToString::to_string);
    let attempted_log_dir = file_sink
        .log_dir()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<none>".to_string());

    let file_layer = match file_sink {
        FileSinkPlan::Ready { appender, .. } => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file_filter, "file")),
        ),
        FileSinkPlan::Fallback { .. } => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(reason) = fallback_reason {
        warn!(
            attempted_log_dir = %attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// CLI flags win over `[inference]` in config.toml.
fn inference_options(
    config: &InferenceConfig,
    tiling: &TilingArgs,
    stitch: Option<&str>,
    workers: Option<usize>,
) -> Result<InferenceOptions> {
    let stitch = match stitch {
        Some(name) => name.parse::<StitchStrategy>()?,
        None => config.stitch,
    };
    Ok(InferenceOptions {
        tile_size: tiling.tile_size.unwrap_or(config.tile_size),
        overlap: tiling.overlap.unwrap_or(config.overlap),
        pad_multiple: config.pad_multiple,
        stitch,
        workers: workers.unwrap_or(config.workers).max(1),
    })
}

fn execution_context(
    args: &InferArgs,
    config: &AppConfig,
    data_dir: &Path,
) -> Result<ExecutionContext> {
    let backend = match args.backend.as_deref() {
        Some(name) => name.parse::<InferenceBackend>()?,
        None => config.inference.backend,
    };
    Ok(ExecutionContext {
        backend,
        device_id: args.device_id.unwrap_or(config.inference.device_id),
        trt_cache_dir: Some(resolve_relative_to(data_dir, &config.paths.trt_cache_dir)),
    })
}

/// A model path that does not exist as given is looked up under `paths.models_dir`.
fn resolve_model_path(model: &Path, config: &AppConfig, data_dir: &Path) -> PathBuf {
    if model.exists() || model.is_absolute() {
        return model.to_path_buf();
    }
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let candidate = models_dir.join(model);
    if candidate.exists() {
        debug!(model = %candidate.display(), "Resolved model under models_dir");
        candidate
    } else {
        model.to_path_buf()
    }
}

fn run_infer(args: InferArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let started = Instant::now();

    // Configuration problems surface before any raster is touched.
    let pipeline = ChannelPipeline::load(&args.process_conf)?;
    let model_spec = match &args.train_conf {
        Some(path) => {
            let spec = TrainConfig::load_from_path(path)?.model_spec()?;
            spec.check_input_channels(pipeline.output_channels())?;
            info!(
                architecture = %spec.architecture,
                in_channels = spec.in_channels,
                out_channels = spec.out_channels,
                "Validated training config"
            );
            Some(spec)
        }
        None => None,
    };

    let options = inference_options(
        &config.inference,
        &args.tiling,
        args.stitch.as_deref(),
        args.workers,
    )?;
    let context = execution_context(&args, config, data_dir)?;
    let model_path = resolve_model_path(&args.model, config, data_dir);

    info!(input = %args.input.display(), "Loading raster");
    let raster = read_geotiff(&args.input)?;
    let layout = engine::plan(raster.height(), raster.width(), &options)?;

    let mut model = OnnxSegmentationModel::load(
        &model_path,
        &context,
        Some((layout.tile_height, layout.tile_width)),
        model_spec.as_ref().map(|spec| spec.out_channels),
    )?;

    info!("Making predictions");
    let output = engine::infer(raster.to_hwc().view(), &mut model, &pipeline, &options)?;

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| resolve_relative_to(data_dir, &config.paths.output_dir));
    let names = OutputNames::new(&args.input, &model_path, &args.process_conf);
    let png_channels = args
        .channels
        .clone()
        .unwrap_or_else(|| DEFAULT_PNG_CHANNELS.to_vec());
    let written = write_outputs(&output_dir, &names, &raster, &output, &png_channels)
        .context("failed to write inference outputs")?;

    for path in &written {
        info!(path = %path.display(), "Wrote");
    }
    info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Inference completed successfully"
    );
    Ok(())
}

fn run_plan(args: PlanArgs, config: &AppConfig) -> Result<()> {
    let options = inference_options(&config.inference, &args.tiling, None, None)?;
    let raster = read_geotiff(&args.input)?;
    let (height, width) = (raster.height(), raster.width());
    let layout = engine::plan(height, width, &options)?;
    let (covered_h, covered_w) = layout.covered_extent();
    let (step_h, step_w) = layout.step();

    info!(
        height,
        width,
        channels = raster.channels(),
        padded_height = next_multiple(height, options.pad_multiple),
        padded_width = next_multiple(width, options.pad_multiple),
        rows = layout.rows,
        cols = layout.cols,
        tile_height = layout.tile_height,
        tile_width = layout.tile_width,
        step_h,
        step_w,
        covered_h,
        covered_w,
        "Tile plan"
    );
    if covered_h < height || covered_w < width {
        warn!("Tile grid does not reach the raster edge; uncovered area will be zero");
    }
    if let Some(epsg) = raster.meta.epsg() {
        info!(epsg, "Raster CRS");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glacier_core::PipelineError;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("valid command line")
    }

    #[test]
    fn infer_accepts_short_flags_and_channel_list() {
        let cli = parse(&[
            "glacier-mapping",
            "-v",
            "infer",
            "-m",
            "model.onnx",
            "-i",
            "scene.tif",
            "-p",
            "postprocess.toml",
            "-c",
            "1,2,3",
            "--overlap",
            "64",
        ]);
        assert_eq!(cli.verbose, 1);
        let Commands::Infer(args) = cli.command else {
            panic!("expected infer");
        };
        assert_eq!(args.model, PathBuf::from("model.onnx"));
        assert_eq!(args.channels, Some(vec![1, 2, 3]));
        assert_eq!(args.tiling.overlap, Some(64));
        assert!(args.train_conf.is_none());
    }

    #[test]
    fn infer_requires_process_conf() {
        assert!(Cli::try_parse_from([
            "glacier-mapping",
            "infer",
            "-m",
            "model.onnx",
            "-i",
            "scene.tif"
        ])
        .is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = parse(&[
            "glacier-mapping",
            "plan",
            "-i",
            "scene.tif",
            "--log-filter",
            "glacier_core=trace",
            "--data-dir",
            "/tmp/glacier",
        ]);
        assert_eq!(cli.log_filter.as_deref(), Some("glacier_core=trace"));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/glacier")));
        assert!(matches!(cli.command, Commands::Plan(_)));
    }

    #[test]
    fn cli_flags_override_config() {
        let config = InferenceConfig::default();
        let tiling = TilingArgs {
            tile_size: Some(512),
            overlap: None,
        };
        let options = inference_options(&config, &tiling, Some("average"), Some(0)).unwrap();
        assert_eq!(options.tile_size, 512);
        assert_eq!(options.overlap, config.overlap);
        assert_eq!(options.stitch, StitchStrategy::Average);
        assert_eq!(options.workers, 1);
        assert_eq!(options.pad_multiple, 512);
    }

    #[test]
    fn config_defaults_fill_missing_flags() {
        let config = InferenceConfig {
            tile_size: 768,
            overlap: 32,
            stitch: StitchStrategy::Max,
            workers: 3,
            ..InferenceConfig::default()
        };
        let tiling = TilingArgs {
            tile_size: None,
            overlap: None,
        };
        let options = inference_options(&config, &tiling, None, None).unwrap();
        assert_eq!(options.tile_size, 768);
        assert_eq!(options.overlap, 32);
        assert_eq!(options.stitch, StitchStrategy::Max);
        assert_eq!(options.workers, 3);
    }

    #[test]
    fn execution_context_resolves_cache_under_data_dir() {
        let cli = parse(&[
            "glacier-mapping",
            "infer",
            "-m",
            "m.onnx",
            "-i",
            "x.tif",
            "-p",
            "p.toml",
            "--backend",
            "trt",
            "--device-id",
            "1",
        ]);
        let Commands::Infer(args) = cli.command else {
            panic!("expected infer");
        };
        let ctx = execution_context(&args, &AppConfig::default(), Path::new("/data")).unwrap();
        assert_eq!(ctx.backend, InferenceBackend::Tensorrt);
        assert_eq!(ctx.device_id, 1);
        assert_eq!(ctx.trt_cache_dir, Some(PathBuf::from("/data/trt_cache")));
    }

    #[test]
    fn misspelled_stitch_flag_is_rejected() {
        let tiling = TilingArgs {
            tile_size: None,
            overlap: None,
        };
        let err = inference_options(&InferenceConfig::default(), &tiling, Some("avrage"), None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn misspelled_backend_flag_is_rejected() {
        let cli = parse(&[
            "glacier-mapping",
            "infer",
            "-m",
            "m.onnx",
            "-i",
            "x.tif",
            "-p",
            "p.toml",
            "--backend",
            "cpuu",
        ]);
        let Commands::Infer(args) = cli.command else {
            panic!("expected infer");
        };
        let err = execution_context(&args, &AppConfig::default(), Path::new("/data")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
        assert!(err.to_string().contains("cpuu"));
    }

    #[test]
    fn model_path_falls_back_to_models_dir() {
        let data = tempfile::tempdir().unwrap();
        let models = data.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(models.join("unet_best.onnx"), b"onnx").unwrap();

        let config = AppConfig::default();
        assert_eq!(
            resolve_model_path(Path::new("unet_best.onnx"), &config, data.path()),
            models.join("unet_best.onnx")
        );
        assert_eq!(
            resolve_model_path(Path::new("missing.onnx"), &config, data.path()),
            PathBuf::from("missing.onnx")
        );
    }
}
