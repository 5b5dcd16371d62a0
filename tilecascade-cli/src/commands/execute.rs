//! The `execute` command: run a batch into a tile directory.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use tilecascade::batch::BatchScheduler;
use tilecascade::config::{BatchConfig, OverviewOptions, RetrySettings, ZoomLevels};
use tilecascade::grid::{Bounds, GridKind, TilePyramid};
use tilecascade::io::DirectoryOutput;
use tilecascade::process::{
    ProcessContext, ProcessError, ProcessOutput, ProcessRegistry, TileProcessor,
};
use tilecascade::raster::{ResamplingMethod, TileData};
use tilecascade::task::TaskOutcome;

use crate::error::CliError;

/// Grid selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GridArg {
    /// Plate carrée lat/lon grid (2x1 tiles at zoom 0)
    Geodetic,
    /// Square web-mercator-like grid (1x1 tiles at zoom 0)
    Mercator,
}

impl From<GridArg> for GridKind {
    fn from(arg: GridArg) -> Self {
        match arg {
            GridArg::Geodetic => GridKind::Geodetic,
            GridArg::Mercator => GridKind::Mercator,
        }
    }
}

/// Resampling selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ResamplingArg {
    Nearest,
    Average,
}

impl From<ResamplingArg> for ResamplingMethod {
    fn from(arg: ResamplingArg) -> Self {
        match arg {
            ResamplingArg::Nearest => ResamplingMethod::Nearest,
            ResamplingArg::Average => ResamplingMethod::Average,
        }
    }
}

#[derive(Debug, Args)]
pub struct ExecuteArgs {
    /// Tile directory the output is written to
    pub output: PathBuf,

    /// Registered process to run
    #[arg(long, default_value = "gradient")]
    pub process: String,

    /// Zoom level or range, e.g. "5" or "0-5"
    #[arg(short, long, default_value = "0-4")]
    pub zoom: String,

    /// Process bounds as left bottom right top
    #[arg(long, num_args = 4, value_names = ["LEFT", "BOTTOM", "RIGHT", "TOP"])]
    pub bounds: Option<Vec<f64>>,

    /// World grid of the pyramid
    #[arg(long, value_enum, default_value = "geodetic")]
    pub grid: GridArg,

    /// Metatiling factor (power of two, 1-16)
    #[arg(long, default_value_t = 1)]
    pub metatiling: u8,

    /// Pixel buffer around each processing tile
    #[arg(long, default_value_t = 0)]
    pub pixelbuffer: u16,

    /// Number of workers (omit for one per CPU core)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Run everything on a single thread
    #[arg(long, conflicts_with = "workers")]
    pub sequential: bool,

    /// Overwrite existing output instead of skipping it
    #[arg(long)]
    pub overwrite: bool,

    /// Build overview levels by aggregating the highest zoom downward
    #[arg(long)]
    pub overviews: bool,

    /// Resampling used for overview aggregation
    #[arg(long, value_enum, default_value = "average")]
    pub overviews_resampling: ResamplingArg,

    /// Free-form process parameter as KEY=VALUE (value parsed as JSON,
    /// falling back to a plain string); repeatable
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,
}

/// Demo process: fills each tile with its normalized west-edge longitude.
///
/// Needs no inputs, which makes it handy for exercising a full pyramid run
/// on a fresh machine.
struct GradientProcessor;

impl TileProcessor for GradientProcessor {
    fn name(&self) -> &str {
        "gradient"
    }

    fn execute(&self, ctx: &ProcessContext<'_>) -> Result<ProcessOutput, ProcessError> {
        let bounds = ctx.tile().bounds();
        Ok(ProcessOutput::Data(TileData::filled(
            ctx.tile().output_shape(),
            bounds.left as f32,
            f32::NAN,
        )))
    }
}

/// Builds the process table available to this binary.
fn process_registry() -> ProcessRegistry {
    let mut registry = ProcessRegistry::with_defaults();
    registry.register(Arc::new(GradientProcessor));
    registry
}

fn parse_param(param: &str) -> Result<(String, serde_json::Value), CliError> {
    let (key, value) = param
        .split_once('=')
        .ok_or_else(|| CliError::Argument(format!("expected KEY=VALUE, got: {param}")))?;
    // Anything that is not valid JSON is taken as a bare string, so
    // --param method=average works without quoting gymnastics.
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_zoom(zoom: &str) -> Result<ZoomLevels, CliError> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u8>()
            .map_err(|_| CliError::Argument(format!("invalid zoom: {s}")))
    };
    let levels = match zoom.split_once('-') {
        Some((min, max)) => ZoomLevels::new(parse(min)?, parse(max)?),
        None => ZoomLevels::single(parse(zoom)?),
    }?;
    Ok(levels)
}

pub fn run(args: ExecuteArgs) -> Result<(), CliError> {
    let registry = process_registry();
    let processor = registry
        .get(&args.process)
        .ok_or_else(|| CliError::UnknownProcess(args.process.clone()))?;

    let pyramid = TilePyramid::new(args.grid.into())
        .with_metatiling(args.metatiling)
        .map_err(|err| CliError::Argument(err.to_string()))?
        .with_pixelbuffer(args.pixelbuffer);

    let mut builder = BatchConfig::builder(pyramid.clone(), parse_zoom(&args.zoom)?)
        .overwrite(args.overwrite)
        .retry(RetrySettings::from_env());
    if let Some(bounds) = &args.bounds {
        builder = builder.bounds(Bounds::new(bounds[0], bounds[1], bounds[2], bounds[3]));
    }
    if args.sequential {
        builder = builder.sequential();
    } else if let Some(workers) = args.workers {
        builder = builder.workers(workers);
    }
    if args.overviews {
        builder = builder.overviews(OverviewOptions {
            resampling: args.overviews_resampling.into(),
        });
    }
    for param in &args.params {
        let (key, value) = parse_param(param)?;
        builder = builder.parameter(key, value);
    }
    let config = builder.build()?;

    let output = Arc::new(DirectoryOutput::open(&args.output, pyramid)?);
    let mut scheduler = BatchScheduler::new(config, vec![], output, processor)?;

    // Ctrl-C cancels pending work; running tiles finish and are discarded.
    let cancellation = scheduler.cancellation();
    let _ = ctrlc::set_handler(move || {
        eprintln!("interrupt received, cancelling batch");
        cancellation.cancel();
    });

    let total = scheduler.count_tiles()?;
    info!(total, process = args.process, "starting batch");
    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} [{elapsed_precise}] {msg}")
            .expect("static template is valid"),
    );

    let summary = scheduler.run_with(|result| {
        if result.outcome() == TaskOutcome::Written {
            progress.set_message(format!("{}", result.tile()));
        }
        progress.inc(1);
    })?;

    progress.finish_and_clear();
    println!("{summary}");
    Ok(())
}
