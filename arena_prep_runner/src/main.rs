use anyhow::{Context, bail};
use arena_prep::core_modules::background::{BackgroundParams, EstimatorConfig, TimingWindow};
use arena_prep::core_modules::frame_source::{FrameSource, ImageSequenceSource};
use arena_prep::core_modules::geometry::{ArenaBox, PixelPoint};
use arena_prep::core_modules::setup::{FACILITY_ENV, SetupCatalog};
use arena_prep::core_modules::state_store::{FileSidecars, PerVideoStateStore};
use arena_prep::day_group::{
    DayGroupPropagator, ProgressEvent, PropagationConfig, PropagationSettings, TargetOutcome, find_group,
    list_group,
};
use arena_prep::pipeline::{PipelineConfig, PrepPipeline};
use arena_prep::workflow::allowed_next_steps;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "opencv")]
mod opencv_source;

#[derive(Parser)]
#[command(name = "arena-prep")]
#[command(version, about = "Arena calibration, background estimation and day-group propagation", long_about = None)]
struct Cli {
    /// Facility whose active setup seeds videos without state
    #[arg(long, global = true, env = FACILITY_ENV)]
    facility: Option<String>,

    /// Blocking worker threads (defaults to the number of CPUs)
    #[arg(short = 'j', long, global = true, value_name = "N")]
    workers: Option<usize>,

    /// Decode with OpenCV instead of reading <video>.frames/ image sequences
    #[cfg(feature = "opencv")]
    #[arg(long, global = true)]
    opencv: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the day group of a video and what each member already has
    Group {
        #[arg(value_name = "VIDEO")]
        video: PathBuf,
    },

    /// Store the arena rectangle
    Arena {
        #[arg(value_name = "VIDEO")]
        video: PathBuf,
        /// Top-left corner
        #[arg(long, value_name = "X,Y")]
        tl: String,
        /// Bottom-right corner
        #[arg(long, value_name = "X,Y")]
        br: String,
        /// Grid size
        #[arg(long, value_name = "COLSxROWS")]
        grid: Option<String>,
    },

    /// Store the sampling window
    Timing {
        #[arg(value_name = "VIDEO")]
        video: PathBuf,
        #[arg(long, value_name = "SECONDS")]
        start: f64,
        #[arg(long, value_name = "SECONDS")]
        end: f64,
    },

    /// Estimate and store the background of a video
    Background {
        #[arg(value_name = "VIDEO")]
        video: PathBuf,
        /// Window start; defaults to the stored window
        #[arg(long, value_name = "SECONDS", requires = "end")]
        start: Option<f64>,
        #[arg(long, value_name = "SECONDS", requires = "start")]
        end: Option<f64>,
        /// Number of frames to sample
        #[arg(short = 'n', long, value_name = "N")]
        frames: Option<u32>,
        /// Per-pixel quantile in [0, 1]
        #[arg(short, long, value_name = "Q")]
        quantile: Option<f64>,
        /// Seed for reproducible sampling
        #[arg(long, value_name = "SEED")]
        seed: Option<u64>,
    },

    /// Segment one frame against the stored background
    Segment {
        #[arg(value_name = "VIDEO")]
        video: PathBuf,
        /// Frame timestamp
        #[arg(long, value_name = "SECONDS")]
        at: f64,
        /// Write the label matrix as a 16-bit PNG
        #[arg(long, value_name = "FILE")]
        labels_out: Option<PathBuf>,
    },

    /// Mark a video ready and write its export
    Finalize {
        #[arg(value_name = "VIDEO")]
        video: PathBuf,
    },

    /// Replay a calibrated video's settings onto its day group
    Propagate {
        #[arg(value_name = "SOURCE")]
        source: PathBuf,
        /// Only these targets instead of the whole group
        #[arg(long, value_name = "VIDEO")]
        target: Vec<PathBuf>,
        /// Process targets concurrently
        #[arg(long)]
        parallel: bool,
        /// Attempts per step
        #[arg(long, value_name = "N", default_value = "2")]
        attempts: u32,
    },

    /// Show which calibration steps are available
    Steps {
        #[arg(value_name = "VIDEO")]
        video: PathBuf,
    },
}

fn parse_point(text: &str) -> anyhow::Result<PixelPoint> {
    let (x, y) = text.split_once(',').context("expected X,Y")?;
    Ok(PixelPoint::new(x.trim().parse()?, y.trim().parse()?))
}

fn parse_grid(text: &str) -> anyhow::Result<(u32, u32)> {
    let (cols, rows) = text
        .split_once(['x', 'X'])
        .context("expected COLSxROWS")?;
    Ok((cols.trim().parse()?, rows.trim().parse()?))
}

fn frame_source(cli: &Cli) -> Arc<dyn FrameSource> {
    #[cfg(feature = "opencv")]
    if cli.opencv {
        return Arc::new(opencv_source::OpenCvSource);
    }
    let _ = cli;
    Arc::new(ImageSequenceSource::new())
}

fn state_store(cli: &Cli) -> anyhow::Result<PerVideoStateStore> {
    let store = PerVideoStateStore::new(Arc::new(FileSidecars));
    let catalog = SetupCatalog::from_env().context("loading setup catalog")?;
    Ok(match (catalog, &cli.facility) {
        (Some(catalog), Some(facility)) => store.with_catalog(Arc::new(catalog), facility.clone()),
        (Some(_), None) => {
            tracing::warn!("Setup catalog loaded but no facility selected; ignoring it");
            store
        }
        _ => store,
    })
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arena_prep=info,arena_prep_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = PipelineConfig::default();
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Commands::Background { seed, .. } = &cli.command {
        config.estimator = EstimatorConfig {
            seed: *seed,
            ..config.estimator
        };
    }
    let store = Arc::new(state_store(&cli)?);
    let pipeline = Arc::new(PrepPipeline::new(config, frame_source(&cli), store.clone())?);
    let cancel = cancel_on_interrupt();

    match &cli.command {
        Commands::Group { video } => {
            for member in list_group(video, &store)? {
                println!(
                    "day {:>3}  {}  state:{}  export:{}  background:{}",
                    member.day,
                    member.video.display(),
                    yes_no(member.has_state),
                    yes_no(member.has_export),
                    yes_no(member.has_background),
                );
            }
        }
        Commands::Arena { video, tl, br, grid } => {
            let mut arena = ArenaBox::new(parse_point(tl)?, parse_point(br)?);
            if let Some(grid) = grid {
                let (cols, rows) = parse_grid(grid)?;
                arena.grid_cols = Some(cols);
                arena.grid_rows = Some(rows);
            }
            pipeline.set_arena(video, arena).await?;
            println!("Arena stored for {}", video.display());
        }
        Commands::Timing { video, start, end } => {
            let state = pipeline.set_timing(video, TimingWindow::new(*start, *end)?).await?;
            if let Some(window) = state.timing {
                println!("Window [{:.3}, {:.3}] stored", window.start_time, window.end_time);
            }
        }
        Commands::Background {
            video,
            start,
            end,
            frames,
            quantile,
            ..
        } => {
            let window = match (start, end) {
                (Some(start), Some(end)) => Some(TimingWindow::new(*start, *end)?),
                _ => None,
            };
            let stored = pipeline.load(video).await?.bg_params;
            let params = BackgroundParams {
                n_frames: frames.unwrap_or(stored.n_frames),
                quantile: quantile.unwrap_or(stored.quantile),
            };
            let state = pipeline.estimate_background(video, window, Some(params), &cancel).await?;
            if let Some(background) = &state.background {
                println!(
                    "Background from {}/{} frames at quantile {}",
                    background.frames_used, background.n_frames, background.quantile
                );
            }
        }
        Commands::Segment { video, at, labels_out } => {
            let segmentation = pipeline.segment_frame(video, *at, &cancel).await?;
            println!(
                "{:?}: {} components, {} foreground pixels",
                segmentation.status, segmentation.stats.distinct_label_count, segmentation.stats.nonzero_pixel_count
            );
            for component in &segmentation.components {
                println!(
                    "  #{:<3} {:<2} area {:>6}  centroid ({:.1}, {:.1})",
                    component.label, component.code, component.area, component.centroid.col, component.centroid.row
                );
            }
            if let Some(path) = labels_out {
                std::fs::write(path, pipeline.export_labels(&segmentation.labels)?)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
        Commands::Finalize { video } => {
            pipeline.finalize(video).await?;
            println!("{} is ready", video.display());
        }
        Commands::Propagate {
            source,
            target,
            parallel,
            attempts,
        } => propagate(pipeline, source, target, *parallel, *attempts, &cancel).await?,
        Commands::Steps { video } => {
            let state = pipeline.load(video).await?;
            let steps: Vec<String> = allowed_next_steps(&state)
                .into_iter()
                .map(|step| format!("{step:?}"))
                .collect();
            println!("{}", steps.join(", "));
        }
    }
    Ok(())
}

async fn propagate(
    pipeline: Arc<PrepPipeline>,
    source: &Path,
    targets: &[PathBuf],
    parallel: bool,
    attempts: u32,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let settings = PropagationSettings::from_state(&pipeline.load(source).await?)
        .with_context(|| format!("{} is not calibrated", source.display()))?;
    let targets = if targets.is_empty() {
        find_group(source)?
    } else {
        targets.to_vec()
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::Started { target } => println!("{}: started", target.display()),
                ProgressEvent::StepDone { target, step, ok } => {
                    println!("{}: {step} {}", target.display(), if ok { "done" } else { "FAILED" })
                }
                ProgressEvent::Finished { .. } => {}
            }
        }
    });

    let propagator = DayGroupPropagator::new(pipeline)
        .with_config(PropagationConfig {
            parallel,
            step_attempts: attempts,
        })
        .with_progress(tx);
    let report = propagator.propagate(source, &targets, &settings, cancel).await?;
    drop(propagator);
    printer.await?;

    for failed in report.failed() {
        if let TargetOutcome::Failed { step, error } = &failed.outcome {
            eprintln!("{}: failed at {step}: {error}", failed.target.display());
        }
    }
    let failures = report.failed().count();
    if failures > 0 {
        bail!("{failures} of {} targets failed", report.targets.len());
    }
    println!("{} targets ready", report.targets.len());
    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}
