//! Command-line front end: loads every source through the pipeline into headless targets.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser};
use futures::future::join_all;
use image_loader::config::QueueOrder;
use image_loader::sources::{self, Source};
use image_loader::{
    Configuration, DecodedImage, ImageLoader, ImageView, LoadOutcome, TargetHandle, ViewBounds,
};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(name = "image-loader", about = "Fetch, cache and downsample images")]
struct Cli {
    /// Path to YAML config file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// URLs, image files or directories to load
    #[arg(value_name = "SOURCE", required = true)]
    sources: Vec<String>,

    /// Override the configured worker count
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Serve queued loads oldest first
    #[arg(long)]
    fifo: bool,

    /// Never write downloads to disk
    #[arg(long)]
    no_disk_cache: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("image_loader={level}").parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper_util=warn".parse()?);
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

/// Prints what it is given instead of drawing it.
struct ConsoleView {
    label: String,
}

impl ImageView for ConsoleView {
    fn bounds(&self) -> ViewBounds {
        // Unmeasured: the display size applies.
        ViewBounds::default()
    }

    fn show(&self, image: Option<&DecodedImage>) {
        match image {
            Some(image) => println!(
                "{}\t{}x{}\t{} bytes",
                self.label,
                image.width(),
                image.height(),
                image.byte_size()
            ),
            None => println!("{}\tno image", self.label),
        }
    }
}

#[derive(Debug, Default)]
struct Summary {
    shown: usize,
    cleared: usize,
    stale: usize,
    abandoned: usize,
}

impl Summary {
    fn record(&mut self, outcome: &LoadOutcome) {
        match outcome {
            LoadOutcome::Shown(_) => self.shown += 1,
            LoadOutcome::Cleared => self.cleared += 1,
            LoadOutcome::Stale => self.stale += 1,
            LoadOutcome::Abandoned => self.abandoned += 1,
        }
    }
}

fn apply_overrides(mut config: Configuration, cli: &Cli) -> Result<Configuration> {
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    if cli.fifo {
        config.queue_order = QueueOrder::Fifo;
    }
    if cli.no_disk_cache {
        config.disk_cache.enabled = false;
    }
    config.validated().context("invalid command-line overrides")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let config = Configuration::from_yaml_file_validated(&cli.config)?;
    let config = apply_overrides(config, &cli)?;
    let sources = sources::expand(&cli.sources)?;
    info!(count = sources.len(), "sources expanded");

    let (loader, pump) = ImageLoader::builder(&config).start()?;
    let display = std::thread::Builder::new()
        .name("display".into())
        .spawn(move || pump.run())
        .context("failed to spawn display thread")?;

    let completions = sources.iter().map(|Source { key, kind }| {
        let target = TargetHandle::new(ConsoleView {
            label: key.to_string(),
        });
        loader.request_load_with_completion(key.clone(), &target, *kind)
    });
    let all = join_all(completions);

    let mut summary = Summary::default();
    tokio::select! {
        outcomes = all => {
            for outcome in &outcomes {
                summary.record(outcome);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; abandoning remaining loads");
        }
    }

    let stats = loader.stats();
    loader.shutdown().await;
    drop(loader);
    tokio::task::spawn_blocking(move || display.join())
        .await?
        .map_err(|_| anyhow!("display thread panicked"))?;

    info!(
        shown = summary.shown,
        cleared = summary.cleared,
        stale = summary.stale,
        abandoned = summary.abandoned,
        enqueued = stats.enqueued,
        coalesced = stats.coalesced,
        peak_running = stats.peak_running,
        "done"
    );
    Ok(())
}
