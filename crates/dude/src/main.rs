use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use dude::db::Database;
use dude::digest::DigestAlgorithm;
use dude::params::{RawParams, CACHE_FILE_NAME};
use dude::progress::{PipelineEvent, ProgressTotals, Reporter};
use dude::settings::{expand, Settings};
use dude::{Pipeline, RunSummary};

#[derive(Parser)]
#[command(name = "dude")]
#[command(about = "Find duplicate files, remembering fingerprints between runs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to settings file
    #[arg(short = 'c', long, global = true)]
    config: Option<String>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for duplicates within one directory, or from a source into a target
    Scan(ScanArgs),
    /// Manage the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect or maintain the fingerprint cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,

        /// Directory holding the cache database
        #[arg(long)]
        cache_dir: Option<String>,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// Directory to scan
    #[arg(short, long)]
    source: String,

    /// Only report files of the source that also exist here
    #[arg(short, long)]
    target: Option<String>,

    /// Directory holding the cache database
    #[arg(long)]
    cache_dir: Option<String>,

    /// Directory to write results.csv into
    #[arg(long)]
    results_dir: Option<String>,

    /// Concurrent hash workers (0 = one per CPU)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Capacity of the queue feeding the cache writer
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Compare matching files byte by byte before reporting them
    #[arg(long)]
    paranoid: bool,

    /// Content digest
    #[arg(long, value_enum)]
    digest: Option<DigestAlgorithm>,
}

impl ScanArgs {
    fn into_raw(self) -> RawParams {
        RawParams {
            source: expand(&self.source),
            target: self.target.as_deref().map(expand),
            cache_dir: self.cache_dir.as_deref().map(expand),
            results_dir: self.results_dir.as_deref().map(expand),
            workers: self.workers,
            buffer_size: self.buffer_size,
            paranoid: self.paranoid,
            digest: self.digest,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a settings file with the default values
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print where the settings file is read from
    Path,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show how many fingerprints are cached
    Stats,
    /// Forget fingerprints of files that no longer exist
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings_path = cli
        .config
        .as_deref()
        .map(expand)
        .unwrap_or_else(Settings::default_path);

    // A broken settings file must not stop `config init --force` from replacing it
    let command = match cli.command {
        Commands::Config { action } => return config(action, &settings_path),
        command => command,
    };
    let settings = Settings::load(&settings_path).context("Failed to load settings")?;

    match command {
        Commands::Scan(args) => scan(args, &settings).await,
        Commands::Config { action } => config(action, &settings_path),
        Commands::Cache { action, cache_dir } => {
            let cache_dir = cache_dir
                .as_deref()
                .map(expand)
                .unwrap_or_else(|| settings.cache_dir());
            cache(action, cache_dir).await
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("dude=debug,warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dude=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn scan(args: ScanArgs, settings: &Settings) -> Result<()> {
    let params = args.into_raw().resolve(settings)?;

    let cancelled = Arc::new(AtomicBool::new(false));
    let cancel_flag = Arc::clone(&cancelled);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing cache writes");
            cancel_flag.store(true, Ordering::Relaxed);
        }
    });

    // Spawn progress monitor task
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let progress_handle = tokio::spawn(async move {
        let mut totals = ProgressTotals::default();
        while let Some(event) = progress_rx.recv().await {
            totals.apply(&event);
            if matches!(event, PipelineEvent::Skipped { .. }) {
                continue;
            }
            eprint!(
                "\r\x1B[KDiscovered {} | hashed {} ({} cached) | compared {} | skipped {}",
                totals.discovered, totals.hashed, totals.cache_hits, totals.compared, totals.skipped
            );
            std::io::stderr().flush().ok();
        }
        eprint!("\r\x1B[K");
        totals
    });

    let pipeline = Pipeline::new(params)
        .with_reporter(Reporter::new(progress_tx))
        .with_cancel_flag(cancelled);
    let result = pipeline.run().await;

    // The reporter went away with the pipeline, so the monitor drains and exits
    drop(pipeline);
    progress_handle.await.context("Progress task panicked")?;

    print_summary(&result?);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Scanned {} files ({} hashed, {} from cache, {} skipped) in {:.2?}",
        summary.files_discovered,
        summary.fresh_hashes,
        summary.cache_hits,
        summary.skipped,
        summary.elapsed
    );
    if summary.rejected_collisions > 0 {
        println!(
            "  {} digest matches rejected by byte comparison",
            summary.rejected_collisions
        );
    }

    match &summary.results_path {
        Some(path) => println!(
            "Found {} duplicates in {} groups, written to {}",
            summary.duplicate_pairs,
            summary.duplicate_groups,
            path.display()
        ),
        None => println!("No duplicates were found"),
    }
}

fn config(action: ConfigAction, settings_path: &Path) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if Settings::init(settings_path, force)? {
                println!("Wrote default settings to {}", settings_path.display());
            } else {
                println!(
                    "Settings already exist at {} (use --force to replace)",
                    settings_path.display()
                );
            }
        }
        ConfigAction::Path => println!("{}", settings_path.display()),
    }
    Ok(())
}

async fn cache(action: CacheAction, cache_dir: PathBuf) -> Result<()> {
    let db_path = cache_dir.join(CACHE_FILE_NAME);
    if !db_path.exists() {
        println!("No cache at {}", db_path.display());
        return Ok(());
    }

    let db = Database::new(&db_path)
        .await
        .context("Failed to open fingerprint cache")?;

    match action {
        CacheAction::Stats => {
            println!("Cache: {}", db_path.display());
            println!("  Fingerprints: {}", db.count().await?);
        }
        CacheAction::Prune => {
            let removed = db.prune_missing().await?;
            println!("Removed {} fingerprints of missing files", removed);
            println!("  Remaining: {}", db.count().await?);
        }
    }
    Ok(())
}
