mod alerts;
mod api;
mod backoff;
mod browser;
mod config;
mod db;
mod egress;
mod error;
mod extractor;
mod media;
mod normalize;
mod pacing;
mod parser;
mod persona;
mod reachability;
mod session;
mod webdriver;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::AlertGovernor;
use crate::config::Settings;
use crate::db::Store;
use crate::egress::OpenVpnProvider;
use crate::media::MediaFetcher;
use crate::reachability::Reachability;
use crate::webdriver::WebDriverLauncher;
use crate::worker::{HarvestWorker, WorkerExit};

#[derive(Parser)]
#[command(name = "story_harvester", about = "Persona-rotating story harvester")]
struct Cli {
    /// Settings file (default: ./harvest.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema and register the configured targets
    Init,
    /// Run the harvest worker and the media fetcher until stopped
    Harvest {
        /// Stop after this many worker cycles (default: run until stopped)
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// Download pending media once
    FetchMedia {
        /// Max rows to claim (default: media.batch_size)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show store statistics and the connection report
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = config::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Init => {
            let store = open_store(&settings)?;
            let inserted = store.upsert_targets(&settings.targets)?;
            println!(
                "Registered {} new targets ({} configured, {} personas)",
                inserted,
                settings.targets.len(),
                settings.personas.len()
            );
            Ok(())
        }
        Commands::Harvest { max_cycles } => harvest(settings, max_cycles).await,
        Commands::FetchMedia { limit } => {
            let store = Arc::new(open_store(&settings)?);
            let reachability = Reachability::new(&settings.reachability)
                .context("building reachability client")?;
            let limit = limit.unwrap_or(settings.media.batch_size);
            let fetcher = MediaFetcher::new(store.clone(), reachability, settings.media)
                .context("building media client")?;
            let cancel = install_signal_handler();

            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
                    .progress_chars("#>-"),
            );
            let stats = fetcher.run_batch(limit, &cancel, &pb).await?;
            pb.finish_and_clear();
            println!(
                "Claimed {} media: {} fetched, {} errors.",
                stats.claimed, stats.fetched, stats.errors
            );
            Ok(())
        }
        Commands::Stats => {
            let store = open_store(&settings)?;
            let s = store.stats()?;
            println!("Targets:   {} ({} visited)", s.targets, s.visited);
            println!("Stories:   {} in {} runs", s.stories, s.runs);
            println!("Pages:     {}", s.pages);
            println!("Posts:     {}", s.posts);
            println!("Comments:  {}", s.comments);
            println!("Users:     {}", s.users);
            println!(
                "Media:     {} pending, {} fetched, {} errors",
                s.media_pending, s.media_fetched, s.media_errors
            );
            println!("Failed logins: {}", s.failed_logins);
            println!("Connections {}", store.report());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn harvest(settings: Settings, max_cycles: Option<u64>) -> anyhow::Result<()> {
    let store = Arc::new(open_store(&settings)?);
    store.upsert_targets(&settings.targets)?;
    let cancel = install_signal_handler();

    let reachability =
        Reachability::new(&settings.reachability).context("building reachability client")?;
    let fetcher = MediaFetcher::new(store.clone(), reachability.clone(), settings.media.clone())
        .context("building media client")?;
    let media_cancel = cancel.child_token();
    let media = tokio::spawn(async move { fetcher.run(&media_cancel).await });

    let egress = OpenVpnProvider::new(settings.egress.clone(), reachability.clone()).await;
    let launcher = WebDriverLauncher::new(settings.browser.clone());
    let alerts = Arc::new(AlertGovernor::new());
    let mut worker = HarvestWorker::new(
        settings,
        store,
        Box::new(launcher),
        Box::new(egress),
        reachability,
        alerts.clone(),
        cancel.clone(),
    );

    let exit = worker.run(max_cycles).await;
    cancel.cancel();
    match media.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "media worker failed"),
        Err(e) => warn!(error = %e, "media worker panicked"),
    }
    if alerts.overflow_count() > 0 {
        info!(suppressed = alerts.overflow_count(), "alerts suppressed by the governor");
    }

    match exit? {
        WorkerExit::Fatal(reason) => bail!("harvest stopped: {reason}"),
        WorkerExit::BulkComplete(c) => println!(
            "Bulk download complete: {} pages, {}/{} posts, {}/{} comments, {} media, {} users.",
            c.pages,
            c.posts_stored,
            c.posts_retrieved,
            c.comments_stored,
            c.comments_retrieved,
            c.media,
            c.users
        ),
        WorkerExit::Cancelled => println!("Cancelled."),
        WorkerExit::MaxCycles => println!("Cycle limit reached."),
    }
    Ok(())
}

fn open_store(settings: &Settings) -> anyhow::Result<Store> {
    if let Some(dir) = settings.db.path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let store = Store::open(
        &settings.db.path,
        settings.db.pool_size,
        settings.db.checkout_timeout(),
    )
        .with_context(|| format!("opening {}", settings.db.path.display()))?;
    store.init_schema()?;
    Ok(store)
}

/// Cancels the returned token on Ctrl+C or SIGTERM.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
                        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "no SIGTERM handler, only Ctrl+C stops the harvest");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("received Ctrl+C, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl+C, shutting down");
        }

        trigger.cancel();
        debug!("signal handler done");
    });

    token
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
