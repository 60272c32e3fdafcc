use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pitwall_provider::{
    BackoffPolicy, FixtureProvider, HttpProviderConfig, HttpStatsProvider, StatsProvider,
};
use pitwall_store::FsStore;
use pitwall_sync::{
    load_season_registry, maybe_build_scheduler, write_run_report, SeasonSyncPipeline, SyncConfig,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pitwall-cli")]
#[command(about = "Pit Wall season data command-line interface")]
struct Cli {
    /// Season fixture bundle to sync from instead of the live provider.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one season's reference data into the store.
    Sync {
        #[arg(long)]
        season: u16,
        /// Also write a run report with Parquet snapshots.
        #[arg(long, default_value_t = false)]
        report: bool,
    },
    /// Ingest the merged result for one finished event.
    Ingest {
        #[arg(long)]
        season: u16,
        #[arg(long)]
        round: u32,
    },
    /// Run the cron scheduler over the seasons registry until interrupted.
    Schedule,
}

async fn build_provider(
    config: &SyncConfig,
    fixture: Option<PathBuf>,
) -> Result<Arc<dyn StatsProvider>> {
    match fixture {
        Some(path) => {
            let provider = FixtureProvider::from_path(&path)
                .await
                .with_context(|| format!("loading fixture {}", path.display()))?;
            Ok(Arc::new(provider))
        }
        None => {
            let provider = HttpStatsProvider::new(HttpProviderConfig {
                base_url: config.provider_base_url.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                backoff: BackoffPolicy::default(),
            })?;
            Ok(Arc::new(provider))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pitwall=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = Arc::new(
        FsStore::open(&config.store_dir)
            .await
            .with_context(|| format!("opening store at {}", config.store_dir.display()))?,
    );
    let provider = build_provider(&config, cli.fixture).await?;
    let pipeline =
        SeasonSyncPipeline::new(provider, store.clone()).with_top_n(config.top_n);

    match cli.command {
        Commands::Sync { season, report } => {
            let summary = pipeline.sync_season(season).await;
            println!(
                "sync complete: run_id={} season={} success={} events={} sessions={} errors={} skipped={}",
                summary.run_id,
                summary.season,
                summary.success,
                summary.counts.events,
                summary.counts.sessions,
                summary.errors.len(),
                summary.skipped_events.len()
            );
            if report {
                let reports_dir =
                    write_run_report(store.as_ref(), &summary, &config.workspace_root).await?;
                println!("report written: {}", reports_dir.display());
            }
        }
        Commands::Ingest { season, round } => {
            let outcome = pipeline.ingest_event_result(season, round).await?;
            println!(
                "ingestion complete: season={} round={} results={} scoring_triggered={}",
                season, round, outcome.result_count, outcome.scoring_triggered
            );
        }
        Commands::Schedule => {
            let registry = load_season_registry(&config.workspace_root).await?;
            let seasons = registry.enabled_seasons();
            info!(?seasons, "starting scheduler");
            let pipeline = Arc::new(pipeline);
            match maybe_build_scheduler(&config, pipeline, seasons).await? {
                Some(mut scheduler) => {
                    scheduler.start().await.context("starting scheduler")?;
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                }
                None => {
                    eprintln!("scheduler disabled; set PITWALL_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
