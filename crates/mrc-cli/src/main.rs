use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mrc_storage::PgReleaseStore;
use mrc_sync::{build_scheduler, open_release_store, StoreConfig, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mrc")]
#[command(about = "Movie release calendar: scrape, reconcile and publish an iCalendar feed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and export the calendar.
    Sync,
    /// Serve the calendar and release listing over HTTP.
    Serve,
    /// Run the pipeline on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Create the Postgres releases table.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::load().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = open_release_store(&config.store).await?;
            let summary = SyncPipeline::new(config, store)?.run_once().await?;
            for report in &summary.years {
                println!(
                    "{} {:?}: parsed={} inserted={} updated={} unchanged={} failed={}",
                    report.year,
                    report.status,
                    report.parsed,
                    report.inserted,
                    report.updated,
                    report.unchanged,
                    report.failed_upserts
                );
            }
            println!(
                "sync complete: run_id={} deleted={} alerts={} events={} calendar={}",
                summary.run_id,
                summary.deleted.len(),
                summary.alerts.len(),
                summary.exported_events,
                summary.calendar_path
            );
        }
        Commands::Serve => {
            let store = open_release_store(&config.store).await?;
            mrc_web::serve(&config, store).await?;
        }
        Commands::Schedule => {
            let store = open_release_store(&config.store).await?;
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config, store)?);
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => match &config.store {
            StoreConfig::Postgres { database_url } => {
                PgReleaseStore::connect(database_url)
                    .await
                    .context("connecting to postgres")?
                    .migrate()
                    .await
                    .context("creating releases table")?;
                println!("migration complete");
            }
            StoreConfig::File(path) => {
                println!(
                    "file store at {} needs no migration (set MRC_STORE=postgres)",
                    path.display()
                );
            }
        },
    }

    Ok(())
}
