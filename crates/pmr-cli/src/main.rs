use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pmr_storage::PgStore;
use pmr_sync::{Pipeline, SyncConfig};
use pmr_web::AppState;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pmr-cli")]
#[command(about = "Property Market Radar pipeline stages")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Advance every enabled source's scan cursor and ingest what it yields.
    Crawl,
    /// One budget-bounded health-check run over due properties.
    Recheck,
    /// Fingerprint and match everything the incremental path missed.
    Reconcile,
    /// Flag listings priced below their locality and export a snapshot.
    MarketGap,
    /// Hand pending market-gap flags and closed listings to the notifier.
    Notify,
    ResetDaily,
    RefreshPriorities,
    Migrate,
    /// Serve the read-only operator API.
    Serve {
        #[arg(long, env = "PMR_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Run the cron-triggered stages until interrupted.
    Schedule {
        /// Also serve the operator API.
        #[arg(long)]
        serve: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pmr=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Crawl) {
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Crawl => print_json(&Pipeline::from_env().await?.run_crawl().await?)?,
        Commands::Recheck => print_json(&Pipeline::from_env().await?.run_recheck().await?)?,
        Commands::Reconcile => print_json(&Pipeline::from_env().await?.run_reconcile().await?)?,
        Commands::MarketGap => print_json(&Pipeline::from_env().await?.run_market_gap().await?)?,
        Commands::Notify => print_json(&Pipeline::from_env().await?.run_notify().await?)?,
        Commands::ResetDaily => print_json(&Pipeline::from_env().await?.run_daily_reset().await?)?,
        Commands::RefreshPriorities => {
            let written = Pipeline::from_env().await?.run_priority_refresh().await?;
            println!("priority scores written: {written}");
        }
        Commands::Serve { port } => {
            let pipeline = Pipeline::from_env().await?;
            let state = AppState::new(pipeline.store(), pipeline.config().workspace_root.clone());
            pmr_web::serve(state, port).await?;
        }
        Commands::Schedule { serve } => {
            let pipeline = Arc::new(Pipeline::from_env().await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set PMR_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler started");

            if serve {
                let state = AppState::new(pipeline.store(), pipeline.config().workspace_root.clone());
                tokio::select! {
                    res = pmr_web::serve(state, pmr_web::port_from_env()) => res?,
                    _ = tokio::signal::ctrl_c() => {}
                }
            } else {
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            }

            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
