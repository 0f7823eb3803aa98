use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use prh_adapters::{FixtureSourceHost, SourceHost};
use prh_core::window::today_in;
use prh_storage::{MemoryStore, PgStore, Store};
use prh_sync::{run_scheduler_until_shutdown, Harvester, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "prh-cli")]
#[command(about = "Pull-request harvester command-line interface")]
struct Cli {
    /// Serve source-host calls from a fixture bundle instead of the API.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    /// Keep records in memory instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest pull requests for a day (default: yesterday).
    Sync {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Create tables and move to the (number, repository) key.
    Migrate,
    /// Resolve every stored author against the identity directory.
    Reconcile,
    /// Write the daily snapshot and report (default: yesterday).
    Export {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        force: bool,
    },
    /// Write the snapshot and report for the week before a date (default: today).
    Weekly {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run the full daily chain for a day (default: yesterday).
    Daily {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Serve the JSON API, with the scheduler when enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the daily and weekly jobs on their cron schedules until Ctrl-C.
    Schedule,
}

async fn build_harvester(cli: &Cli, config: SyncConfig) -> Result<Harvester> {
    let store: Arc<dyn Store> = if cli.memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .context("connecting to the database")?,
        )
    };
    let host: Arc<dyn SourceHost> = match &cli.fixtures {
        Some(path) => Arc::new(FixtureSourceHost::from_path(path)?),
        None => Arc::new(Harvester::github_host(&config)?),
    };
    Ok(Harvester::new(config, store, host))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if matches!(cli.command, Some(Commands::Schedule)) {
        config.scheduler_enabled = true;
    }
    let harvester = build_harvester(&cli, config).await?;
    let migration = harvester.prepare_store().await?;

    match cli.command.unwrap_or(Commands::Sync { date: None }) {
        Commands::Sync { date } => {
            let date = date.unwrap_or_else(|| harvester.yesterday());
            let summary = harvester.ingest(date).await?;
            println!("sync complete: {}", summary.message());
        }
        Commands::Migrate => print_json(&migration)?,
        Commands::Reconcile => print_json(&harvester.reconcile().await?)?,
        Commands::Export { date, force } => {
            let date = date.unwrap_or_else(|| harvester.yesterday());
            print_json(&harvester.generate(date, force).await?)?;
        }
        Commands::Weekly { date } => {
            let date = date.unwrap_or_else(|| today_in(harvester.utc_offset()));
            print_json(&harvester.run_weekly_tasks(date).await?)?;
        }
        Commands::Daily { date } => {
            let date = date.unwrap_or_else(|| harvester.yesterday());
            print_json(&harvester.run_daily_tasks(date).await?)?;
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(harvester.config().web_port);
            let scheduler = harvester.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler running alongside the web server");
            }
            prh_web::serve(prh_web::AppState::new(harvester), port).await?;
        }
        Commands::Schedule => {
            let sched = harvester
                .maybe_build_scheduler()
                .await?
                .context("scheduler could not be built")?;
            run_scheduler_until_shutdown(sched).await?;
        }
    }

    Ok(())
}
