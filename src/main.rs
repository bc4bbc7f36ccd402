use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dmm_bookbot::{
    config::Config,
    convert::LocalArtifactConverter,
    database::Database,
    delivery::{HttpBlobStore, LogNotifier},
    job_scheduling::{JobContext, JobScheduler, SyncCredentials, VolumeRequest},
    remote::HttpLibraryClient,
};

#[derive(Parser)]
#[command(name = "dmm-bookbot")]
#[command(version)]
#[command(about = "Library sync, download and conversion engine for a DMM book bot")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Root directory for downloaded pages and artifacts (overrides config file)
    #[arg(long, value_name = "DIR")]
    download_root: Option<PathBuf>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted (default)
    Serve,
    /// Sync one user's library once and exit
    Sync {
        #[arg(long)]
        user: i64,
        /// Password to use when none is stored
        #[arg(long)]
        password: Option<String>,
        /// How long to wait for the sync to finish
        #[arg(long, default_value = "30m", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
    /// Download and convert one volume for a user and exit
    Download {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        volume: i32,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, default_value = "2h", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("dmm_bookbot={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with((cli.log_format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json()))
        .with((cli.log_format == LogFormat::Text).then(|| tracing_subscriber::fmt::layer()))
        .init();

    info!("Starting DMM Bookbot v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }
    if let Some(download_root) = cli.download_root {
        config.storage.download_root = download_root;
    }

    let command = cli.command.unwrap_or(Command::Serve);
    if !matches!(command, Command::Serve) {
        // One-shot runs leave recurring schedules to the long-running service
        config.scheduling.reconcile_on_startup = false;
    }

    info!("Using database: {}", config.database.url);
    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!("Database connection established and migrations applied");

    tokio::fs::create_dir_all(&config.storage.download_root)
        .await
        .with_context(|| {
            format!(
                "Failed to create download root {}",
                config.storage.download_root.display()
            )
        })?;

    let context = JobContext::new(
        Arc::new(database.library_repository()),
        Arc::new(HttpLibraryClient::new(&config.remote)?),
        Arc::new(LocalArtifactConverter::new()),
        Arc::new(HttpBlobStore::new(&config.delivery)?),
        Arc::new(LogNotifier::new()),
        config,
    );
    let scheduler = JobScheduler::install(context).await?;

    let result = match command {
        Command::Serve => {
            info!("Job scheduler running, press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            Ok(())
        }
        Command::Sync {
            user,
            password,
            timeout,
        } => {
            let credentials = password.map(|password| SyncCredentials {
                password: Some(password),
                ..SyncCredentials::default()
            });
            scheduler.trigger_once(user, credentials).await?;
            wait_for(&scheduler, timeout).await
        }
        Command::Download {
            user,
            volume,
            password,
            timeout,
        } => {
            match scheduler.request_volume(user, volume, password).await? {
                VolumeRequest::Download(outcome) => {
                    info!("Download of volume {}: {:?}", volume, outcome)
                }
                VolumeRequest::Conversion(outcome) => {
                    info!("Volume {} already complete, conversion: {:?}", volume, outcome)
                }
            }
            wait_for(&scheduler, timeout).await
        }
    };

    scheduler.shutdown().await;
    info!("Shutdown complete");
    result
}

async fn wait_for(scheduler: &JobScheduler, timeout: Duration) -> Result<()> {
    tokio::select! {
        idle = scheduler.wait_idle(timeout) => {
            if !idle {
                warn!("Jobs still running after {}", humantime::format_duration(timeout));
                anyhow::bail!("timed out waiting for jobs to finish");
            }
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, abandoning queued jobs");
            Ok(())
        }
    }
}
