//! Notes Pipeline - Main Server
//!
//! Note store HTTP API plus the enrichment, routing and fanout pipeline.

use anyhow::Result;
use clap::{Parser, Subcommand};
use notes_pipeline::{pipeline::Pipeline, Config};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(name = "notes-pipeline")]
#[command(about = "Note store with an asynchronous enrichment and fanout pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server and the pipeline
    Serve {
        /// Port to listen on (overrides config.yaml and SERVER_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to the YAML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Re-enqueue every stored note for enrichment and drain the queue once
    Backfill {
        /// Path to the YAML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Seconds to wait for the queue to drain
        #[arg(long, default_value = "30")]
        drain_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    let fmt_layer = if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,notes_pipeline=debug,tower_http=debug".into()),
        )
        .with(fmt_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => {
            let mut config = Config::from_yaml_and_env(config.as_deref())?;
            if let Some(port) = port {
                config.server_port = port;
            }
            notes_pipeline::start_server(config).await
        }
        Commands::Backfill {
            config,
            drain_timeout,
        } => {
            let config = Config::from_yaml_and_env(config.as_deref())?;
            run_backfill(config, Duration::from_secs(drain_timeout)).await
        }
    }
}

async fn run_backfill(config: Config, drain_timeout: Duration) -> Result<()> {
    let pipeline = Pipeline::new(config).await?;
    let handle = pipeline.start();

    let enqueued = pipeline.backfill().await?;
    let drained = pipeline.drain(drain_timeout).await;
    handle.shutdown().await;

    if drained {
        tracing::info!("Backfill complete: {} notes enqueued", enqueued);
    } else {
        tracing::warn!(
            "Backfill timed out after {:?}: {} notes enqueued, queue not empty",
            drain_timeout,
            enqueued
        );
    }
    Ok(())
}
