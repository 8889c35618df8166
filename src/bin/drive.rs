//! Drive storage core operator binary.
//!
//! Loads the configuration, builds the database connector and the storage
//! service, and runs one maintenance command against them.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use drive::config::{Config, ConfigError};
use drive::db::{DbError, connector_from_config};
use drive::diagnostics::{DiagnosticDepth, DiagnosticsError, DiagnosticsRegistry};
use drive::storage::{StorageError, StorageService, bytes_stream, collect_stream};
use miette::Diagnostic;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Error, Diagnostic, Debug)]
enum BinaryError {
    #[error("Configuration error: {0}")]
    #[diagnostic(code(drive::binary::config))]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    #[diagnostic(code(drive::binary::database))]
    Database(#[from] DbError),

    #[error("Storage error: {0}")]
    #[diagnostic(code(drive::binary::storage))]
    Storage(#[from] StorageError),

    #[error("Diagnostics error: {0}")]
    #[diagnostic(code(drive::binary::diagnostics))]
    Diagnostics(#[from] DiagnosticsError),

    #[error("Storage check failed: {0}")]
    #[diagnostic(code(drive::binary::check))]
    Check(String),
}

#[derive(Parser)]
#[command(name = "drive")]
#[command(author, version, about = "Drive storage core", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "drive.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the database and storage and print the aggregated report
    Diagnostics {
        /// alive, stats_track, stats_basic or stats_deep
        #[arg(long, default_value = "alive")]
        depth: DiagnosticDepth,
    },
    /// Write, read back and remove a probe object
    CheckStorage,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drive=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn diagnostics(config: &Config, depth: DiagnosticDepth) -> Result<bool, BinaryError> {
    let (connector, db_provider) = connector_from_config(&config.database);
    if let Err(e) = connector.init().await {
        warn!(error = %e, "database unreachable, reporting anyway");
    }
    let storage = StorageService::from_config(&config.storage)?;

    let registry = DiagnosticsRegistry::new();
    registry.register(db_provider)?;
    registry.register(Arc::new(storage))?;

    let summary = registry.get(depth).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).unwrap_or_else(|e| e.to_string())
    );

    registry.shutdown();
    connector.disconnect().await?;
    Ok(summary.ok)
}

async fn check_storage(config: &Config) -> Result<(), BinaryError> {
    let storage = StorageService::from_config(&config.storage)?;
    let path = format!("drive-check/{}", uuid::Uuid::new_v4());
    let payload = format!("drive storage check {}", chrono::Utc::now().to_rfc3339());

    let written = storage
        .write(&path, bytes_stream(payload.clone()), Some(1))
        .await?;
    info!(path, size = written.size, "probe object written");

    let read = collect_stream(storage.read(&path, Some(1)).await?)
        .await
        .map_err(|e| StorageError::io(&path, e))?;
    if read != payload.as_bytes() {
        return Err(BinaryError::Check(format!(
            "read back {} bytes that differ from the {} bytes written",
            read.len(),
            payload.len()
        )));
    }

    if !storage.remove(&path, Some(1)).await? {
        warn!(path, "probe object was not removed from every backend");
    }
    println!("Storage OK ({})", storage.backend().kind());
    Ok(())
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load(&cli.config).map_err(BinaryError::from)?;
    match cli.command {
        Command::Diagnostics { depth } => {
            if !diagnostics(&config, depth).await? {
                std::process::exit(1);
            }
        }
        Command::CheckStorage => check_storage(&config).await?,
    }
    Ok(())
}
