//! certstore - Certificate Transparency feed ingester
//!
//! Streams certificate updates into a domain-indexed store, or queries a
//! store that an ingester has filled.

use anyhow::{Context, Result};
use certstore::{
    app::App,
    cli::{Cli, Command},
    config::Config,
    query,
    store::SqliteStore,
};
use clap::Parser;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load_from_cli(&cli) {
        Ok(config) => config,
        Err(err) => {
            init_logging("error");
            error!("Failed to load configuration: {:#}", err);
            std::process::exit(2);
        }
    };

    init_logging(&config.log_level);

    match cli.command() {
        Command::Ingest { .. } => ingest(config).await,
        command => {
            let store = SqliteStore::open_read_only(
                &config.storage.path,
                Duration::from_millis(config.storage.busy_timeout_ms),
            )
            .with_context(|| {
                format!("failed to open database at {}", config.storage.path.display())
            })?;
            let output = query::execute(&store, &command, cli.json).await?;
            println!("{}", output.text);
            if !output.found && matches!(command, Command::Get { .. }) {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn ingest(config: Config) -> Result<()> {
    info!("certstore starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("CertStream URL: {}", config.network.certstream_url);
    info!("Allow Invalid Certs: {}", config.network.allow_invalid_certs);
    info!("Storage Backend: {:?}", config.storage.backend);
    info!("Database Path: {}", config.storage.path.display());
    info!(
        "Backoff: {}ms initial, {}ms max, x{}",
        config.backoff.initial_ms, config.backoff.max_ms, config.backoff.multiplier
    );
    info!(
        "Metrics: {}",
        if config.metrics.enabled {
            config.metrics.listen_address.to_string()
        } else {
            "Disabled".to_string()
        }
    );
    info!("-------------------------------------------------------");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = App::builder(config).build(shutdown_rx).await?;

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received. Shutting down gracefully..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let summary = app.run().await?;
    info!(
        sessions = summary.sessions,
        events = summary.events,
        upserted = summary.upserted,
        failed = summary.failed,
        "Exiting."
    );
    Ok(())
}
