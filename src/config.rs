//! Configuration management for certstore
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. It uses the `figment`
//! crate to layer defaults, a `certstore.toml` file, environment variables
//! and command-line flags, in that order of precedence.

use crate::cli::Cli;
use anyhow::{ensure, Result};
use clap::ValueEnum;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// The configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "certstore.toml";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// The logging level for the application. `RUST_LOG` takes precedence.
    pub log_level: String,
    /// Configuration for the CertStream network client.
    pub network: NetworkConfig,
    /// Reconnection backoff settings.
    pub backoff: BackoffConfig,
    /// Configuration for the certificate store.
    pub storage: StorageConfig,
    /// Ingestion loop settings.
    pub ingest: IngestConfig,
    /// Configuration for the Prometheus exporter.
    pub metrics: MetricsConfig,
}

/// Configuration for the CertStream network client.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct NetworkConfig {
    /// The URL of the CertStream WebSocket server.
    pub certstream_url: String,
    /// Whether to accept invalid TLS certificates (for local servers).
    pub allow_invalid_certs: bool,
    /// How long a connection attempt may take before it is abandoned.
    pub connect_timeout_ms: u64,
}

/// Capped exponential backoff between reconnection attempts.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_ms: u64,
    /// Upper bound on any single delay.
    pub max_ms: u64,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Random extra delay, as a fraction of the current delay (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// Which certificate store implementation to use.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Single-file SQLite database.
    #[default]
    Sqlite,
    /// Process-local map; contents are lost on exit.
    Memory,
}

/// Configuration for the certificate store.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

/// Ingestion loop settings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IngestConfig {
    /// Log a progress line every this many certificate updates (0 disables).
    pub progress_interval: u64,
}

/// Configuration for metrics export.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics over HTTP.
    pub enabled: bool,
    /// The address the exporter listens on.
    pub listen_address: SocketAddr,
}

impl Config {
    /// Builds the layered figment without the command-line layer.
    pub fn figment(config_path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            // Legacy variable name for the feed URL.
            .merge(
                Env::raw()
                    .only(&["CERTSTREAM_WEBSOCKET_URL"])
                    .map(|_| "network.certstream_url".into()),
            )
            // e.g. CERTSTORE_LOG_LEVEL=debug, CERTSTORE_STORAGE__PATH=/var/lib/ct.db
            .merge(Env::prefixed("CERTSTORE_").split("__"))
    }

    /// Loads the configuration from the given file plus the environment.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config: Config = Self::figment(config_path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration with command-line flags as the top layer.
    pub fn load_from_cli(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let config: Config = Self::figment(&config_path).merge(cli).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the ingester cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.network.certstream_url.trim().is_empty(),
            "network.certstream_url must not be empty"
        );
        ensure!(self.backoff.initial_ms > 0, "backoff.initial_ms must be positive");
        ensure!(
            self.backoff.max_ms >= self.backoff.initial_ms,
            "backoff.max_ms ({}) must be at least backoff.initial_ms ({})",
            self.backoff.max_ms,
            self.backoff.initial_ms
        );
        ensure!(
            self.backoff.multiplier >= 1.0,
            "backoff.multiplier must be at least 1.0"
        );
        ensure!(
            (0.0..=1.0).contains(&self.backoff.jitter),
            "backoff.jitter must be between 0.0 and 1.0"
        );
        Ok(())
    }
}

// Provide a default implementation for tests and easy setup.
impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            network: NetworkConfig {
                certstream_url: "wss://certstream.calidog.io".to_string(),
                allow_invalid_certs: false,
                connect_timeout_ms: 10_000,
            },
            backoff: BackoffConfig::default(),
            storage: StorageConfig {
                backend: StorageBackend::Sqlite,
                path: PathBuf::from("certstream.db"),
                busy_timeout_ms: 5000,
            },
            ingest: IngestConfig {
                progress_interval: 1000,
            },
            metrics: MetricsConfig {
                enabled: false,
                listen_address: SocketAddr::from(([127, 0, 0, 1], 9898)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let mut config = Config::default();
        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_cap_below_initial() {
        let mut config = Config::default();
        config.backoff.initial_ms = 5000;
        config.backoff.max_ms = 1000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backoff.max_ms"));
    }

    #[test]
    fn test_validate_rejects_empty_url() {
        let mut config = Config::default();
        config.network.certstream_url = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
