//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. These arguments are parsed at startup and then merged with
//! the configuration from the `certstore.toml` file and environment variables.

use crate::config::StorageBackend;
use clap::{Parser, Subcommand};
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Ingests a certificate transparency feed into a domain-indexed store.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite database file.
    #[arg(long, value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    /// Logging level (overridden by RUST_LOG).
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Print query results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Stream the feed into the store until interrupted (the default).
    Ingest {
        /// CertStream WebSocket URL.
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// Storage backend to write to.
        #[arg(long, value_enum)]
        backend: Option<StorageBackend>,

        /// Accept invalid TLS certificates from the feed.
        #[arg(long)]
        allow_invalid_certs: bool,

        /// Serve Prometheus metrics.
        #[arg(long)]
        metrics: bool,
    },
    /// Show database statistics.
    Stats,
    /// List the most recently updated domains.
    Recent {
        /// Number of records to show.
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Search domains by substring; `*` matches any run of characters.
    Search {
        pattern: String,

        /// Maximum number of records to show.
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// Show the stored record for one domain.
    Get { domain: String },
}

impl Cli {
    /// The subcommand to run, defaulting to ingestion.
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Ingest {
            url: None,
            backend: None,
            allow_invalid_certs: false,
            metrics: false,
        })
    }
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        let mut storage = Dict::new();
        if let Some(db) = &self.db {
            storage.insert("path".into(), Value::serialize(db)?);
        }

        if let Some(Command::Ingest {
            url,
            backend,
            allow_invalid_certs,
            metrics,
        }) = &self.command
        {
            let mut network = Dict::new();
            if let Some(url) = url {
                network.insert("certstream_url".into(), Value::from(url.clone()));
            }
            // Flags only ever switch these on; absence keeps the configured value.
            if *allow_invalid_certs {
                network.insert("allow_invalid_certs".into(), Value::from(true));
            }
            if !network.is_empty() {
                dict.insert("network".into(), network.into());
            }

            if let Some(backend) = backend {
                storage.insert("backend".into(), Value::serialize(backend)?);
            }

            if *metrics {
                let mut metrics_dict = Dict::new();
                metrics_dict.insert("enabled".into(), Value::from(true));
                dict.insert("metrics".into(), metrics_dict.into());
            }
        }

        if !storage.is_empty() {
            dict.insert("storage".into(), storage.into());
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
