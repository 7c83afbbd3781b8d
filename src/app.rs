//! The main application logic, decoupled from the entry point.

use crate::{
    backoff::ExponentialBackoff,
    config::Config,
    core::{CertificateStore, EventSource},
    ingest::{IngestState, IngestSummary, Ingester},
    internal_metrics::{Metrics, MetricsBuilder},
    network::CertStreamSource,
    store,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

/// A handle to the running application.
pub struct App {
    ingest_handle: JoinHandle<IngestSummary>,
    state_rx: watch::Receiver<IngestState>,
    store: Arc<dyn CertificateStore>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    /// A receiver that follows the ingester's state.
    pub fn state(&self) -> watch::Receiver<IngestState> {
        self.state_rx.clone()
    }

    /// The store the ingester writes to.
    pub fn store(&self) -> Arc<dyn CertificateStore> {
        self.store.clone()
    }

    /// Waits for the ingester to finish, which happens once the shutdown
    /// signal passed to [`AppBuilder::build`] fires.
    pub async fn run(self) -> Result<IngestSummary> {
        let summary = self
            .ingest_handle
            .await
            .context("ingestion task panicked")?;
        info!("All tasks shut down.");
        Ok(summary)
    }
}

/// Builder for the main application.
///
/// Constructs every component from the configuration, with overrides for
/// tests that need to inject a scripted source or a fault-injecting store.
pub struct AppBuilder {
    config: Config,
    store_override: Option<Arc<dyn CertificateStore>>,
    source_override: Option<Arc<dyn EventSource>>,
    metrics_override: Option<Metrics>,
}

impl AppBuilder {
    /// Creates a new `AppBuilder` with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store_override: None,
            source_override: None,
            metrics_override: None,
        }
    }

    /// Overrides the certificate store.
    pub fn store_override(mut self, store: Arc<dyn CertificateStore>) -> Self {
        self.store_override = Some(store);
        self
    }

    /// Overrides the event source.
    pub fn source_override(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source_override = Some(source);
        self
    }

    /// Overrides the metrics system.
    pub fn metrics_override(mut self, metrics: Metrics) -> Self {
        self.metrics_override = Some(metrics);
        self
    }

    /// Builds all components and spawns the ingester.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let config = self.config;
        config.validate()?;

        let metrics = match self.metrics_override {
            Some(m) => m,
            None => MetricsBuilder::new(config.metrics.clone()).build()?,
        };
        let metrics = Arc::new(metrics);

        let store = match self.store_override {
            Some(store) => store,
            None => {
                debug!(backend = ?config.storage.backend, path = %config.storage.path.display(), "Opening certificate store");
                store::open_store(&config.storage).with_context(|| {
                    format!(
                        "failed to open certificate store at {}",
                        config.storage.path.display()
                    )
                })?
            }
        };

        let source = match self.source_override {
            Some(source) => source,
            None => {
                debug!(url = %config.network.certstream_url, "Initializing CertStream source");
                Arc::new(CertStreamSource::from_config(&config.network, metrics.clone()))
                    as Arc<dyn EventSource>
            }
        };

        let ingester = Ingester::new(
            source,
            store.clone(),
            ExponentialBackoff::from_config(&config.backoff),
            metrics,
        )
        .with_progress_interval(config.ingest.progress_interval);
        let state_rx = ingester.subscribe_state();
        let ingest_handle = tokio::spawn(ingester.run(shutdown_rx));

        info!("certstore initialized. Ingesting certificate updates...");

        Ok(App {
            ingest_handle,
            state_rx,
            store,
        })
    }
}
