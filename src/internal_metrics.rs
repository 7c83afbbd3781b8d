//! # Internal Metrics
//!
//! - **`Metrics`**: a cloneable struct of handles that the ingester and the
//!   event source update directly.
//! - **`MetricsBuilder`**: installs the Prometheus exporter when metrics are
//!   enabled in the configuration, then constructs the `Metrics` handle.
//!
//! Without an installed recorder the `metrics` facade is a no-op, so tests
//! can create handles freely.

use crate::config::MetricsConfig;
use anyhow::{Context, Result};
use metrics::{Counter, Gauge, Histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// The public API for the metrics system.
#[derive(Clone)]
pub struct Metrics {
    pub events_received_total: Counter,
    pub malformed_messages_total: Counter,
    pub domains_upserted_total: Counter,
    pub upsert_failures_total: Counter,
    pub source_connect_failures_total: Counter,
    pub source_disconnects_total: Counter,
    pub source_connection_status: Gauge,
    pub upsert_duration_seconds: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a new `Metrics` instance and registers descriptions for all
    /// supported metrics with the global recorder.
    pub fn new() -> Self {
        metrics::describe_counter!("events_received_total", Unit::Count, "Certificate updates received from the feed.");
        metrics::describe_counter!("malformed_messages_total", Unit::Count, "Feed messages skipped because they could not be parsed.");
        metrics::describe_counter!("domains_upserted_total", Unit::Count, "Domain records successfully written to the store.");
        metrics::describe_counter!("upsert_failures_total", Unit::Count, "Domain upserts abandoned after a store error.");
        metrics::describe_counter!("source_connect_failures_total", Unit::Count, "Failed attempts to connect to the feed.");
        metrics::describe_counter!("source_disconnects_total", Unit::Count, "Feed sessions that ended by closure or error.");
        metrics::describe_gauge!("source_connection_status", Unit::Count, "1 while a feed session is streaming, 0 otherwise.");
        metrics::describe_histogram!("upsert_duration_seconds", Unit::Seconds, "Latency of a single store upsert.");

        Self {
            events_received_total: metrics::counter!("events_received_total"),
            malformed_messages_total: metrics::counter!("malformed_messages_total"),
            domains_upserted_total: metrics::counter!("domains_upserted_total"),
            upsert_failures_total: metrics::counter!("upsert_failures_total"),
            source_connect_failures_total: metrics::counter!("source_connect_failures_total"),
            source_disconnects_total: metrics::counter!("source_disconnects_total"),
            source_connection_status: metrics::gauge!("source_connection_status"),
            upsert_duration_seconds: metrics::histogram!("upsert_duration_seconds"),
        }
    }

    /// Records whether a feed session is currently streaming.
    pub fn set_connected(&self, connected: bool) {
        self.source_connection_status
            .set(if connected { 1.0 } else { 0.0 });
    }
}

/// Initializes the metrics system from configuration.
pub struct MetricsBuilder {
    config: MetricsConfig,
}

impl MetricsBuilder {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Installs the Prometheus exporter if enabled and returns the handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Metrics> {
        if self.config.enabled {
            PrometheusBuilder::new()
                .with_http_listener(self.config.listen_address)
                .install()
                .with_context(|| {
                    format!(
                        "failed to start Prometheus exporter on {}",
                        self.config.listen_address
                    )
                })?;
            info!(address = %self.config.listen_address, "Prometheus metrics exporter listening");
        }
        Ok(Metrics::new())
    }
}
