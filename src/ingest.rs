//! The ingestion loop.
//!
//! Pulls certificate events from an [`EventSource`] one at a time and fans
//! each out into one store upsert per distinct domain. Disconnects and
//! connection failures send the loop into a capped exponential backoff; store
//! failures only cost the affected domain.
//!
//! ```text
//! Disconnected -> Connecting -> Streaming -> Backoff -> Connecting -> ...
//!                      \______________________^
//! (any state) -> ShutDown
//! ```

use crate::backoff::ExponentialBackoff;
use crate::core::{CertificateEvent, CertificateStore, EventSource, EventStream};
use crate::error::SourceError;
use crate::internal_metrics::Metrics;
use chrono::Utc;
use itertools::Itertools;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Where the ingestion loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Disconnected,
    Connecting,
    Streaming,
    Backoff,
    ShutDown,
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestState::Disconnected => "disconnected",
            IngestState::Connecting => "connecting",
            IngestState::Streaming => "streaming",
            IngestState::Backoff => "backoff",
            IngestState::ShutDown => "shut_down",
        };
        f.write_str(name)
    }
}

/// Result of fanning one event out to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventOutcome {
    pub upserted: u64,
    pub failed: u64,
}

/// Totals for one run of the ingestion loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub sessions: u64,
    pub events: u64,
    pub upserted: u64,
    pub failed: u64,
}

/// How a streaming session ended.
enum SessionEnd {
    Disconnected,
    Shutdown,
}

/// Returns the non-empty domains of an event, first occurrence order,
/// without duplicates.
pub fn distinct_domains(event: &CertificateEvent) -> Vec<&str> {
    event
        .domains
        .iter()
        .map(String::as_str)
        .filter(|domain| !domain.is_empty())
        .unique()
        .collect()
}

/// Drives the pull-from-source / write-to-store cycle.
pub struct Ingester {
    source: Arc<dyn EventSource>,
    store: Arc<dyn CertificateStore>,
    backoff: ExponentialBackoff,
    metrics: Arc<Metrics>,
    progress_interval: u64,
    state_tx: watch::Sender<IngestState>,
    summary: IngestSummary,
}

impl Ingester {
    pub fn new(
        source: Arc<dyn EventSource>,
        store: Arc<dyn CertificateStore>,
        backoff: ExponentialBackoff,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(IngestState::Disconnected);
        Self {
            source,
            store,
            backoff,
            metrics,
            progress_interval: 1000,
            state_tx,
            summary: IngestSummary::default(),
        }
    }

    /// Logs a progress line every `interval` events; 0 disables it.
    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Subscribes to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<IngestState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: IngestState) {
        debug!(%state, "Ingest state transition");
        self.state_tx.send_replace(state);
    }

    /// Runs until `shutdown_rx` is signalled (or its sender is dropped).
    ///
    /// Never fails: connection, stream and store errors are logged and
    /// retried or skipped.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> IngestSummary {
        info!("Ingester started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.set_state(IngestState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                res = self.source.connect() => res,
            };

            match connected {
                Ok(mut stream) => {
                    self.summary.sessions += 1;
                    self.set_state(IngestState::Streaming);
                    self.metrics.set_connected(true);

                    let events_before = self.summary.events;
                    let end = self.stream_events(stream.as_mut(), &mut shutdown_rx).await;

                    stream.close().await;
                    self.metrics.set_connected(false);

                    if self.summary.events > events_before {
                        self.backoff.reset();
                    }
                    if let SessionEnd::Shutdown = end {
                        break;
                    }
                    self.metrics.source_disconnects_total.increment(1);
                }
                Err(e) => {
                    warn!(error = %e, "Could not connect to feed");
                    self.metrics.source_connect_failures_total.increment(1);
                }
            }

            self.set_state(IngestState::Backoff);
            let delay = self.backoff.next_delay();
            info!("Reconnecting in {} ms", delay.as_millis());
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(IngestState::ShutDown);
        info!(
            sessions = self.summary.sessions,
            events = self.summary.events,
            upserted = self.summary.upserted,
            failed = self.summary.failed,
            "Ingester shut down"
        );
        self.summary
    }

    /// Processes events from one session until it ends or shutdown is
    /// requested. Each event is fully written before the next is pulled.
    async fn stream_events(
        &mut self,
        stream: &mut dyn EventStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            if *shutdown_rx.borrow() {
                return SessionEnd::Shutdown;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return SessionEnd::Shutdown,
                next = stream.next_event() => next,
            };

            match next {
                Ok(event) => {
                    let outcome = self.process_event(&event).await;
                    self.summary.events += 1;
                    self.summary.upserted += outcome.upserted;
                    self.summary.failed += outcome.failed;

                    if self.progress_interval > 0 && self.summary.events % self.progress_interval == 0 {
                        info!("Processed {} certificate updates", self.summary.events);
                    }
                }
                Err(SourceError::StreamClosed) => {
                    info!("Feed closed the session");
                    return SessionEnd::Disconnected;
                }
                Err(e) => {
                    warn!(error = %e, "Feed session failed");
                    return SessionEnd::Disconnected;
                }
            }
        }
    }

    /// Upserts every distinct domain of `event` with the event's payload.
    ///
    /// A failing domain is logged and skipped; the rest are still written.
    pub async fn process_event(&self, event: &CertificateEvent) -> EventOutcome {
        let mut outcome = EventOutcome::default();

        let payload = match event.serialize_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize certificate payload, skipping event");
                outcome.failed = distinct_domains(event).len() as u64;
                self.metrics.upsert_failures_total.increment(outcome.failed);
                return outcome;
            }
        };

        for domain in distinct_domains(event) {
            let start = Instant::now();
            match self.store.upsert(domain, &payload, Utc::now()).await {
                Ok(()) => {
                    self.metrics.upsert_duration_seconds.record(start.elapsed().as_secs_f64());
                    self.metrics.domains_upserted_total.increment(1);
                    debug!(domain = %domain, "Stored certificate");
                    outcome.upserted += 1;
                }
                Err(e) => {
                    error!(domain = %domain, error = %e, "Failed to store certificate");
                    self.metrics.upsert_failures_total.increment(1);
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }
}
