//! Scripted sources and fault-injecting stores for exercising the ingester
//! without a network or a disk.

use crate::core::{CertificateEvent, CertificateStore, DomainRecord, EventSource, EventStream, StoreStats};
use crate::error::{SourceError, StoreError};
use crate::store::{DomainPattern, MemoryStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One step of a scripted session.
#[derive(Debug, Clone)]
pub enum SessionStep {
    Event(CertificateEvent),
    Error(SourceError),
    Close,
}

/// What the next call to `connect` does.
#[derive(Debug, Clone)]
pub enum ConnectAttempt {
    Fail(String),
    Session(Vec<SessionStep>),
}

impl ConnectAttempt {
    /// A session that yields one event per domain list, then closes.
    pub fn events_then_close(events: &[&[&str]]) -> Self {
        let mut steps: Vec<SessionStep> = events
            .iter()
            .map(|domains| SessionStep::Event(CertificateEvent::from_domains(domains)))
            .collect();
        steps.push(SessionStep::Close);
        ConnectAttempt::Session(steps)
    }
}

#[derive(Debug, Default)]
struct SourceCounters {
    connects: AtomicUsize,
    closes: AtomicUsize,
}

/// An [`EventSource`] that plays back a fixed script of connection attempts.
///
/// Once the script runs out, `connect` never completes, and a session whose
/// steps run out never yields again. Both wait for the ingester to shut down.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<ConnectAttempt>>,
    counters: Arc<SourceCounters>,
    connected_at: Mutex<Vec<Instant>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<ConnectAttempt>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            counters: Arc::default(),
            connected_at: Mutex::default(),
        }
    }

    /// Appends another attempt to the script.
    pub fn push(&self, attempt: ConnectAttempt) {
        lock(&self.script).push_back(attempt);
    }

    /// Number of `connect` calls so far, including failed and pending ones.
    pub fn connect_count(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// When each `connect` call started, on the tokio clock.
    pub fn connect_times(&self) -> Vec<Instant> {
        lock(&self.connected_at).clone()
    }

    /// Number of sessions that have been closed.
    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn connect(&self) -> Result<Box<dyn EventStream>, SourceError> {
        lock(&self.connected_at).push(Instant::now());
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front();
        match next {
            Some(ConnectAttempt::Fail(reason)) => Err(SourceError::Connection(reason)),
            Some(ConnectAttempt::Session(steps)) => Ok(Box::new(ScriptedStream {
                steps: steps.into(),
                counters: self.counters.clone(),
                closed: false,
            })),
            None => std::future::pending().await,
        }
    }
}

struct ScriptedStream {
    steps: VecDeque<SessionStep>,
    counters: Arc<SourceCounters>,
    closed: bool,
}

#[async_trait]
impl EventStream for ScriptedStream {
    async fn next_event(&mut self) -> Result<CertificateEvent, SourceError> {
        match self.steps.pop_front() {
            Some(SessionStep::Event(event)) => Ok(event),
            Some(SessionStep::Error(e)) => Err(e),
            Some(SessionStep::Close) => Err(SourceError::StreamClosed),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A [`MemoryStore`] whose upserts fail for selected domains.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: Mutex<HashSet<String>>,
    upserts: Mutex<Vec<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every upsert of `domain` fail with `StoreError::Unavailable`.
    pub fn fail_domain(&self, domain: &str) {
        lock(&self.failing).insert(domain.to_string());
    }

    /// Undoes [`FlakyStore::fail_domain`].
    pub fn heal_domain(&self, domain: &str) {
        lock(&self.failing).remove(domain);
    }

    /// Every domain passed to `upsert`, in call order, failed ones included.
    pub fn upsert_calls(&self) -> Vec<String> {
        lock(&self.upserts).clone()
    }
}

#[async_trait]
impl CertificateStore for FlakyStore {
    async fn upsert(
        &self,
        domain: &str,
        payload: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        lock(&self.upserts).push(domain.to_string());
        let failing = lock(&self.failing).contains(domain);
        if failing {
            return Err(StoreError::Unavailable(format!("injected failure for {domain}")));
        }
        self.inner.upsert(domain, payload, observed_at).await
    }

    async fn get(&self, domain: &str) -> Result<Option<DomainRecord>, StoreError> {
        self.inner.get(domain).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<DomainRecord>, StoreError> {
        self.inner.list_recent(limit).await
    }

    async fn search(
        &self,
        pattern: &DomainPattern,
        limit: Option<usize>,
    ) -> Result<Vec<DomainRecord>, StoreError> {
        self.inner.search(pattern, limit).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.inner.stats().await
    }
}
