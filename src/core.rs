//! Core domain types and service traits for certstore
//!
//! This module defines the data that flows from the feed into storage and
//! the two trait contracts the ingester is built on: the event source it
//! pulls from and the certificate store it writes to.

use crate::error::{SourceError, StoreError};
use crate::store::pattern::DomainPattern;
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// One `certificate_update` message received from the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateEvent {
    /// Every domain named by the leaf certificate, as sent by the feed.
    /// May be empty and may repeat entries.
    pub domains: Vec<String>,
    /// The structured payload persisted for each domain.
    pub raw: serde_json::Value,
}

impl CertificateEvent {
    pub fn new(domains: Vec<String>, raw: serde_json::Value) -> Self {
        Self { domains, raw }
    }

    /// Builds an event whose payload only lists its domains.
    pub fn from_domains<S: AsRef<str>>(domains: &[S]) -> Self {
        let domains: Vec<String> = domains.iter().map(|d| d.as_ref().to_string()).collect();
        let raw = serde_json::json!({ "domains": domains });
        Self { domains, raw }
    }

    /// Serializes the payload into the text form stored in `DomainRecord::data`.
    pub fn serialize_payload(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&self.raw)?)
    }
}

/// The persisted view of a single domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Primary key, stored exactly as received.
    pub domain: String,
    /// JSON text of the latest payload that mentioned this domain.
    pub data: String,
    /// First time the domain was observed. Never changes.
    pub created_at: DateTime<Utc>,
    /// Latest time the domain was observed.
    pub updated_at: DateTime<Utc>,
}

impl DomainRecord {
    /// Parses the stored payload back into JSON.
    pub fn payload(&self) -> Result<serde_json::Value, StoreError> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Aggregate figures about a store's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct StoreStats {
    /// Number of distinct domains.
    pub count: u64,
    /// Most recent `updated_at` across all records.
    pub latest_update: Option<DateTime<Utc>>,
    /// The longest stored domain name.
    pub longest_domain: Option<String>,
    /// Size of the backing medium, when it has one.
    pub size_bytes: Option<u64>,
}

/// Normalizes a timestamp to the microsecond precision every backend keeps.
pub fn storage_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

// =============================================================================
// Service Traits
// =============================================================================

/// A factory for sessions against a certificate feed.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Establishes a new session to the feed.
    ///
    /// # Returns
    /// * `Ok(stream)` once the session is ready to yield events
    /// * `Err(SourceError::Connection)` if the endpoint cannot be reached or
    ///   the handshake fails
    async fn connect(&self) -> Result<Box<dyn EventStream>, SourceError>;
}

/// One live session yielding certificate events.
#[async_trait]
pub trait EventStream: Send {
    /// Waits for the next certificate event.
    ///
    /// Malformed messages are skipped internally and never returned.
    ///
    /// # Returns
    /// * `Ok(event)` for each certificate update
    /// * `Err(SourceError::StreamClosed)` when the remote side closes
    /// * `Err(SourceError::Stream)` on transport or protocol failure
    async fn next_event(&mut self) -> Result<CertificateEvent, SourceError>;

    /// Releases the session. Calling it more than once is harmless.
    async fn close(&mut self);
}

/// Persistent, domain-keyed storage for certificate observations.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Inserts a record for `domain`, or replaces its payload and advances
    /// `updated_at` if it already exists. `created_at` is only written on
    /// insert. The call is atomic.
    async fn upsert(
        &self,
        domain: &str,
        payload: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Fetches the record for `domain`, if any.
    async fn get(&self, domain: &str) -> Result<Option<DomainRecord>, StoreError>;

    /// Total number of distinct domains stored.
    async fn count(&self) -> Result<u64, StoreError>;

    /// Up to `limit` records, newest `updated_at` first, ties by domain.
    async fn list_recent(&self, limit: usize) -> Result<Vec<DomainRecord>, StoreError>;

    /// Records whose domain matches `pattern`, ordered by domain.
    async fn search(
        &self,
        pattern: &DomainPattern,
        limit: Option<usize>,
    ) -> Result<Vec<DomainRecord>, StoreError>;

    /// Aggregate statistics for the query surface.
    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
