//! In-memory certificate store, used by tests and the `memory` backend.

use crate::core::{storage_timestamp, CertificateStore, DomainRecord, StoreStats};
use crate::error::StoreError;
use crate::store::pattern::DomainPattern;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A `HashMap`-backed store. Every operation takes the map lock once, so
/// readers always see whole records.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, DomainRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, DomainRecord>>, StoreError> {
        self.records
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, DomainRecord>>, StoreError> {
        self.records
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn upsert(
        &self,
        domain: &str,
        payload: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if domain.is_empty() {
            return Err(StoreError::InvalidDomain);
        }
        let observed_at = storage_timestamp(observed_at);
        let mut records = self.write()?;
        records
            .entry(domain.to_string())
            .and_modify(|record| {
                record.data = payload.to_string();
                record.updated_at = record.updated_at.max(observed_at);
            })
            .or_insert_with(|| DomainRecord {
                domain: domain.to_string(),
                data: payload.to_string(),
                created_at: observed_at,
                updated_at: observed_at,
            });
        Ok(())
    }

    async fn get(&self, domain: &str) -> Result<Option<DomainRecord>, StoreError> {
        Ok(self.read()?.get(domain).cloned())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.read()?.len() as u64)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<DomainRecord>, StoreError> {
        let records = self.read()?;
        let mut recent: Vec<DomainRecord> = records.values().cloned().collect();
        recent.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        recent.truncate(limit);
        Ok(recent)
    }

    async fn search(
        &self,
        pattern: &DomainPattern,
        limit: Option<usize>,
    ) -> Result<Vec<DomainRecord>, StoreError> {
        let records = self.read()?;
        let mut matches: Vec<DomainRecord> = records
            .values()
            .filter(|record| pattern.is_match(&record.domain))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.domain.cmp(&b.domain));
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let records = self.read()?;
        let latest_update = records.values().map(|r| r.updated_at).max();
        let longest_domain = records
            .keys()
            .max_by(|a, b| {
                // Characters, not bytes, to agree with SQLite's LENGTH().
                a.chars()
                    .count()
                    .cmp(&b.chars().count())
                    .then_with(|| b.cmp(a))
            })
            .cloned();
        Ok(StoreStats {
            count: records.len() as u64,
            latest_update,
            longest_domain,
            size_bytes: None,
        })
    }
}
