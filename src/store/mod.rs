//! Certificate store backends.

pub mod memory;
pub mod pattern;
pub mod sqlite;

use crate::config::{StorageBackend, StorageConfig};
use crate::core::CertificateStore;
use crate::error::StoreError;
use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryStore;
pub use pattern::DomainPattern;
pub use sqlite::SqliteStore;

/// Opens the store selected by the configuration for ingestion.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn CertificateStore>, StoreError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStore::open(
            &config.path,
            Duration::from_millis(config.busy_timeout_ms),
        )?)),
    }
}
