//! SQLite implementation of the certificate store.
//!
//! This is the production backend. It keeps a single `rusqlite` connection
//! behind a mutex and runs every statement on the blocking thread pool so the
//! ingester's runtime threads never wait on disk I/O.

use crate::core::{storage_timestamp, CertificateStore, DomainRecord, StoreStats};
use crate::error::StoreError;
use crate::store::pattern::DomainPattern;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const CERTIFICATES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS certificates (
    domain TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_certificates_updated_at ON certificates(updated_at DESC, domain);
";

const UPSERT_SQL: &str = "
INSERT INTO certificates (domain, data, created_at, updated_at)
VALUES (?1, ?2, ?3, ?3)
ON CONFLICT(domain) DO UPDATE SET
    data = excluded.data,
    updated_at = MAX(certificates.updated_at, excluded.updated_at)
";

/// A single-file SQLite store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` for ingestion.
    ///
    /// Enables WAL so read-only query processes can run alongside the writer.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(CERTIFICATES_SCHEMA)?;
        info!(path = %path.display(), "SQLite certificate store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Opens an existing database without write access.
    pub fn open_read_only(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` against the connection on the blocking thread pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("connection mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("storage task failed: {e}")))?
    }
}

fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid {column} '{value}': {e}")))
}

type RawRow = (String, String, String, String);

fn read_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_record((domain, data, created_at, updated_at): RawRow) -> Result<DomainRecord, StoreError> {
    Ok(DomainRecord {
        created_at: decode_timestamp("created_at", &created_at)?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
        domain,
        data,
    })
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<RawRow>>,
) -> Result<Vec<DomainRecord>, StoreError> {
    rows.map(|row| into_record(row?)).collect()
}

#[async_trait]
impl CertificateStore for SqliteStore {
    async fn upsert(
        &self,
        domain: &str,
        payload: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if domain.is_empty() {
            return Err(StoreError::InvalidDomain);
        }
        let domain = domain.to_string();
        let payload = payload.to_string();
        let observed_at = encode_timestamp(&storage_timestamp(observed_at));
        self.with_conn(move |conn| {
            conn.execute(UPSERT_SQL, params![domain, payload, observed_at])?;
            Ok(())
        })
        .await
    }

    async fn get(&self, domain: &str) -> Result<Option<DomainRecord>, StoreError> {
        let domain = domain.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT domain, data, created_at, updated_at FROM certificates WHERE domain = ?1",
                    params![domain],
                    read_raw_row,
                )
                .optional()?;
            row.map(into_record).transpose()
        })
        .await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM certificates", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<DomainRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT domain, data, created_at, updated_at FROM certificates
                 ORDER BY updated_at DESC, domain ASC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], read_raw_row)?;
            collect_records(rows)
        })
        .await
    }

    async fn search(
        &self,
        pattern: &DomainPattern,
        limit: Option<usize>,
    ) -> Result<Vec<DomainRecord>, StoreError> {
        let like = pattern.to_like();
        // A negative LIMIT means "no limit" in SQLite.
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT domain, data, created_at, updated_at FROM certificates
                 WHERE domain LIKE ?1 ESCAPE '\\'
                 ORDER BY domain ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![like, limit], read_raw_row)?;
            collect_records(rows)
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_conn(|conn| {
            let (count, latest): (i64, Option<String>) = conn.query_row(
                "SELECT COUNT(*), MAX(updated_at) FROM certificates",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let longest_domain: Option<String> = conn
                .query_row(
                    "SELECT domain FROM certificates ORDER BY LENGTH(domain) DESC, domain ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

            Ok(StoreStats {
                count: count as u64,
                latest_update: latest
                    .map(|ts| decode_timestamp("updated_at", &ts))
                    .transpose()?,
                longest_domain,
                size_bytes: Some((page_count * page_size) as u64),
            })
        })
        .await
    }
}
