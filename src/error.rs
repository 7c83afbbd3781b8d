//! Error types for the event source and the certificate store.
//!
//! None of these errors is fatal to the ingester. Source errors end the
//! current session and send the loop into backoff; store errors abandon a
//! single domain's upsert.

use thiserror::Error;

/// Failures raised by an [`EventSource`](crate::core::EventSource) or one of
/// its sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The endpoint was unreachable, refused the connection, or the
    /// handshake failed.
    #[error("failed to connect to feed: {0}")]
    Connection(String),

    /// The remote side closed the session normally.
    #[error("feed closed the stream")]
    StreamClosed,

    /// The session failed at the transport or protocol level.
    #[error("feed stream error: {0}")]
    Stream(String),
}

/// A single feed message that could not be parsed into a certificate event.
///
/// Malformed messages are skipped; they never end a session.
#[derive(Error, Debug)]
#[error("malformed certstream message: {0}")]
pub struct MalformedEvent(#[from] pub serde_json::Error);

/// Failures raised by a [`CertificateStore`](crate::core::CertificateStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The underlying medium is unreachable, locked or otherwise failing.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A value could not be encoded for, or decoded from, storage.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Domains are primary keys and must be non-empty.
    #[error("domain must not be empty")]
    InvalidDomain,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::Error as E;
        match err {
            E::FromSqlConversionFailure(..)
            | E::InvalidColumnType(..)
            | E::IntegralValueOutOfRange(..)
            | E::Utf8Error(_) => StoreError::Serialization(err.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
