//! certstore - Certificate Transparency feed ingester
//!
//! This library pulls certificate updates from a CertStream feed and keeps a
//! domain-indexed record of every certificate seen, along with a small query
//! surface over the stored records.

pub mod app;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod formatting;
pub mod ingest;
pub mod internal_metrics;
pub mod network;
pub mod query;
pub mod store;

#[cfg(feature = "test-utils")]
pub mod test_utils;

// Re-export core types for convenience
pub use crate::core::*;
