#![allow(dead_code)]
//! Shared helpers for the integration tests.

use certstore::backoff::ExponentialBackoff;
use certstore::internal_metrics::Metrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Metrics handles with no recorder installed.
pub fn test_metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new())
}

/// A backoff short enough for tests running on the real clock.
pub fn fast_backoff() -> ExponentialBackoff {
    ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(50), 2.0)
}

/// Polls `check` until it returns true, panicking after ten seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}
