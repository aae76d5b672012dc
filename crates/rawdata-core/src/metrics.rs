//! Prometheus metrics helpers for the migration pipeline.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rawdata_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!(rawdata_core::metrics::MESSAGES_PUBLISHED).increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: `migrate_`
//! - Suffix: unit or type (`_total`, `_bytes`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Messages handed to the log client.
pub const MESSAGES_PUBLISHED: &str = "migrate_messages_published_total";
/// Release batches emitted by the reorder buffer.
pub const RELEASE_BATCHES: &str = "migrate_release_batches_total";
/// Full-drain backpressure events.
pub const BACKPRESSURE_DRAINS: &str = "migrate_backpressure_drains_total";
/// Records written to the key store during prepare.
pub const RECORDS_PREPARED: &str = "migrate_records_prepared_total";
/// Records read from source files.
pub const RECORDS_READ: &str = "migrate_records_read_total";
/// Segment files sealed by the segment log.
pub const SEGMENTS_SEALED: &str = "migrate_segments_sealed_total";
/// Whether a migration is running (1=yes, 0=no).
pub const RUNNING: &str = "migrate_running";

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_metrics();
    Some(handle)
}

/// Serve `/metrics` on the given port from a background task.
///
/// The listener is bound before returning so bind failures surface here.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::warn!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

fn register_metrics() {
    describe_counter!(
        MESSAGES_PUBLISHED,
        "Total number of messages published to the log, in source order"
    );
    describe_counter!(
        RELEASE_BATCHES,
        "Number of contiguous position batches released by the reorder buffer"
    );
    describe_counter!(
        BACKPRESSURE_DRAINS,
        "Number of times the outstanding-work queue filled and was fully drained"
    );
    describe_counter!(
        RECORDS_PREPARED,
        "Records upserted into the key store during prepare"
    );
    describe_counter!(RECORDS_READ, "Records read from source files");
    describe_counter!(SEGMENTS_SEALED, "Segment files sealed by the segment log");
    describe_gauge!(
        RUNNING,
        "Whether a migration is currently running (1=yes, 0=no)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        metrics::counter!(MESSAGES_PUBLISHED).increment(3);
        metrics::gauge!(RUNNING).set(1.0);
    }
}
