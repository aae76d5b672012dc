//! Core pipeline components for ordered migration.
//!
//! This module provides the shared pipeline that every dataset worker
//! feeds into:
//!
//! - [`KeyStore`] - RocksDB-backed, key-ordered record store (dedup + grouping)
//! - [`ReorderBuffer`] - converts completion order back into discovery order
//! - [`WorkerPool`] - fixed-size thread pool with per-task result handles
//! - [`PublishPipeline`] - bounded, fail-fast transform/encrypt/publish stage
//!
//! # Architecture
//!
//! ```text
//! [RecordSource] → (KeyStore) → [PublishPipeline] → [WorkerPool]
//!                                       ↓                ↓
//!                               ReorderBuffer ← transform + encrypt
//!                                       ↓
//!                                 LogProducer
//! ```
//!
//! Publication order always equals discovery order, however the workers
//! interleave.

mod keystore;
mod pool;
mod publish;
mod reorder;

pub use keystore::{KeyStore, KeyStoreStats, PrepareStats, ProduceCounts};
pub use pool::{DEFAULT_SHUTDOWN_TIMEOUT, TaskHandle, WorkerPool};
pub use publish::{
    DEFAULT_QUEUE_CAPACITY, PendingMessage, PipelineConfig, PipelineStats, PublishPipeline,
};
pub use reorder::ReorderBuffer;
