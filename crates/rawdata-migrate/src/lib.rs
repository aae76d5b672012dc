//! Ordered migration of flat-file extracts into an append-only message log.
//!
//! # Modules
//!
//! - [`source`] - record sources (delimited text, structured JSON)
//! - [`pipeline`] - key store, reorder buffer, worker pool, publish pipeline
//! - [`log`] - message-log client abstraction and providers
//! - [`worker`] - dataset workers tying sources to the pipeline
//! - [`config`] - target configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Record Source  │  (delimited text, structured JSON)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    KeyStore     │  RocksDB - dedup + grouping (delimited only)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ PublishPipeline │  worker pool: transform + encrypt
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  ReorderBuffer  │  releases in discovery order
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   LogProducer   │  segment files or memory
//! └─────────────────┘
//! ```
//!
//! Publication order equals discovery order: a message is never published
//! before every message discovered ahead of it.

pub mod config;
pub mod error;
pub mod log;
pub mod pipeline;
pub mod source;
pub mod worker;

// Re-export commonly used types at crate root
pub use config::{LogProvider, TargetConfig};
pub use error::{Error, Result};

pub use log::{LogClient, LogProducer, MemoryLogClient, SegmentLogClient, open_client};

pub use pipeline::{KeyStore, PublishPipeline, ReorderBuffer, WorkerPool};

pub use source::{DelimitedSource, JsonSource, Record, RecordSource, SourceStats};

pub use worker::{
    DatasetSpec, DelimitedDatasetWorker, JsonDatasetWorker, MigrationWorker, ProduceStats,
};
