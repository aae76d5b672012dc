//! Message-log client abstraction.
//!
//! The pipeline only needs two things from a log: a producer per topic, and
//! a `publish` call that appends a batch of envelopes in the order given.
//! Providers are selected by identifier through [`open_client`].
//!
//! # Providers
//!
//! - `memory` ([`MemoryLogClient`]) - keeps envelopes in memory, for tests
//!   and dry runs
//! - `segment` ([`SegmentLogClient`]) - append-only length-prefixed segment
//!   files under `<local_temp_folder>/<topic>/`

mod memory;
mod segment;

pub use memory::{MemoryLogClient, MemoryProducer};
pub use segment::{
    SealedSegment, SegmentConfig, SegmentLogClient, SegmentProducer, SegmentStats, decode_frame,
    encode_frame, read_segment_file,
};

use crate::config::{LogProvider, TargetConfig};
use crate::error::Result;
use rawdata_core::MessageEnvelope;
use std::sync::Arc;

/// Appends envelopes to one topic.
pub trait LogProducer: Send + Sync {
    fn topic(&self) -> &str;

    /// Append a batch of envelopes, preserving their order.
    fn publish(&self, messages: Vec<MessageEnvelope>) -> Result<()>;

    /// Make everything published so far durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Flush and stop accepting messages. Closing twice is a no-op.
    fn close(&self) -> Result<()>;
}

/// Hands out producers and owns their lifecycle.
pub trait LogClient: Send + Sync {
    /// Get the producer for a topic, creating it on first use.
    fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>>;

    /// Close every producer created by this client.
    fn close(&self) -> Result<()>;
}

/// Open the log client selected by `config.provider`.
pub fn open_client(config: &TargetConfig) -> Result<Arc<dyn LogClient>> {
    let client: Arc<dyn LogClient> = match config.provider {
        LogProvider::Memory => Arc::new(MemoryLogClient::new()),
        LogProvider::Segment => Arc::new(SegmentLogClient::new(config.segment_config())),
    };
    tracing::info!("Opened {} log client", config.provider);
    Ok(client)
}
