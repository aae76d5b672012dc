//! Dataset workers: one source, one topic, one run.
//!
//! Every worker follows the same lifecycle:
//!
//! 1. [`MigrationWorker::prepare`] - ingest into the [`KeyStore`] (delimited
//!    datasets only; a no-op otherwise)
//! 2. [`MigrationWorker::produce`] - read, transform and publish every
//!    message through a [`PublishPipeline`]
//! 3. [`MigrationWorker::close`] - drain, shut the pool down, close the
//!    log client and store
//!
//! [`KeyStore`]: crate::pipeline::KeyStore

mod dataset;
mod delimited;
mod json;

pub use dataset::{
    ColumnRef, DatasetKey, DatasetMetadata, DatasetSpec, DerivedValue, FileDescriptor,
    KeyFieldSpec, KeyOrigin, KeySpec, RecordKeyBuilder,
};
pub use delimited::DelimitedDatasetWorker;
pub use json::JsonDatasetWorker;

use crate::config::TargetConfig;
use crate::error::Result;
use crate::log::LogClient;
use crate::pipeline::PublishPipeline;
use crate::source::{Charset, SourceStats};
use rawdata_core::{ENTRY_SEGMENT, ManifestEntry};
use std::sync::Arc;

/// Counters reported by [`MigrationWorker::produce`].
#[derive(Debug, Clone, Default)]
pub struct ProduceStats {
    pub files: usize,
    pub bytes_read: u64,
    /// Source records read (stored entries for delimited datasets).
    pub records: usize,
    /// Messages submitted to the pipeline.
    pub messages: u64,
    pub published: u64,
    pub backpressure_drains: u64,
}

impl ProduceStats {
    fn with_source(mut self, stats: &SourceStats) -> Self {
        self.files = stats.files_processed;
        self.bytes_read = stats.bytes_read;
        self.records = stats.records;
        self
    }
}

/// The lifecycle every dataset worker implements.
pub trait MigrationWorker {
    /// Ingest the source into intermediate storage. Safe to repeat.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Publish every message of the source, in order.
    fn produce(&mut self) -> Result<ProduceStats>;

    /// Release every resource. Calling it twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Validate the target, build the cipher and open a pipeline on its topic.
fn open_pipeline(mut target: TargetConfig, client: &Arc<dyn LogClient>) -> Result<PublishPipeline> {
    target.validate()?;
    let cipher = target.take_cipher();
    let producer = client.producer(&target.topic)?;
    PublishPipeline::new(target.pipeline_config(), producer, cipher)
}

/// Manifest fields shared by every message of a dataset.
///
/// `created_date` is stamped per message when its transform runs.
fn manifest_template(
    topic: &str,
    spec: &DatasetSpec,
    charset: Charset,
    default_content_type: &str,
) -> ManifestEntry {
    let metadata = &spec.metadata;
    ManifestEntry {
        topic: topic.to_string(),
        resource_type: "entry".to_string(),
        content_key: ENTRY_SEGMENT.to_string(),
        source: metadata.source.clone(),
        dataset: metadata.dataset.clone(),
        tag: metadata.tag.clone(),
        description: metadata.description.clone(),
        charset: Charset::Utf8.name().to_string(),
        content_type: Some(
            spec.file_descriptor
                .content_type
                .clone()
                .unwrap_or_else(|| default_content_type.to_string()),
        ),
        source_charset: charset.name().to_string(),
        ..Default::default()
    }
}

/// Close the pipeline, then the log client; the first error wins.
fn close_all(pipeline: &mut PublishPipeline, client: &Arc<dyn LogClient>) -> Result<()> {
    let pipeline_result = pipeline.close().map(|stats| {
        tracing::debug!(
            "Pipeline closed: {} submitted, {} published",
            stats.submitted,
            stats.published
        );
    });
    let client_result = client.close();
    pipeline_result.and(client_result)
}
