//! Structured JSON dataset worker.

use super::{MigrationWorker, ProduceStats, close_all, manifest_template, open_pipeline};
use crate::config::TargetConfig;
use crate::error::Result;
use crate::log::LogClient;
use crate::pipeline::{PendingMessage, PublishPipeline};
use crate::source::{JsonConfig, JsonRow, JsonSource, RecordSource};
use chrono::Utc;
use rawdata_core::{FieldMapping, ManifestEntry, RecordType, data_type_name};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Entry payload: the file's structure plus a single data row.
#[derive(Serialize)]
struct Entry<'a> {
    structure: &'a Value,
    data: [&'a [Value]; 1],
}

/// Publishes every data row of a structured JSON source as one message.
pub struct JsonDatasetWorker {
    source_config: JsonConfig,
    template: ManifestEntry,
    pipeline: PublishPipeline,
    client: Arc<dyn LogClient>,
    next_position: u64,
    closed: bool,
}

impl JsonDatasetWorker {
    pub fn new(
        spec: &super::DatasetSpec,
        input: impl Into<PathBuf>,
        target: TargetConfig,
        client: Arc<dyn LogClient>,
    ) -> Result<Self> {
        let charset = spec.file_descriptor.charset;
        let template = manifest_template(&target.topic, spec, charset, "application/json");
        let pipeline = open_pipeline(target, &client)?;

        Ok(Self {
            source_config: JsonConfig {
                input: input.into(),
                charset,
                ..Default::default()
            },
            template,
            pipeline,
            client,
            next_position: 0,
            closed: false,
        })
    }

    /// Stop after this many input files.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.source_config.limit = limit;
        self
    }
}

impl MigrationWorker for JsonDatasetWorker {
    fn produce(&mut self) -> Result<ProduceStats> {
        info!(
            "Producing JSON dataset from {} to {}",
            self.source_config.input.display(),
            self.template.topic
        );

        let mut source = JsonSource::new(self.source_config.clone());
        let pipeline = &mut self.pipeline;
        let next_position = &mut self.next_position;
        let template = &self.template;

        let source_stats = source.process(|row| {
            *next_position += 1;
            let position = next_position.to_string();
            let mut manifest = template.clone();
            manifest.position = position.clone();
            pipeline.submit(position, move || transform(manifest, row))?;
            Ok(true)
        })?;
        self.pipeline.drain()?;

        let pipeline_stats = self.pipeline.stats();
        Ok(ProduceStats {
            messages: pipeline_stats.submitted,
            published: pipeline_stats.published,
            backpressure_drains: pipeline_stats.backpressure_drains,
            ..Default::default()
        }
        .with_source(&source_stats))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        close_all(&mut self.pipeline, &self.client)
    }
}

impl Drop for JsonDatasetWorker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close JSON worker: {}", e);
        }
    }
}

fn transform(mut manifest: ManifestEntry, row: JsonRow) -> Result<PendingMessage> {
    let content = serde_json::to_vec(&Entry {
        structure: &row.structure.raw,
        data: [row.values.as_slice()],
    })?;

    manifest.created_date = Utc::now();
    manifest.content_length = content.len();
    manifest.source_path = row.file_path;
    manifest.source_file = row.file_name;
    manifest.record_type = RecordType::Single;
    manifest.json_mapping = row
        .structure
        .fields
        .iter()
        .map(|f| FieldMapping::new(f.name.as_str(), data_type_name(&f.data_type)))
        .collect();

    Ok(PendingMessage { manifest, content })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogProvider;
    use crate::log::MemoryLogClient;
    use crate::worker::DatasetSpec;
    use rawdata_core::{ENTRY_SEGMENT, MANIFEST_SEGMENT};
    use std::fs;
    use tempfile::TempDir;

    fn target(topic: &str) -> TargetConfig {
        TargetConfig {
            provider: LogProvider::Memory,
            worker_threads: 4,
            ..TargetConfig::for_topic(topic)
        }
    }

    #[test]
    fn test_rows_become_single_messages() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("kostra.json"),
            r#"{"structure":[{"name":"region","type":"string"},{"name":"amount","type":"long"}],
               "data":[["0301",10],["1103",20],["4601",30]]}"#,
        )
        .unwrap();

        let spec = DatasetSpec::from_yaml_str("metadata:\n  source: ssb\n  dataset: kostra\n").unwrap();
        let client = Arc::new(MemoryLogClient::new());
        let mut worker =
            JsonDatasetWorker::new(&spec, dir.path(), target("kostra"), client.clone()).unwrap();

        let stats = worker.produce().unwrap();
        worker.close().unwrap();

        assert_eq!(stats.records, 3);
        assert_eq!(stats.messages, 3);
        assert_eq!(stats.published, 3);
        assert_eq!(client.positions("kostra"), vec!["1", "2", "3"]);

        let second = &client.messages("kostra")[1];
        let manifest =
            ManifestEntry::from_json_bytes(second.segment(MANIFEST_SEGMENT).unwrap()).unwrap();
        assert_eq!(manifest.position, "2");
        assert_eq!(manifest.dataset.as_deref(), Some("kostra"));
        assert_eq!(manifest.content_type.as_deref(), Some("application/json"));
        assert_eq!(manifest.source_file, "kostra.json");
        assert_eq!(manifest.json_mapping[1], FieldMapping::new("amount", "Long"));

        let entry: Value = serde_json::from_slice(second.segment(ENTRY_SEGMENT).unwrap()).unwrap();
        assert_eq!(entry["data"], serde_json::json!([["1103", 20]]));
        assert_eq!(entry["structure"][0]["name"], "region");
        assert_eq!(manifest.content_length, second.segment(ENTRY_SEGMENT).unwrap().len());
    }

    #[test]
    fn test_malformed_source_fails_produce() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.json"), r#"{"structure":[]}"#).unwrap();

        let spec = DatasetSpec::from_yaml_str("{}").unwrap();
        let client = Arc::new(MemoryLogClient::new());
        let mut worker =
            JsonDatasetWorker::new(&spec, dir.path(), target("bad"), client.clone()).unwrap();

        assert!(matches!(
            worker.produce(),
            Err(crate::Error::MalformedSource(_))
        ));
        worker.close().unwrap();
        worker.close().unwrap();
        assert!(client.positions("bad").is_empty());
    }

    #[test]
    fn test_invalid_target_rejected() {
        let spec = DatasetSpec::from_yaml_str("{}").unwrap();
        let client: Arc<dyn LogClient> = Arc::new(MemoryLogClient::new());
        let result = JsonDatasetWorker::new(&spec, "unused", target(""), client);
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }
}
