//! Delimited dataset worker: dedup and group through the key store.

use super::{
    DatasetKey, DatasetSpec, MigrationWorker, ProduceStats, close_all, manifest_template,
    open_pipeline,
};
use crate::config::TargetConfig;
use crate::error::{Error, Result};
use crate::log::LogClient;
use crate::pipeline::{KeyStore, PendingMessage, PublishPipeline};
use crate::source::{DelimitedConfig, DelimitedSource, Record};
use chrono::Utc;
use rawdata_core::{FieldMapping, ManifestEntry, RecordType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Publishes one message per key group of a delimited source.
///
/// `prepare` loads every record into the [`KeyStore`] under its dataset
/// key; `produce` walks the store in key order and publishes each run of
/// same-group records as one message: the header line followed by the
/// member lines.
pub struct DelimitedDatasetWorker {
    source_config: DelimitedConfig,
    key: DatasetKey,
    store: KeyStore,
    template: ManifestEntry,
    pipeline: PublishPipeline,
    client: Arc<dyn LogClient>,
    next_position: u64,
    closed: bool,
}

impl DelimitedDatasetWorker {
    pub fn new(
        spec: &DatasetSpec,
        input: impl Into<PathBuf>,
        store_path: &Path,
        target: TargetConfig,
        client: Arc<dyn LogClient>,
    ) -> Result<Self> {
        let key_spec = spec.key.as_ref().ok_or_else(|| {
            Error::Config("delimited datasets need a `key` section".to_string())
        })?;
        let key = DatasetKey::from_spec(key_spec)?;
        let descriptor = &spec.file_descriptor;
        let source_config = DelimitedConfig {
            input: input.into(),
            delimiter: descriptor.delimiter_byte()?,
            charset: descriptor.charset,
            ..Default::default()
        };

        let template = manifest_template(&target.topic, spec, descriptor.charset, "text/csv");
        let pipeline = open_pipeline(target, &client)?;
        let store = KeyStore::open(store_path, Arc::clone(key.schema()))?;

        Ok(Self {
            source_config,
            key,
            store,
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

    pub fn store(&self) -> &KeyStore {
        &self.store
    }
}

impl MigrationWorker for DelimitedDatasetWorker {
    fn prepare(&mut self) -> Result<()> {
        let mut source = DelimitedSource::new(self.source_config.clone());
        let mut builder = self.key.builder();
        let stats = self
            .store
            .prepare(&mut source, |record| builder.key_for(record))?;
        self.store.flush()?;
        info!(
            "Prepared {} records from {} into {}",
            stats.records_read,
            self.source_config.input.display(),
            self.store.path().display()
        );
        Ok(())
    }

    fn produce(&mut self) -> Result<ProduceStats> {
        info!(
            "Producing delimited dataset from {} to {}",
            self.store.path().display(),
            self.template.topic
        );

        let Self {
            store,
            template,
            pipeline,
            next_position,
            ..
        } = self;

        let counts = store.produce(|group| {
            *next_position += 1;
            let position = next_position.to_string();
            let mut manifest = template.clone();
            manifest.position = position.clone();
            let records: Vec<Record> = group.into_iter().map(|(_, record)| record).collect();
            pipeline.submit(position, move || transform(manifest, records))
        })?;
        self.pipeline.drain()?;

        let pipeline_stats = self.pipeline.stats();
        Ok(ProduceStats {
            records: counts.entries,
            messages: pipeline_stats.submitted,
            published: pipeline_stats.published,
            backpressure_drains: pipeline_stats.backpressure_drains,
            ..Default::default()
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let published = close_all(&mut self.pipeline, &self.client);
        let store = self.store.close();
        published.and(store)
    }
}

impl Drop for DelimitedDatasetWorker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close delimited worker: {}", e);
        }
    }
}

fn transform(mut manifest: ManifestEntry, records: Vec<Record>) -> Result<PendingMessage> {
    let first = records
        .first()
        .ok_or_else(|| Error::OrderingViolation("empty key group".to_string()))?;

    let mut content = first.as_header();
    for record in &records {
        content.push('\n');
        content.push_str(&record.as_line());
    }

    manifest.created_date = Utc::now();
    manifest.content_length = content.len();
    manifest.source_path = first.file_path.clone();
    manifest.source_file = first.file_name.clone();
    manifest.delimiter = Some(first.delimiter.to_string());
    manifest.record_type = if records.len() > 1 {
        RecordType::Group
    } else {
        RecordType::Single
    };
    manifest.csv_mapping = first
        .headers
        .iter()
        .map(|c| FieldMapping::new(c.field_name.as_str(), "String"))
        .collect();

    Ok(PendingMessage {
        manifest,
        content: content.into_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogProvider;
    use crate::log::MemoryLogClient;
    use rawdata_core::{ENTRY_SEGMENT, MANIFEST_SEGMENT};
    use std::fs;
    use tempfile::TempDir;

    const SPEC: &str = r#"
metadata:
  source: utdanning
  dataset: karakter
fileDescriptor:
  delimiter: ";"
key:
  fields:
    - { name: filename, type: string, from: filename }
    - { name: fileId, type: long, column: 0 }
    - { name: fnr, type: int, column: Fnr }
    - { name: rowId, type: long, column: 1 }
  groupKeys: [fileId, fnr]
"#;

    fn target(topic: &str) -> TargetConfig {
        TargetConfig {
            provider: LogProvider::Memory,
            worker_threads: 2,
            ..TargetConfig::for_topic(topic)
        }
    }

    fn entry_text(client: &MemoryLogClient, topic: &str, index: usize) -> String {
        let message = &client.messages(topic)[index];
        String::from_utf8(message.segment(ENTRY_SEGMENT).unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_groups_published_in_key_order() {
        let input = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        fs::write(
            input.path().join("karakter.csv"),
            "fil_id;rad_id;fnr;karakter;\n\
             1;3;200;5;\n\
             1;1;100;4;\n\
             1;2;100;6;\n",
        )
        .unwrap();

        let spec = DatasetSpec::from_yaml_str(SPEC).unwrap();
        let client = Arc::new(MemoryLogClient::new());
        let mut worker = DelimitedDatasetWorker::new(
            &spec,
            input.path(),
            store.path(),
            target("karakter"),
            client.clone(),
        )
        .unwrap();

        worker.prepare().unwrap();
        let stats = worker.produce().unwrap();
        worker.close().unwrap();

        assert_eq!(stats.records, 3);
        assert_eq!(stats.messages, 2);
        assert_eq!(client.positions("karakter"), vec!["1", "2"]);
        assert_eq!(
            entry_text(&client, "karakter", 0),
            "FilId;RadId;Fnr;Karakter\n1;1;100;4\n1;2;100;6"
        );
        assert_eq!(
            entry_text(&client, "karakter", 1),
            "FilId;RadId;Fnr;Karakter\n1;3;200;5"
        );

        let messages = client.messages("karakter");
        let group =
            ManifestEntry::from_json_bytes(messages[0].segment(MANIFEST_SEGMENT).unwrap()).unwrap();
        let single =
            ManifestEntry::from_json_bytes(messages[1].segment(MANIFEST_SEGMENT).unwrap()).unwrap();
        assert_eq!(group.record_type, RecordType::Group);
        assert_eq!(single.record_type, RecordType::Single);
        assert_eq!(group.delimiter.as_deref(), Some(";"));
        assert_eq!(group.content_type.as_deref(), Some("text/csv"));
        assert_eq!(group.csv_mapping[2], FieldMapping::new("Fnr", "String"));
    }

    #[test]
    fn test_missing_key_section_rejected() {
        let store = TempDir::new().unwrap();
        let spec = DatasetSpec::from_yaml_str("{}").unwrap();
        let client: Arc<dyn LogClient> = Arc::new(MemoryLogClient::new());
        let result =
            DelimitedDatasetWorker::new(&spec, "unused", store.path(), target("t"), client);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_key_column_fails_prepare() {
        let input = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        fs::write(input.path().join("k.csv"), "fil_id;rad_id;fnr\nx;1;100\n").unwrap();

        let spec = DatasetSpec::from_yaml_str(SPEC).unwrap();
        let client = Arc::new(MemoryLogClient::new());
        let mut worker = DelimitedDatasetWorker::new(
            &spec,
            input.path(),
            store.path(),
            target("k"),
            client.clone(),
        )
        .unwrap();

        assert!(matches!(worker.prepare(), Err(Error::MalformedSource(_))));
        worker.close().unwrap();
        assert!(worker.store().is_closed());
    }
}
