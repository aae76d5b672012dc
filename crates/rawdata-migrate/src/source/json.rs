//! Structured JSON source adapter.
//!
//! Reads documents of the form
//!
//! ```json
//! {
//!   "structure": [{"name": "kommune", "type": "string"}, ...],
//!   "data": [["0301", ...], ...]
//! }
//! ```
//!
//! The `data` array is streamed through a serde visitor, so only one row
//! (plus a one-row lookahead for `has_next`) is held in memory at a time.
//! Unknown top-level members are skipped. `structure` must come before
//! `data`.

use super::{Charset, RecordSource, SourceStats, collect_files, path_parts};
use crate::{Error, Result};
use rawdata_core::metrics::RECORDS_READ;
use serde::Deserializer as _;
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::Value;
use std::fmt;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Configuration for the JSON source.
#[derive(Debug, Clone)]
pub struct JsonConfig {
    /// Input file or directory path.
    pub input: PathBuf,

    /// Character set of the input files.
    pub charset: Charset,

    /// Limit number of files to process (for testing).
    pub limit: Option<usize>,

    /// Progress reporting interval (rows).
    pub progress_interval: usize,
}

impl Default for JsonConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            charset: Charset::Utf8,
            limit: None,
            progress_interval: 100_000,
        }
    }
}

/// One declared column of a JSON document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureField {
    pub name: String,
    pub data_type: String,
}

/// The `structure` array of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub fields: Vec<StructureField>,
    /// The array exactly as it appeared in the file.
    pub raw: Value,
}

impl Structure {
    fn from_raw(items: Vec<Value>) -> std::result::Result<Self, String> {
        let mut fields = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let name = item.get("name").and_then(Value::as_str);
            let data_type = item.get("type").and_then(Value::as_str);
            match (name, data_type) {
                (Some(name), Some(data_type)) => fields.push(StructureField {
                    name: name.to_string(),
                    data_type: data_type.to_string(),
                }),
                _ => {
                    return Err(format!(
                        "structure element {i} needs string `name` and `type`"
                    ));
                }
            }
        }
        Ok(Self {
            fields,
            raw: Value::Array(items),
        })
    }
}

/// One row of the `data` array.
#[derive(Debug, Clone)]
pub struct JsonRow {
    pub file_path: String,
    pub file_name: String,
    pub structure: Arc<Structure>,
    pub values: Vec<Value>,
    /// One-based row number within the file.
    pub index: u64,
    /// Whether more rows follow in the same file.
    pub has_next: bool,
}

/// Structured JSON file record source.
pub struct JsonSource {
    config: JsonConfig,
}

impl JsonSource {
    pub fn new(config: JsonConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JsonConfig {
        &self.config
    }

    fn process_file<F>(&self, path: &Path, handler: &mut F, stats: &mut SourceStats) -> Result<bool>
    where
        F: FnMut(JsonRow) -> Result<bool>,
    {
        let file = File::open(path)?;
        let reader = BufReader::new(self.config.charset.decoding_reader(file));
        let (file_path, file_name) = path_parts(path);

        let mut emitter = RowEmitter {
            file_path,
            file_name,
            handler,
            structure: None,
            pending: None,
            index: 0,
            stopped: false,
            saw_data: false,
            error: None,
            progress_interval: self.config.progress_interval,
        };

        let mut de = serde_json::Deserializer::from_reader(reader);
        let parsed = (&mut de)
            .deserialize_map(DocumentVisitor {
                emitter: &mut emitter,
            })
            .and_then(|()| de.end());

        // A handler error takes precedence over the parse error it caused.
        if let Some(e) = emitter.error.take() {
            return Err(e);
        }
        if let Err(e) = parsed {
            return Err(if e.is_io() {
                Error::Io(e.into())
            } else {
                Error::MalformedSource(format!("{}: {}", path.display(), e))
            });
        }
        if !emitter.saw_data {
            return Err(Error::MalformedSource(format!(
                "{}: missing required top-level array `data`",
                path.display()
            )));
        }

        stats.records += emitter.index as usize;
        Ok(!emitter.stopped)
    }
}

impl RecordSource for JsonSource {
    type Item = JsonRow;

    fn name(&self) -> &'static str {
        "json"
    }

    fn process<F>(&mut self, mut handler: F) -> Result<SourceStats>
    where
        F: FnMut(JsonRow) -> Result<bool>,
    {
        let mut stats = SourceStats::default();

        let files = collect_files(&self.config.input, &["json"], self.config.limit)?;
        info!("Found {} JSON files to process", files.len());

        for (file_idx, file_path) in files.iter().enumerate() {
            info!(
                "[{}/{}] Processing: {}",
                file_idx + 1,
                files.len(),
                file_path.display()
            );

            stats.bytes_read += fs::metadata(file_path)?.len();
            let keep_going = self.process_file(file_path, &mut handler, &mut stats)?;
            stats.files_processed += 1;
            if !keep_going {
                info!("Handler signaled stop");
                break;
            }
        }

        Ok(stats)
    }
}

/// Streaming state shared by the document and data visitors.
struct RowEmitter<'h, F> {
    file_path: String,
    file_name: String,
    handler: &'h mut F,
    structure: Option<Arc<Structure>>,
    pending: Option<Vec<Value>>,
    index: u64,
    stopped: bool,
    saw_data: bool,
    error: Option<Error>,
    progress_interval: usize,
}

impl<F> RowEmitter<'_, F>
where
    F: FnMut(JsonRow) -> Result<bool>,
{
    /// Queue a row; the previously queued row is emitted with `has_next = true`.
    fn push<E: de::Error>(&mut self, values: Vec<Value>) -> std::result::Result<(), E> {
        match self.pending.replace(values) {
            Some(previous) => self.emit(previous, true),
            None => Ok(()),
        }
    }

    fn finish<E: de::Error>(&mut self) -> std::result::Result<(), E> {
        match self.pending.take() {
            Some(last) => self.emit(last, false),
            None => Ok(()),
        }
    }

    fn emit<E: de::Error>(&mut self, values: Vec<Value>, has_next: bool) -> std::result::Result<(), E> {
        let Some(structure) = &self.structure else {
            return Err(E::custom("`data` appears before `structure`"));
        };

        self.index += 1;
        let row = JsonRow {
            file_path: self.file_path.clone(),
            file_name: self.file_name.clone(),
            structure: Arc::clone(structure),
            values,
            index: self.index,
            has_next,
        };
        metrics::counter!(RECORDS_READ).increment(1);

        match (self.handler)(row) {
            Ok(true) => {}
            Ok(false) => {
                self.stopped = true;
                self.pending = None;
            }
            Err(e) => {
                self.error = Some(e);
                return Err(E::custom("row handler failed"));
            }
        }

        if self.index.is_multiple_of(self.progress_interval as u64) {
            info!("Progress: {} rows", self.index);
        }
        Ok(())
    }
}

struct DocumentVisitor<'a, 'h, F> {
    emitter: &'a mut RowEmitter<'h, F>,
}

impl<'de, F> Visitor<'de> for DocumentVisitor<'_, '_, F>
where
    F: FnMut(JsonRow) -> Result<bool>,
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object with `structure` and `data` arrays")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "structure" if !self.emitter.stopped => {
                    let items: Vec<Value> = map.next_value()?;
                    let structure = Structure::from_raw(items).map_err(de::Error::custom)?;
                    self.emitter.structure = Some(Arc::new(structure));
                }
                "data" => {
                    if self.emitter.structure.is_none() && !self.emitter.stopped {
                        return Err(de::Error::custom("`data` appears before `structure`"));
                    }
                    map.next_value_seed(DataSeed {
                        emitter: &mut *self.emitter,
                    })?;
                    self.emitter.saw_data = true;
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(())
    }
}

struct DataSeed<'a, 'h, F> {
    emitter: &'a mut RowEmitter<'h, F>,
}

impl<'de, F> DeserializeSeed<'de> for DataSeed<'_, '_, F>
where
    F: FnMut(JsonRow) -> Result<bool>,
{
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, F> Visitor<'de> for DataSeed<'_, '_, F>
where
    F: FnMut(JsonRow) -> Result<bool>,
{
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("`data` to be an array of row arrays")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some(row) = seq.next_element::<Value>()? {
            // Remaining rows are consumed but not emitted after a stop.
            if self.emitter.stopped {
                continue;
            }
            let Value::Array(values) = row else {
                return Err(de::Error::custom(format!(
                    "data row {} is not an array",
                    self.emitter.index + 1 + u64::from(self.emitter.pending.is_some())
                )));
            };
            self.emitter.push(values)?;
        }
        if self.emitter.stopped {
            return Ok(());
        }
        self.emitter.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DOC: &str = r#"{
        "meta": {"ignored": [1, 2, 3]},
        "structure": [
            {"name": "kommune", "type": "string"},
            {"name": "antall", "type": "integer"}
        ],
        "data": [["0301", 12], ["1103", 7], ["5001", 3]]
    }"#;

    fn run(content: &str) -> Result<Vec<JsonRow>> {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");
        fs::write(&path, content).unwrap();

        let mut source = JsonSource::new(JsonConfig {
            input: path,
            ..Default::default()
        });
        let mut rows = Vec::new();
        source.process(|row| {
            rows.push(row);
            Ok(true)
        })?;
        Ok(rows)
    }

    #[test]
    fn test_rows_in_order_with_lookahead() {
        let rows = run(DOC).unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].values, vec![Value::from("0301"), Value::from(12)]);
        let flags: Vec<_> = rows.iter().map(|r| (r.index, r.has_next)).collect();
        assert_eq!(flags, vec![(1, true), (2, true), (3, false)]);
        assert_eq!(rows[2].structure.fields[1].name, "antall");
        assert_eq!(rows[2].structure.fields[1].data_type, "integer");
    }

    #[test]
    fn test_structure_raw_is_preserved() {
        let rows = run(DOC).unwrap();
        assert_eq!(
            rows[0].structure.raw[0],
            serde_json::json!({"name": "kommune", "type": "string"})
        );
    }

    #[test]
    fn test_empty_data_array() {
        let rows = run(r#"{"structure": [], "data": []}"#).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_top_level_not_object() {
        let err = run("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, Error::MalformedSource(_)), "got {err:?}");
    }

    #[test]
    fn test_missing_data() {
        let err = run(r#"{"structure": []}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedSource(ref m) if m.contains("data")));
    }

    #[test]
    fn test_data_not_array() {
        let err = run(r#"{"structure": [], "data": {"a": 1}}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedSource(_)));
    }

    #[test]
    fn test_row_not_array() {
        let err = run(r#"{"structure": [], "data": [[1], 2]}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedSource(ref m) if m.contains("row 2")));
    }

    #[test]
    fn test_data_before_structure() {
        let err = run(r#"{"data": [[1]], "structure": []}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedSource(ref m) if m.contains("before")));
    }

    #[test]
    fn test_handler_error_propagates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");
        fs::write(&path, DOC).unwrap();

        let mut source = JsonSource::new(JsonConfig {
            input: path,
            ..Default::default()
        });
        let err = source
            .process(|_| Err(Error::Publish("closed".to_string())))
            .unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
    }

    #[test]
    fn test_handler_stop_consumes_rest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");
        fs::write(&path, DOC).unwrap();

        let mut source = JsonSource::new(JsonConfig {
            input: path,
            ..Default::default()
        });
        let mut seen = 0;
        let stats = source
            .process(|_| {
                seen += 1;
                Ok(false)
            })
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(stats.records, 1);
    }

    #[test]
    fn test_latin1_document() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("l.json");
        let mut bytes = br#"{"structure":[{"name":"navn","type":"string"}],"data":[[""#.to_vec();
        bytes.extend_from_slice(b"S\xF8r");
        bytes.extend_from_slice(br#""]]}"#);
        fs::write(&path, bytes).unwrap();

        let mut source = JsonSource::new(JsonConfig {
            input: path,
            charset: Charset::Latin1,
            ..Default::default()
        });
        let mut values = Vec::new();
        source
            .process(|row| {
                values.extend(row.values);
                Ok(true)
            })
            .unwrap();
        assert_eq!(values, vec![Value::from("Sør")]);
    }
}
