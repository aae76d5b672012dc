//! Dataset descriptions and record key derivation.
//!
//! A dataset is described by a small YAML document:
//!
//! ```yaml
//! metadata:
//!   source: utdanning
//!   dataset: karakter
//!   tag: "2019"
//! fileDescriptor:
//!   charset: ISO-8859-1
//!   contentType: text/csv
//!   delimiter: ";"
//! key:
//!   fields:
//!     - { name: filename, type: string, from: filename }
//!     - { name: fileId, type: long, column: 0 }
//!     - { name: fnr, type: int, column: "Fødselsnummer" }
//!     - { name: rowId, type: long, column: 1 }
//!   groupKeys: [fileId, fnr]
//! ```
//!
//! The `key` section resolves to a [`KeySchema`] plus, per field, where its
//! value comes from: the file name, a column (by index or header name), or a
//! per-file line sequence.

use crate::error::{Error, Result};
use crate::source::{Charset, Record};
use rawdata_core::{CompositeKey, FieldType, FieldValue, KeySchema, KeySequence};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// A complete dataset description.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DatasetSpec {
    #[serde(default)]
    pub metadata: DatasetMetadata,
    #[serde(default)]
    pub file_descriptor: FileDescriptor,
    /// Required for delimited datasets.
    #[serde(default)]
    pub key: Option<KeySpec>,
}

impl DatasetSpec {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let spec: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid dataset description: {e}")))?;
        spec.file_descriptor.delimiter_byte()?;
        Ok(spec)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Provenance fields copied into every manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetMetadata {
    pub source: Option<String>,
    pub dataset: Option<String>,
    pub tag: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileDescriptor {
    #[serde(default)]
    pub charset: Charset,
    pub content_type: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

impl Default for FileDescriptor {
    fn default() -> Self {
        Self {
            charset: Charset::default(),
            content_type: None,
            delimiter: default_delimiter(),
        }
    }
}

fn default_delimiter() -> String {
    ";".to_string()
}

impl FileDescriptor {
    /// The delimiter as a single byte; multi-byte delimiters are rejected.
    pub fn delimiter_byte(&self) -> Result<u8> {
        match self.delimiter.as_bytes() {
            [b] if b.is_ascii() => Ok(*b),
            _ => Err(Error::Config(format!(
                "delimiter must be a single ASCII character, got {:?}",
                self.delimiter
            ))),
        }
    }
}

/// The `key` section of a dataset description.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KeySpec {
    pub fields: Vec<KeyFieldSpec>,
    pub group_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyFieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub column: Option<ColumnRef>,
    #[serde(default)]
    pub from: Option<DerivedValue>,
}

/// A column by zero-based index or by header name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

/// Key values that do not come from a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivedValue {
    /// The source file name.
    Filename,
    /// 1, 2, 3, … per file, in read order.
    Sequence,
}

/// Where one key field's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOrigin {
    FileName,
    Column(ColumnRef),
    Sequence,
}

/// A resolved dataset key: schema plus value origins.
#[derive(Debug, Clone)]
pub struct DatasetKey {
    schema: Arc<KeySchema>,
    origins: Vec<KeyOrigin>,
}

impl DatasetKey {
    pub fn new(fields: Vec<(String, FieldType, KeyOrigin)>, group_keys: &[String]) -> Result<Self> {
        for (name, field_type, origin) in &fields {
            let ok = match origin {
                KeyOrigin::FileName => *field_type == FieldType::String,
                KeyOrigin::Sequence => *field_type != FieldType::String,
                KeyOrigin::Column(_) => true,
            };
            if !ok {
                return Err(Error::Config(format!(
                    "key field {name}: type {} does not fit origin {origin:?}",
                    field_type.name()
                )));
            }
        }

        let schema = KeySchema::new(
            fields.iter().map(|(name, ty, _)| (name.clone(), *ty)),
            group_keys,
        )?;
        let origins = fields.into_iter().map(|(_, _, origin)| origin).collect();
        Ok(Self { schema, origins })
    }

    pub fn from_spec(spec: &KeySpec) -> Result<Self> {
        let fields = spec
            .fields
            .iter()
            .map(|field| {
                let origin = match (&field.column, field.from) {
                    (Some(column), None) => KeyOrigin::Column(column.clone()),
                    (None, Some(DerivedValue::Filename)) => KeyOrigin::FileName,
                    (None, Some(DerivedValue::Sequence)) => KeyOrigin::Sequence,
                    _ => {
                        return Err(Error::Config(format!(
                            "key field {} needs exactly one of `column` or `from`",
                            field.name
                        )));
                    }
                };
                Ok((field.name.clone(), field.field_type, origin))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(fields, &spec.group_keys)
    }

    pub fn schema(&self) -> &Arc<KeySchema> {
        &self.schema
    }

    /// A key builder holding the per-file sequence state.
    pub fn builder(&self) -> RecordKeyBuilder<'_> {
        RecordKeyBuilder {
            key: self,
            current_file: None,
            sequence: KeySequence::new(),
        }
    }
}

/// Derives keys for the records of a source, in read order.
pub struct RecordKeyBuilder<'a> {
    key: &'a DatasetKey,
    current_file: Option<(String, String)>,
    sequence: KeySequence,
}

impl RecordKeyBuilder<'_> {
    pub fn key_for(&mut self, record: &Record) -> Result<CompositeKey> {
        let same_file = self
            .current_file
            .as_ref()
            .is_some_and(|(path, name)| *path == record.file_path && *name == record.file_name);
        if !same_file {
            self.current_file = Some((record.file_path.clone(), record.file_name.clone()));
            self.sequence = KeySequence::new();
        }

        let mut values = Vec::with_capacity(self.key.origins.len());
        for (field, origin) in self.key.schema.fields().iter().zip(&self.key.origins) {
            let value = match origin {
                KeyOrigin::FileName => FieldValue::from(record.file_name.clone()),
                KeyOrigin::Sequence => match field.field_type {
                    FieldType::Int => {
                        let next = self.sequence.next_value();
                        FieldValue::Int(i32::try_from(next).map_err(|_| {
                            Error::MalformedSource(format!(
                                "{}: sequence {next} overflows int field {}",
                                record.file_name, field.name
                            ))
                        })?)
                    }
                    _ => FieldValue::Long(self.sequence.next_value()),
                },
                KeyOrigin::Column(column) => {
                    let token = column_token(record, column).ok_or_else(|| {
                        Error::MalformedSource(format!(
                            "{} record {}: no column {:?} for key field {}",
                            record.file_name, record.index, column, field.name
                        ))
                    })?;
                    parse_token(token, field.field_type).ok_or_else(|| {
                        Error::MalformedSource(format!(
                            "{} record {}: '{}' is not a valid {} for key field {}",
                            record.file_name,
                            record.index,
                            token,
                            field.field_type.name(),
                            field.name
                        ))
                    })?
                }
            };
            values.push(value);
        }

        Ok(CompositeKey::from_values(&self.key.schema, values)?)
    }
}

fn column_token<'r>(record: &'r Record, column: &ColumnRef) -> Option<&'r str> {
    let index = match column {
        ColumnRef::Index(index) => *index,
        ColumnRef::Name(name) => {
            record
                .headers
                .iter()
                .find(|c| c.name == *name || c.field_name == *name)?
                .index
        }
    };
    record.token(index)
}

fn parse_token(token: &str, field_type: FieldType) -> Option<FieldValue> {
    match field_type {
        FieldType::String => Some(FieldValue::from(token.to_string())),
        FieldType::Long => token.parse::<i64>().ok().map(FieldValue::Long),
        FieldType::Int => token.parse::<i32>().ok().map(FieldValue::Int),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Column;

    const KARAKTER: &str = r#"
metadata:
  source: utdanning
  dataset: karakter
  tag: "2019"
fileDescriptor:
  charset: ISO-8859-1
  contentType: text/csv
  delimiter: ";"
key:
  fields:
    - { name: filename, type: string, from: filename }
    - { name: fileId, type: long, column: 0 }
    - { name: fnr, type: int, column: "Fødselsnummer" }
    - { name: rowId, type: long, column: 1 }
  groupKeys: [fileId, fnr]
"#;

    fn record(file: &str, tokens: &[&str]) -> Record {
        Record {
            file_path: "/data".to_string(),
            file_name: file.to_string(),
            headers: Arc::new(
                ["FilID", "RadID", "Fødselsnummer"]
                    .iter()
                    .enumerate()
                    .map(|(index, name)| Column {
                        name: name.to_string(),
                        index,
                        field_name: crate::source::normalize_field_name(name),
                    })
                    .collect(),
            ),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            delimiter: ';',
            index: 1,
            has_next: false,
        }
    }

    #[test]
    fn test_parse_karakter_description() {
        let spec = DatasetSpec::from_yaml_str(KARAKTER).unwrap();
        assert_eq!(spec.metadata.dataset.as_deref(), Some("karakter"));
        assert_eq!(spec.file_descriptor.charset, Charset::Latin1);
        assert_eq!(spec.file_descriptor.delimiter_byte().unwrap(), b';');

        let key = DatasetKey::from_spec(spec.key.as_ref().unwrap()).unwrap();
        let names: Vec<_> = key.schema().fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["filename", "fileId", "fnr", "rowId"]);
    }

    #[test]
    fn test_key_from_columns_and_filename() {
        let spec = DatasetSpec::from_yaml_str(KARAKTER).unwrap();
        let key = DatasetKey::from_spec(spec.key.as_ref().unwrap()).unwrap();
        let mut builder = key.builder();

        let a = builder.key_for(&record("k.csv", &["7", "1", "123"])).unwrap();
        let b = builder.key_for(&record("k.csv", &["7", "2", "123"])).unwrap();
        let c = builder.key_for(&record("k.csv", &["7", "3", "456"])).unwrap();

        assert_eq!(a.get("filename"), Some(&FieldValue::from("k.csv".to_string())));
        assert_eq!(a.get("fnr"), Some(&FieldValue::Int(123)));
        assert!(a.same_group(&b));
        assert!(!a.same_group(&c));
    }

    #[test]
    fn test_sequence_restarts_per_file() {
        let key = DatasetKey::new(
            vec![
                ("filename".to_string(), FieldType::String, KeyOrigin::FileName),
                ("line".to_string(), FieldType::Long, KeyOrigin::Sequence),
            ],
            &["filename".to_string()],
        )
        .unwrap();
        let mut builder = key.builder();

        let lines: Vec<_> = [("a.csv"), ("a.csv"), ("b.csv")]
            .iter()
            .map(|file| {
                builder
                    .key_for(&record(file, &["1", "1", "1"]))
                    .unwrap()
                    .get("line")
                    .cloned()
            })
            .collect();
        assert_eq!(
            lines,
            vec![
                Some(FieldValue::Long(1)),
                Some(FieldValue::Long(2)),
                Some(FieldValue::Long(1)),
            ]
        );
    }

    #[test]
    fn test_bad_token_is_malformed_source() {
        let spec = DatasetSpec::from_yaml_str(KARAKTER).unwrap();
        let key = DatasetKey::from_spec(spec.key.as_ref().unwrap()).unwrap();
        let err = key
            .builder()
            .key_for(&record("k.csv", &["seven", "1", "123"]))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedSource(ref m) if m.contains("fileId")));

        let err = key
            .builder()
            .key_for(&record("k.csv", &["7"]))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedSource(_)));
    }

    #[test]
    fn test_field_needs_exactly_one_origin() {
        let yaml = r#"
key:
  fields:
    - { name: id, type: long }
  groupKeys: [id]
"#;
        let spec = DatasetSpec::from_yaml_str(yaml).unwrap();
        assert!(matches!(
            DatasetKey::from_spec(spec.key.as_ref().unwrap()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_filename_origin_requires_string() {
        let err = DatasetKey::new(
            vec![("f".to_string(), FieldType::Long, KeyOrigin::FileName)],
            &["f".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_multibyte_delimiter_rejected() {
        let yaml = "fileDescriptor:\n  delimiter: \"||\"\n";
        assert!(matches!(
            DatasetSpec::from_yaml_str(yaml),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_unknown_group_key_rejected() {
        let err = DatasetKey::new(
            vec![("id".to_string(), FieldType::Long, KeyOrigin::Column(ColumnRef::Index(0)))],
            &["missing".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Core(_)));
    }
}
