//! Manifest metadata attached to every published message.
//!
//! The manifest describes provenance (topic, position, source file), encoding
//! (charset, content type, length) and the payload schema as an ordered list
//! of field name → declared type pairs. It is serialized as JSON into the
//! `manifest.json` segment of a [`MessageEnvelope`](crate::MessageEnvelope).

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a message carries one source record or a folded group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    #[default]
    Single,
    Group,
}

/// One payload schema entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl FieldMapping {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Metadata envelope for one outgoing message. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub topic: String,
    pub position: String,
    pub resource_type: String,
    pub content_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub charset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub content_length: usize,
    pub created_date: DateTime<Utc>,
    pub source_path: String,
    pub source_file: String,
    pub source_charset: String,
    pub record_type: RecordType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    /// Payload schema for structured JSON entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_mapping: Vec<FieldMapping>,
    /// Payload schema for delimited entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub csv_mapping: Vec<FieldMapping>,
}

impl ManifestEntry {
    /// Serialize to compact JSON bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Format a declared type the way manifests expect: `string` → `String`.
pub fn data_type_name(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}
