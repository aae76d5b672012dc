//! Core types shared by the rawdata migration pipeline.
//!
//! This crate provides:
//! - [`CompositeKey`] / [`KeySchema`] - schema-driven record keys with a
//!   canonical binary encoding
//! - [`ManifestEntry`] - provenance and schema metadata for each message
//! - [`MessageEnvelope`] - a position plus named binary segments
//! - [`PayloadCipher`] - optional AES-256-GCM segment encryption
//! - Prometheus metrics helpers
//! - Shared error types

mod cipher;
mod envelope;
mod error;
mod key;
mod manifest;
pub mod metrics;

pub use cipher::{IV_LEN, KEY_DERIVATION_ITERATIONS, PayloadCipher};
pub use envelope::{ENTRY_SEGMENT, MANIFEST_SEGMENT, MessageEnvelope};
pub use error::{Error, Result};
pub use key::{
    CompositeKey, FieldType, FieldValue, KeyBuilder, KeyField, KeySchema, KeySequence,
};
pub use manifest::{FieldMapping, ManifestEntry, RecordType, data_type_name};
