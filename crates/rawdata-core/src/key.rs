//! Composite record keys with a canonical binary layout.
//!
//! A [`CompositeKey`] is an ordered set of typed fields described by a
//! [`KeySchema`]. The schema is plain data: an ordered list of
//! `(name, type)` pairs plus the subset of names that act as *group keys*.
//! One generic key type serves every dataset.
//!
//! # Encoding
//!
//! Fields are concatenated in schema order with no self-description:
//!
//! ```text
//! String: [u32 big-endian byte length][UTF-8 bytes]
//! Long:   [i64 big-endian]
//! Int:    [i32 big-endian]
//! ```
//!
//! Decoding therefore requires the schema. The layout is byte-exact in both
//! directions, so encoded keys are usable directly as ordered-store keys.
//! Integers keep their two's complement bytes: in key-byte order a negative
//! value sorts after every non-negative one.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Declared type of a key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// UTF-8 string, length-prefixed.
    String,
    /// 64-bit signed integer.
    Long,
    /// 32-bit signed integer.
    Int,
}

impl FieldType {
    /// Lower-case type name as used in dataset descriptions.
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Long => "long",
            Self::Int => "int",
        }
    }
}

/// A typed key field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Str(String),
    Long(i64),
    Int(i32),
}

impl FieldValue {
    /// The type this value encodes as.
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Str(_) => FieldType::String,
            Self::Long(_) => FieldType::Long,
            Self::Int(_) => FieldType::Int,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Str(s) => 4 + s.len(),
            Self::Long(_) => 8,
            Self::Int(_) => 4,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Long(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

/// A named, typed field in a key schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyField {
    pub name: String,
    pub field_type: FieldType,
}

/// Ordered field layout plus group-key designation for one dataset.
#[derive(Debug, PartialEq, Eq)]
pub struct KeySchema {
    fields: Vec<KeyField>,
    /// Indices into `fields` of the group-key fields, in declaration order.
    group_indices: Vec<usize>,
}

impl KeySchema {
    /// Build a schema from `(name, type)` pairs in encoding order and the
    /// names of the fields that form the group key.
    ///
    /// Fails if a field name repeats or a group key names an unknown field.
    ///
    /// # Example
    ///
    /// ```
    /// use rawdata_core::{FieldType, KeySchema};
    ///
    /// let schema = KeySchema::new(
    ///     [("filename", FieldType::String), ("fileId", FieldType::Long)],
    ///     &["fileId"],
    /// )?;
    /// assert_eq!(schema.fields().len(), 2);
    /// # Ok::<(), rawdata_core::Error>(())
    /// ```
    pub fn new<I, N, G>(fields: I, group_keys: &[G]) -> Result<Arc<Self>>
    where
        I: IntoIterator<Item = (N, FieldType)>,
        N: Into<String>,
        G: AsRef<str>,
    {
        let mut schema_fields: Vec<KeyField> = Vec::new();
        for (name, field_type) in fields {
            let name = name.into();
            if schema_fields.iter().any(|f| f.name == name) {
                return Err(Error::invalid_key(name, "declared more than once"));
            }
            schema_fields.push(KeyField { name, field_type });
        }

        if schema_fields.is_empty() {
            return Err(Error::invalid_key("", "schema declares no fields"));
        }

        let mut group_indices = Vec::with_capacity(group_keys.len());
        for group_key in group_keys {
            let group_key = group_key.as_ref();
            let index = schema_fields
                .iter()
                .position(|f| f.name == group_key)
                .ok_or_else(|| Error::invalid_key(group_key, "group key is not a schema field"))?;
            if !group_indices.contains(&index) {
                group_indices.push(index);
            }
        }

        Ok(Arc::new(Self {
            fields: schema_fields,
            group_indices,
        }))
    }

    /// All fields in encoding order.
    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    /// Names of the group-key fields.
    pub fn group_keys(&self) -> impl Iterator<Item = &str> {
        self.group_indices
            .iter()
            .map(|&i| self.fields[i].name.as_str())
    }

    /// Position of a field in encoding order.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Start building a key against this schema.
    pub fn key(self: &Arc<Self>) -> KeyBuilder {
        KeyBuilder {
            schema: Arc::clone(self),
            values: vec![None; self.fields.len()],
            error: None,
        }
    }
}

/// Builder that fills key fields by name.
///
/// Errors (unknown field, type mismatch) are deferred to [`KeyBuilder::build`].
pub struct KeyBuilder {
    schema: Arc<KeySchema>,
    values: Vec<Option<FieldValue>>,
    error: Option<Error>,
}

impl KeyBuilder {
    /// Set a field value.
    pub fn set(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let value = value.into();
        match self.schema.index_of(name) {
            Some(index) => {
                let expected = self.schema.fields[index].field_type;
                if value.field_type() == expected {
                    self.values[index] = Some(value);
                } else {
                    self.error = Some(Error::invalid_key(
                        name,
                        format!(
                            "expected {}, got {}",
                            expected.name(),
                            value.field_type().name()
                        ),
                    ));
                }
            }
            None => {
                self.error = Some(Error::invalid_key(name, "not a schema field"));
            }
        }
        self
    }

    /// Finish the key. Every schema field must have been set.
    pub fn build(self) -> Result<CompositeKey> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let mut values = Vec::with_capacity(self.values.len());
        for (field, value) in self.schema.fields.iter().zip(self.values) {
            match value {
                Some(v) => values.push(v),
                None => return Err(Error::invalid_key(&field.name, "missing value")),
            }
        }
        Ok(CompositeKey {
            schema: self.schema,
            values,
        })
    }
}

/// An immutable, schema-typed record identity.
#[derive(Debug, Clone)]
pub struct CompositeKey {
    schema: Arc<KeySchema>,
    values: Vec<FieldValue>,
}

impl CompositeKey {
    /// Build a key from values given in schema order.
    pub fn from_values(schema: &Arc<KeySchema>, values: Vec<FieldValue>) -> Result<Self> {
        if values.len() != schema.fields.len() {
            return Err(Error::invalid_key(
                "",
                format!(
                    "expected {} values, got {}",
                    schema.fields.len(),
                    values.len()
                ),
            ));
        }
        for (field, value) in schema.fields.iter().zip(&values) {
            if field.field_type != value.field_type() {
                return Err(Error::invalid_key(
                    &field.name,
                    format!(
                        "expected {}, got {}",
                        field.field_type.name(),
                        value.field_type().name()
                    ),
                ));
            }
        }
        Ok(Self {
            schema: Arc::clone(schema),
            values,
        })
    }

    pub fn schema(&self) -> &Arc<KeySchema> {
        &self.schema
    }

    /// Field values in schema order.
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Look up a field value by name.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.schema.index_of(name).map(|i| &self.values[i])
    }

    /// Values of the group-key fields, in group-key order.
    pub fn group_values(&self) -> impl Iterator<Item = &FieldValue> {
        self.schema.group_indices.iter().map(|&i| &self.values[i])
    }

    /// Number of bytes [`encode`](Self::encode) produces.
    pub fn encoded_len(&self) -> usize {
        self.values.iter().map(FieldValue::encoded_len).sum()
    }

    /// Encode to the canonical binary layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the canonical binary layout to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        for value in &self.values {
            match value {
                FieldValue::Str(s) => {
                    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                    buf.extend_from_slice(s.as_bytes());
                }
                FieldValue::Long(v) => buf.extend_from_slice(&v.to_be_bytes()),
                FieldValue::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
            }
        }
    }

    /// Decode bytes produced by [`encode`](Self::encode) under the same schema.
    ///
    /// The input must be consumed exactly; short or trailing bytes are errors.
    pub fn decode(schema: &Arc<KeySchema>, bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let mut values = Vec::with_capacity(schema.fields.len());

        for field in &schema.fields {
            let value = match field.field_type {
                FieldType::String => {
                    let len = u32::from_be_bytes(take::<4>(&mut cursor, &field.name)?) as usize;
                    if cursor.len() < len {
                        return Err(Error::KeyCodec(format!(
                            "field '{}': declared {} bytes, {} remaining",
                            field.name,
                            len,
                            cursor.len()
                        )));
                    }
                    let (raw, rest) = cursor.split_at(len);
                    cursor = rest;
                    let s = std::str::from_utf8(raw).map_err(|e| {
                        Error::KeyCodec(format!("field '{}': {}", field.name, e))
                    })?;
                    FieldValue::Str(s.to_string())
                }
                FieldType::Long => {
                    FieldValue::Long(i64::from_be_bytes(take::<8>(&mut cursor, &field.name)?))
                }
                FieldType::Int => {
                    FieldValue::Int(i32::from_be_bytes(take::<4>(&mut cursor, &field.name)?))
                }
            };
            values.push(value);
        }

        if !cursor.is_empty() {
            return Err(Error::KeyCodec(format!(
                "{} trailing bytes after last field",
                cursor.len()
            )));
        }

        Ok(Self {
            schema: Arc::clone(schema),
            values,
        })
    }

    /// True when every group-key field equals the other key's.
    ///
    /// Non-group fields are ignored. Keys of different schemas are never in
    /// the same group.
    pub fn same_group(&self, other: &CompositeKey) -> bool {
        self.same_schema(other) && self.group_values().eq(other.group_values())
    }

    fn same_schema(&self, other: &CompositeKey) -> bool {
        Arc::ptr_eq(&self.schema, &other.schema) || self.schema == other.schema
    }
}

fn take<const N: usize>(cursor: &mut &[u8], field: &str) -> Result<[u8; N]> {
    if cursor.len() < N {
        return Err(Error::KeyCodec(format!(
            "field '{}': need {} bytes, {} remaining",
            field,
            N,
            cursor.len()
        )));
    }
    let (head, rest) = cursor.split_at(N);
    *cursor = rest;
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    Ok(out)
}

impl PartialEq for CompositeKey {
    fn eq(&self, other: &Self) -> bool {
        self.same_schema(other) && self.values == other.values
    }
}

impl Eq for CompositeKey {}

impl Hash for CompositeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.values.hash(state);
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (field, value)) in self.schema.fields.iter().zip(&self.values).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", field.name, value)?;
        }
        f.write_str("}")
    }
}

/// Per-file monotonic counter mixed into keys to keep them unique when
/// business fields collide.
///
/// Owned by whoever builds keys for one source file; never shared.
#[derive(Debug, Default)]
pub struct KeySequence {
    current: i64,
}

impl KeySequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the new value. The first call returns 1.
    pub fn next_value(&mut self) -> i64 {
        self.current += 1;
        self.current
    }

    /// The last value handed out (0 before the first call).
    pub fn current(&self) -> i64 {
        self.current
    }
}
