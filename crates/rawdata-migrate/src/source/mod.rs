//! Record source adapters.
//!
//! Sources read legacy extract files and hand records to the pipeline in
//! exactly the order they appear in the file. Every record carries a
//! `has_next` lookahead flag so consumers can tell the last record apart
//! without a second pass.
//!
//! # Available Sources
//!
//! - [`DelimitedSource`] - delimited text with a header line
//! - [`JsonSource`] - structured JSON with `structure` and `data` arrays
//!
//! Both accept a single file or a directory; directories are scanned
//! non-recursively and processed in sorted file-name order.

mod delimited;
mod json;

pub use delimited::{DelimitedConfig, DelimitedSource, normalize_field_name};
pub use json::{JsonConfig, JsonRow, JsonSource, Structure, StructureField};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// A source of records, read once, in order.
pub trait RecordSource {
    /// The record type this source produces.
    type Item;

    /// Human-readable name for this source (used in logs).
    fn name(&self) -> &'static str;

    /// Read every record, calling the handler for each in source order.
    ///
    /// The handler returns `Ok(true)` to continue, `Ok(false)` to stop
    /// gracefully, or `Err` to abort the whole read.
    fn process<F>(&mut self, handler: F) -> Result<SourceStats>
    where
        F: FnMut(Self::Item) -> Result<bool>;
}

/// Statistics from reading a source.
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    /// Number of files read to completion (or until the handler stopped).
    pub files_processed: usize,

    /// Total size of the files read, in bytes.
    pub bytes_read: u64,

    /// Records handed to the handler.
    pub records: usize,
}

/// One column of a delimited header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Header text as it appears in the file.
    pub name: String,
    /// Zero-based column index.
    pub index: usize,
    /// Canonical field name used in manifests.
    pub field_name: String,
}

/// One tokenized line of a delimited file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub file_path: String,
    pub file_name: String,
    pub headers: Arc<Vec<Column>>,
    /// Whitespace-trimmed tokens, trailing delimiter removed.
    pub tokens: Vec<String>,
    pub delimiter: char,
    /// One-based record number within the file (header excluded).
    pub index: u64,
    /// Whether more records follow in the same file.
    pub has_next: bool,
}

impl Record {
    /// The canonical header line, joined by the record's delimiter.
    pub fn as_header(&self) -> String {
        let mut out = String::new();
        for (i, column) in self.headers.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }
            out.push_str(&column.field_name);
        }
        out
    }

    /// The record's tokens joined by its delimiter.
    pub fn as_line(&self) -> String {
        let mut out = String::new();
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }
            out.push_str(token);
        }
        out
    }

    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }
}

/// Character set of a source file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Charset {
    #[default]
    Utf8,
    /// ISO-8859-1; transcoded to UTF-8 while reading.
    Latin1,
}

impl Charset {
    /// Canonical charset name, as written to manifests.
    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Latin1 => "ISO-8859-1",
        }
    }

    /// Wrap a reader so it yields UTF-8 bytes.
    pub fn decoding_reader<'a, R: Read + 'a>(self, inner: R) -> Box<dyn Read + 'a> {
        match self {
            Self::Utf8 => Box::new(inner),
            Self::Latin1 => Box::new(Latin1Reader::new(inner)),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Charset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('_', "-").as_str() {
            "UTF-8" | "UTF8" => Ok(Self::Utf8),
            "ISO-8859-1" | "LATIN1" | "LATIN-1" => Ok(Self::Latin1),
            other => Err(format!("unsupported charset: {other}")),
        }
    }
}

impl TryFrom<String> for Charset {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Charset> for String {
    fn from(value: Charset) -> Self {
        value.name().to_string()
    }
}

/// Transcodes ISO-8859-1 bytes to UTF-8 on the fly.
struct Latin1Reader<R> {
    inner: R,
    raw: Vec<u8>,
    decoded: Vec<u8>,
    pos: usize,
}

impl<R: Read> Latin1Reader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            raw: vec![0u8; 64 * 1024],
            decoded: Vec::with_capacity(128 * 1024),
            pos: 0,
        }
    }
}

impl<R: Read> Read for Latin1Reader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.decoded.len() {
            self.decoded.clear();
            self.pos = 0;

            let n = self.inner.read(&mut self.raw)?;
            if n == 0 {
                return Ok(0);
            }
            for &b in &self.raw[..n] {
                if b < 0x80 {
                    self.decoded.push(b);
                } else {
                    self.decoded.push(0xC0 | (b >> 6));
                    self.decoded.push(0x80 | (b & 0x3F));
                }
            }
        }

        let n = out.len().min(self.decoded.len() - self.pos);
        out[..n].copy_from_slice(&self.decoded[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Collect the files to read from a file or directory path.
///
/// Directory entries are filtered by extension (case-insensitive) and sorted
/// for deterministic processing order.
pub(crate) fn collect_files(
    input: &Path,
    extensions: &[&str],
    limit: Option<usize>,
) -> Result<Vec<PathBuf>> {
    let mut files = if input.is_file() {
        vec![input.to_path_buf()]
    } else if input.is_dir() {
        let mut entries: Vec<_> = fs::read_dir(input)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().is_some_and(|ext| {
                        let ext = ext.to_string_lossy();
                        extensions.iter().any(|want| ext.eq_ignore_ascii_case(want))
                    })
            })
            .collect();

        entries.sort();
        entries
    } else {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Input path does not exist: {}", input.display()),
        )));
    };

    if let Some(limit) = limit {
        files.truncate(limit);
    }

    Ok(files)
}

/// Split a path into (parent directory, file name) strings.
pub(crate) fn path_parts(path: &Path) -> (String, String) {
    let dir = path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, name)
}
