//! Delimited text source adapter.
//!
//! Reads header-first delimited files (RFC 4180 quoting) and emits one
//! [`Record`] per data line. Header names are normalized to UpperCamelCase
//! field names, tokens are whitespace-trimmed, and a trailing delimiter is
//! tolerated when the first line of the file ends with one.

use super::{Charset, Column, Record, RecordSource, SourceStats, collect_files, path_parts};
use crate::{Error, Result};
use rawdata_core::metrics::RECORDS_READ;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for the delimited source.
#[derive(Debug, Clone)]
pub struct DelimitedConfig {
    /// Input file or directory path.
    pub input: PathBuf,

    /// Field delimiter (single ASCII character).
    pub delimiter: u8,

    /// Character set of the input files.
    pub charset: Charset,

    /// Limit number of files to process (for testing).
    pub limit: Option<usize>,

    /// Progress reporting interval (records).
    pub progress_interval: usize,
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            delimiter: b';',
            charset: Charset::Utf8,
            limit: None,
            progress_interval: 100_000,
        }
    }
}

/// Delimited file record source.
pub struct DelimitedSource {
    config: DelimitedConfig,
}

impl DelimitedSource {
    pub fn new(config: DelimitedConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DelimitedConfig {
        &self.config
    }

    fn process_file<F>(&self, path: &Path, handler: &mut F, stats: &mut SourceStats) -> Result<bool>
    where
        F: FnMut(Record) -> Result<bool>,
    {
        let delimiter = self.config.delimiter;
        let file = File::open(path)?;
        let mut reader = BufReader::new(self.config.charset.decoding_reader(file));

        // Peek the first line to decide whether lines end with a delimiter.
        let mut first_line = String::new();
        if reader.read_line(&mut first_line)? == 0 {
            warn!("Skipping empty file: {}", path.display());
            return Ok(true);
        }
        let trailing_delimiter = first_line
            .trim_end_matches(['\r', '\n'])
            .ends_with(delimiter as char);
        debug!(
            "{}: trailing delimiter {}",
            path.display(),
            if trailing_delimiter { "detected" } else { "not detected" }
        );

        let chained = Cursor::new(first_line.into_bytes()).chain(reader);
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(chained);

        let header_tokens = trim_tokens(csv_reader.headers()?.iter(), trailing_delimiter);
        if header_tokens.iter().all(String::is_empty) {
            return Err(Error::MalformedSource(format!(
                "{}: header line has no columns",
                path.display()
            )));
        }
        let headers: Arc<Vec<Column>> = Arc::new(
            header_tokens
                .into_iter()
                .enumerate()
                .map(|(index, name)| Column {
                    field_name: normalize_field_name(&name),
                    name,
                    index,
                })
                .collect(),
        );

        let (file_path, file_name) = path_parts(path);
        let mut rows = csv_reader.into_records().peekable();
        let mut index = 0u64;

        while let Some(row) = rows.next() {
            let row = row?;
            index += 1;

            let record = Record {
                file_path: file_path.clone(),
                file_name: file_name.clone(),
                headers: Arc::clone(&headers),
                tokens: trim_tokens(row.iter(), trailing_delimiter),
                delimiter: delimiter as char,
                index,
                has_next: rows.peek().is_some(),
            };
            stats.records += 1;
            metrics::counter!(RECORDS_READ).increment(1);

            if !handler(record)? {
                info!("Handler signaled stop");
                return Ok(false);
            }

            if stats.records.is_multiple_of(self.config.progress_interval) {
                info!("Progress: {} records", stats.records);
            }
        }

        Ok(true)
    }
}

impl RecordSource for DelimitedSource {
    type Item = Record;

    fn name(&self) -> &'static str {
        "delimited"
    }

    fn process<F>(&mut self, mut handler: F) -> Result<SourceStats>
    where
        F: FnMut(Record) -> Result<bool>,
    {
        let mut stats = SourceStats::default();

        let files = collect_files(
            &self.config.input,
            &["csv", "txt", "dat"],
            self.config.limit,
        )?;
        info!("Found {} delimited files to process", files.len());

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
                break;
            }
        }

        Ok(stats)
    }
}

fn trim_tokens<'a>(tokens: impl Iterator<Item = &'a str>, trailing_delimiter: bool) -> Vec<String> {
    let mut out: Vec<String> = tokens.map(|t| t.trim().to_string()).collect();
    if trailing_delimiter && out.last().is_some_and(String::is_empty) {
        out.pop();
    }
    out
}

/// Normalize a header name to an UpperCamelCase field name.
///
/// `?`, tabs and line breaks are dropped. Whitespace, `_`, `(` and `)`
/// separate words; each word is lowercased with its first letter
/// capitalized. `"FilID"` becomes `"Filid"` and `"Er linja aktiv?"`
/// becomes `"ErLinjaAktiv"`.
pub fn normalize_field_name(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut capitalize = true;

    for ch in header.chars() {
        match ch {
            '?' | '\t' | '\r' | '\n' => {}
            '_' | '(' | ')' => capitalize = true,
            c if c.is_whitespace() => capitalize = true,
            c if capitalize => {
                out.extend(c.to_uppercase());
                capitalize = false;
            }
            c => out.extend(c.to_lowercase()),
        }
    }

    out
}
