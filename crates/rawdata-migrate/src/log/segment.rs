//! Segment-file log provider.
//!
//! This module provides the [`SegmentProducer`] which appends envelopes to
//! length-prefixed segment files and handles sealing/rotation.
//!
//! # Segment Format
//!
//! Each segment file is a sequence of frames:
//! ```text
//! [u32 LE frame length]
//!   [u32 LE position length][position bytes]
//!   [u32 LE segment count]
//!   { [u32 LE name length][name bytes][u32 LE data length][data bytes] }*
//! ```
//!
//! # Sealing
//!
//! Segments are sealed when they exceed the size threshold or, if
//! configured, when they have been open longer than the age threshold.
//! On seal the file is flushed and closed, optionally gzipped to
//! `.rawdata.gz`, and the next write opens a new segment.

use super::{LogClient, LogProducer};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use rawdata_core::MessageEnvelope;
use rawdata_core::metrics::SEGMENTS_SEALED;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SEGMENT_EXTENSION: &str = "rawdata";
const COMPRESSED_EXTENSION: &str = "rawdata.gz";

/// Configuration for segment producers.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Base directory; each topic writes to its own subdirectory.
    pub output_dir: PathBuf,

    /// Maximum segment size in bytes before sealing.
    /// Default: 64 MiB
    pub max_segment_size: usize,

    /// Maximum time a segment stays open before sealing.
    /// Default: none
    pub max_segment_age: Option<Duration>,

    /// Flush and fsync after this many messages.
    /// Default: 1000
    pub sync_interval: usize,

    /// Compress sealed segments with gzip.
    /// Default: true
    pub compress: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./rawdata"),
            max_segment_size: 64 * 1024 * 1024,
            max_segment_age: None,
            sync_interval: 1000,
            compress: true,
        }
    }
}

/// Information about a sealed segment.
#[derive(Debug, Clone)]
pub struct SealedSegment {
    /// Path to the segment file (`.rawdata.gz` if compressed).
    pub path: PathBuf,

    pub segment_number: u64,

    pub message_count: usize,

    /// Uncompressed size of the segment in bytes.
    pub size_bytes: usize,

    /// Compressed size in bytes (same as size_bytes if not compressed).
    pub compressed_size_bytes: usize,

    /// First and last positions written to the segment.
    pub first_position: String,
    pub last_position: String,

    pub sealed_at: DateTime<Utc>,
}

/// Internal state for the current segment being written.
struct CurrentSegment {
    writer: BufWriter<File>,
    path: PathBuf,
    message_count: usize,
    size_bytes: usize,
    opened_at: Instant,
    first_position: String,
    last_position: String,
    unsynced: usize,
}

/// Segment-file producer for one topic.
///
/// Thread-safe: uses internal locking for writes.
pub struct SegmentProducer {
    topic: String,
    config: SegmentConfig,
    dir: PathBuf,
    current: Mutex<Option<CurrentSegment>>,
    segment_number: AtomicU64,
    total_messages: AtomicUsize,
    total_bytes: AtomicUsize,
    total_compressed_bytes: AtomicUsize,
    sealed: Mutex<Vec<SealedSegment>>,
    closed: AtomicBool,
}

impl SegmentProducer {
    pub fn new(topic: &str, config: SegmentConfig) -> Result<Self> {
        let dir = config.output_dir.join(topic);
        fs::create_dir_all(&dir)?;

        let next_segment = find_next_segment_number(&dir, topic)?;

        info!(
            "Segment producer for {} initialized: dir={}, max_size={}, max_age={:?}, starting at segment {}",
            topic,
            dir.display(),
            config.max_segment_size,
            config.max_segment_age,
            next_segment
        );

        Ok(Self {
            topic: topic.to_string(),
            config,
            dir,
            current: Mutex::new(None),
            segment_number: AtomicU64::new(next_segment),
            total_messages: AtomicUsize::new(0),
            total_bytes: AtomicUsize::new(0),
            total_compressed_bytes: AtomicUsize::new(0),
            sealed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Directory this producer writes segments to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Uses 9-digit zero-padded numbering for lexicographic sorting.
    fn segment_path(&self, segment_number: u64) -> PathBuf {
        self.dir.join(format!(
            "{}-{:09}.{}",
            self.topic, segment_number, SEGMENT_EXTENSION
        ))
    }

    fn open_segment(&self, first_position: &str) -> Result<CurrentSegment> {
        let path = self.segment_path(self.segment_number.load(Ordering::SeqCst));
        debug!("Creating new segment: {}", path.display());

        let file = File::create(&path)?;
        Ok(CurrentSegment {
            writer: BufWriter::with_capacity(1024 * 1024, file),
            path,
            message_count: 0,
            size_bytes: 0,
            opened_at: Instant::now(),
            first_position: first_position.to_string(),
            last_position: first_position.to_string(),
            unsynced: 0,
        })
    }

    /// Append one envelope to an open segment; returns whether it must seal.
    fn write_locked(&self, current: &mut Option<CurrentSegment>, message: &MessageEnvelope) -> Result<bool> {
        if current.is_none() {
            *current = Some(self.open_segment(&message.position)?);
        }
        let Some(segment) = current.as_mut() else {
            return Err(Error::Publish("no open segment".to_string()));
        };

        let frame = encode_frame(message);
        segment.writer.write_all(&frame)?;

        segment.message_count += 1;
        segment.size_bytes += frame.len();
        segment.last_position.clone_from(&message.position);
        segment.unsynced += 1;

        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(frame.len(), Ordering::Relaxed);

        if segment.unsynced >= self.config.sync_interval.max(1) {
            segment.writer.flush()?;
            segment.writer.get_ref().sync_data()?;
            segment.unsynced = 0;
        }

        let too_big = segment.size_bytes >= self.config.max_segment_size;
        let too_old = self
            .config
            .max_segment_age
            .is_some_and(|age| segment.opened_at.elapsed() >= age);
        Ok(too_big || too_old)
    }

    /// Seal the current segment, if any.
    ///
    /// If compression is enabled, the segment is gzipped and renamed to
    /// `.rawdata.gz`.
    pub fn seal(&self) -> Result<Option<SealedSegment>> {
        let mut current = self.current.lock();
        self.seal_locked(&mut current)
    }

    fn seal_locked(&self, current: &mut Option<CurrentSegment>) -> Result<Option<SealedSegment>> {
        let Some(segment) = current.take() else {
            return Ok(None);
        };

        let CurrentSegment {
            mut writer,
            path,
            message_count,
            size_bytes,
            first_position,
            last_position,
            ..
        } = segment;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        let segment_number = self.segment_number.fetch_add(1, Ordering::SeqCst);

        let (final_path, compressed_size) = if self.config.compress {
            let gz_path = path.with_extension(COMPRESSED_EXTENSION);
            let compressed_bytes = compress_file(&path, &gz_path)?;

            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove uncompressed segment: {}", e);
            }

            info!(
                "Sealed segment {}: {} messages ({}..{}), {} bytes -> {} bytes ({:.1}%) at {}",
                segment_number,
                message_count,
                first_position,
                last_position,
                size_bytes,
                compressed_bytes,
                (compressed_bytes as f64 / size_bytes.max(1) as f64) * 100.0,
                gz_path.display()
            );

            (gz_path, compressed_bytes)
        } else {
            info!(
                "Sealed segment {}: {} messages ({}..{}), {} bytes at {}",
                segment_number,
                message_count,
                first_position,
                last_position,
                size_bytes,
                path.display()
            );
            (path, size_bytes)
        };

        self.total_compressed_bytes
            .fetch_add(compressed_size, Ordering::Relaxed);
        metrics::counter!(SEGMENTS_SEALED).increment(1);

        let sealed = SealedSegment {
            path: final_path,
            segment_number,
            message_count,
            size_bytes,
            compressed_size_bytes: compressed_size,
            first_position,
            last_position,
            sealed_at: Utc::now(),
        };
        self.sealed.lock().push(sealed.clone());

        Ok(Some(sealed))
    }

    /// Segments sealed by this producer so far.
    pub fn sealed_segments(&self) -> Vec<SealedSegment> {
        self.sealed.lock().clone()
    }

    pub fn stats(&self) -> SegmentStats {
        let current = self.current.lock();
        let (current_messages, current_bytes) = current
            .as_ref()
            .map(|s| (s.message_count, s.size_bytes))
            .unwrap_or((0, 0));

        SegmentStats {
            segment_number: self.segment_number.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            total_compressed_bytes: self.total_compressed_bytes.load(Ordering::Relaxed),
            current_segment_messages: current_messages,
            current_segment_bytes: current_bytes,
        }
    }
}

impl LogProducer for SegmentProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn publish(&self, messages: Vec<MessageEnvelope>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Publish(format!(
                "segment producer for {} is closed",
                self.topic
            )));
        }

        let mut current = self.current.lock();
        for message in &messages {
            if self.write_locked(&mut current, message)? {
                self.seal_locked(&mut current)?;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut current = self.current.lock();
        if let Some(segment) = current.as_mut() {
            segment.writer.flush()?;
            segment.writer.get_ref().sync_data()?;
            segment.unsynced = 0;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.seal()?;
        let stats = self.stats();
        info!(
            "Closed segment producer for {}: {} messages, {} bytes in {} segments",
            self.topic,
            stats.total_messages,
            stats.total_bytes,
            self.sealed.lock().len()
        );
        Ok(())
    }
}

impl Drop for SegmentProducer {
    fn drop(&mut self) {
        // Seal any remaining segment on drop
        if let Err(e) = self.seal() {
            warn!("Error sealing segment on drop: {}", e);
        }
    }
}

/// Statistics about a segment producer.
#[derive(Debug, Clone)]
pub struct SegmentStats {
    /// Number the next sealed segment will get.
    pub segment_number: u64,

    /// Total messages written across all segments.
    pub total_messages: usize,

    /// Total uncompressed bytes written across all segments.
    pub total_bytes: usize,

    /// Total bytes across all sealed segments, after compression if enabled.
    pub total_compressed_bytes: usize,

    /// Messages in the current (unsealed) segment.
    pub current_segment_messages: usize,

    /// Bytes in the current (unsealed) segment.
    pub current_segment_bytes: usize,
}

/// Segment-file log client; one [`SegmentProducer`] per topic.
pub struct SegmentLogClient {
    config: SegmentConfig,
    producers: Mutex<HashMap<String, Arc<SegmentProducer>>>,
}

impl SegmentLogClient {
    pub fn new(config: SegmentConfig) -> Self {
        Self {
            config,
            producers: Mutex::new(HashMap::new()),
        }
    }
}

impl LogClient for SegmentLogClient {
    fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>> {
        let mut producers = self.producers.lock();
        if let Some(producer) = producers.get(topic) {
            return Ok(Arc::clone(producer) as Arc<dyn LogProducer>);
        }

        let producer = Arc::new(SegmentProducer::new(topic, self.config.clone())?);
        producers.insert(topic.to_string(), Arc::clone(&producer));
        Ok(producer)
    }

    fn close(&self) -> Result<()> {
        for producer in self.producers.lock().values() {
            producer.close()?;
        }
        Ok(())
    }
}

/// Find the next segment number by scanning existing files.
fn find_next_segment_number(dir: &Path, topic: &str) -> Result<u64> {
    let mut highest: Option<u64> = None;
    let prefix = format!("{topic}-");

    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();

        if let Some(rest) = name.strip_prefix(&prefix)
            && let Some(num) = rest
                .strip_suffix(&format!(".{COMPRESSED_EXTENSION}"))
                .or_else(|| rest.strip_suffix(&format!(".{SEGMENT_EXTENSION}")))
            && let Ok(num) = num.parse::<u64>()
        {
            highest = Some(highest.map_or(num, |h| h.max(num)));
        }
    }

    Ok(highest.map_or(0, |h| h + 1))
}

/// Compress a file with gzip, returning the compressed size.
fn compress_file(src: &Path, dst: &Path) -> Result<usize> {
    let mut reader = BufReader::new(File::open(src)?);
    let output = File::create(dst)?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());

    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.flush()?;

    Ok(fs::metadata(dst)?.len() as usize)
}

/// Encode one envelope as a length-prefixed frame.
pub fn encode_frame(message: &MessageEnvelope) -> Vec<u8> {
    let body_len = 4
        + message.position.len()
        + 4
        + message
            .segments
            .iter()
            .map(|(name, data)| 8 + name.len() + data.len())
            .sum::<usize>();

    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    put_bytes(&mut frame, message.position.as_bytes());
    frame.extend_from_slice(&(message.segments.len() as u32).to_le_bytes());
    for (name, data) in &message.segments {
        put_bytes(&mut frame, name.as_bytes());
        put_bytes(&mut frame, data);
    }
    frame
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Decode one frame body (everything after the frame length).
pub fn decode_frame(body: &[u8]) -> Result<MessageEnvelope> {
    let mut cursor = FrameCursor { buf: body, pos: 0 };

    let position = cursor.string()?;
    let count = cursor.u32()? as usize;
    let mut message = MessageEnvelope::new(position);
    for _ in 0..count {
        let name = cursor.string()?;
        let len = cursor.u32()? as usize;
        let data = cursor.take(len)?.to_vec();
        message = message.with_segment(name, data);
    }

    if cursor.pos != body.len() {
        return Err(Error::Serialization(format!(
            "frame has {} trailing bytes",
            body.len() - cursor.pos
        )));
    }
    Ok(message)
}

struct FrameCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameCursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Serialization("truncated frame".to_string()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Serialization(format!("invalid UTF-8 in frame: {e}")))
    }
}

/// Read every envelope from a plain or gzip-compressed segment file.
pub fn read_segment_file(path: &Path) -> Result<Vec<MessageEnvelope>> {
    let file = File::open(path)?;
    let compressed = path
        .file_name()
        .is_some_and(|n| n.to_string_lossy().ends_with(".gz"));
    let mut reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut messages = Vec::new();
    let mut len_buf = [0u8; 4];
    loop {
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        messages.push(decode_frame(&body)?);
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawdata_core::{ENTRY_SEGMENT, MANIFEST_SEGMENT};
    use tempfile::TempDir;

    fn message(position: u32) -> MessageEnvelope {
        MessageEnvelope::new(position.to_string())
            .with_segment(MANIFEST_SEGMENT, b"{\"position\":1}".to_vec())
            .with_segment(ENTRY_SEGMENT, vec![7u8; 32])
    }

    fn config(tmp: &TempDir) -> SegmentConfig {
        SegmentConfig {
            output_dir: tmp.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&MessageEnvelope::new("12").with_segment("e", vec![9]));
        assert_eq!(
            frame,
            vec![
                20, 0, 0, 0, // frame length
                2, 0, 0, 0, b'1', b'2', // position
                1, 0, 0, 0, // segment count
                1, 0, 0, 0, b'e', // name
                1, 0, 0, 0, 9, // data
            ]
        );
        assert_eq!(
            decode_frame(&frame[4..]).unwrap(),
            MessageEnvelope::new("12").with_segment("e", vec![9])
        );
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let frame = encode_frame(&message(1));
        let err = decode_frame(&frame[4..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_publish_and_read_back_uncompressed() {
        let tmp = TempDir::new().unwrap();
        let producer = SegmentProducer::new(
            "topic",
            SegmentConfig {
                compress: false,
                ..config(&tmp)
            },
        )
        .unwrap();

        producer.publish((1..=3).map(message).collect()).unwrap();
        let sealed = producer.seal().unwrap().unwrap();

        assert_eq!(sealed.message_count, 3);
        assert_eq!(sealed.first_position, "1");
        assert_eq!(sealed.last_position, "3");
        assert_eq!(sealed.path, tmp.path().join("topic/topic-000000000.rawdata"));

        let read = read_segment_file(&sealed.path).unwrap();
        assert_eq!(read, (1..=3).map(message).collect::<Vec<_>>());
    }

    #[test]
    fn test_compressed_segment_replaces_plain_file() {
        let tmp = TempDir::new().unwrap();
        let producer = SegmentProducer::new("topic", config(&tmp)).unwrap();

        producer.publish(vec![message(1)]).unwrap();
        let sealed = producer.seal().unwrap().unwrap();

        assert!(tmp.path().join("topic/topic-000000000.rawdata.gz").exists());
        assert!(!tmp.path().join("topic/topic-000000000.rawdata").exists());
        assert_eq!(read_segment_file(&sealed.path).unwrap(), vec![message(1)]);
    }

    #[test]
    fn test_size_rollover() {
        let tmp = TempDir::new().unwrap();
        let producer = SegmentProducer::new(
            "topic",
            SegmentConfig {
                max_segment_size: 100,
                compress: false,
                ..config(&tmp)
            },
        )
        .unwrap();

        producer.publish((1..=10).map(message).collect()).unwrap();
        producer.close().unwrap();

        let sealed = producer.sealed_segments();
        assert!(sealed.len() > 1);

        let positions: Vec<String> = sealed
            .iter()
            .flat_map(|s| read_segment_file(&s.path).unwrap())
            .map(|m| m.position)
            .collect();
        let expected: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
        assert_eq!(positions, expected);
    }

    #[test]
    fn test_age_rollover() {
        let tmp = TempDir::new().unwrap();
        let producer = SegmentProducer::new(
            "topic",
            SegmentConfig {
                max_segment_age: Some(Duration::ZERO),
                compress: false,
                ..config(&tmp)
            },
        )
        .unwrap();

        producer.publish(vec![message(1), message(2)]).unwrap();
        assert_eq!(producer.sealed_segments().len(), 2);
    }

    #[test]
    fn test_numbering_continues_after_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let producer = SegmentProducer::new("topic", config(&tmp)).unwrap();
            producer.publish(vec![message(1)]).unwrap();
            producer.close().unwrap();
        }

        let producer = SegmentProducer::new("topic", config(&tmp)).unwrap();
        producer.publish(vec![message(2)]).unwrap();
        let sealed = producer.seal().unwrap().unwrap();
        assert_eq!(sealed.segment_number, 1);
    }

    #[test]
    fn test_publish_after_close_fails() {
        let tmp = TempDir::new().unwrap();
        let producer = SegmentProducer::new("topic", config(&tmp)).unwrap();
        producer.close().unwrap();
        producer.close().unwrap();
        assert!(matches!(
            producer.publish(vec![message(1)]),
            Err(Error::Publish(_))
        ));
    }

    #[test]
    fn test_client_reuses_producer_per_topic() {
        let tmp = TempDir::new().unwrap();
        let client = SegmentLogClient::new(SegmentConfig {
            compress: false,
            ..config(&tmp)
        });

        client.producer("a").unwrap().publish(vec![message(1)]).unwrap();
        client.producer("a").unwrap().publish(vec![message(2)]).unwrap();
        client.close().unwrap();

        let read = read_segment_file(&tmp.path().join("a/a-000000000.rawdata")).unwrap();
        assert_eq!(read.len(), 2);
    }
}
