//! Outgoing message envelope: a position plus named binary segments.

/// Segment name carrying the JSON manifest.
pub const MANIFEST_SEGMENT: &str = "manifest.json";

/// Segment name carrying the transformed record payload.
pub const ENTRY_SEGMENT: &str = "entry";

/// A message ready for the log, exclusively owned by whoever holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub position: String,
    /// Named segments in insertion order.
    pub segments: Vec<(String, Vec<u8>)>,
}

impl MessageEnvelope {
    pub fn new(position: impl Into<String>) -> Self {
        Self {
            position: position.into(),
            segments: Vec::with_capacity(2),
        }
    }

    /// Append a named segment.
    pub fn with_segment(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.segments.push((name.into(), data));
        self
    }

    /// Look up a segment by name.
    pub fn segment(&self, name: &str) -> Option<&[u8]> {
        self.segments
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    /// Total bytes across all segment payloads.
    pub fn payload_len(&self) -> usize {
        self.segments.iter().map(|(_, data)| data.len()).sum()
    }
}
