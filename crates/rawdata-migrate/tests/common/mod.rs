#![allow(dead_code)]

use rawdata_core::{ENTRY_SEGMENT, MANIFEST_SEGMENT, ManifestEntry, MessageEnvelope, PayloadCipher};
use rawdata_migrate::{LogProvider, TargetConfig};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const ENCRYPTION_KEY: &str = "correct horse battery staple";
pub const ENCRYPTION_SALT: &str = "rawdata-test-salt";

/// A target publishing to the in-memory provider.
pub fn memory_target(topic: &str) -> TargetConfig {
    TargetConfig {
        provider: LogProvider::Memory,
        worker_threads: 4,
        shutdown_timeout: Duration::from_secs(5),
        ..TargetConfig::for_topic(topic)
    }
}

/// A target writing uncompressed segment files under `dir`.
pub fn segment_target(topic: &str, dir: &Path) -> TargetConfig {
    TargetConfig {
        provider: LogProvider::Segment,
        local_temp_folder: dir.to_path_buf(),
        compress: false,
        ..memory_target(topic)
    }
}

pub fn write_file(dir: &Path, name: &str, contents: impl AsRef<[u8]>) {
    fs::write(dir.join(name), contents).expect("failed to write test input");
}

pub fn manifest(message: &MessageEnvelope) -> ManifestEntry {
    ManifestEntry::from_json_bytes(message.segment(MANIFEST_SEGMENT).expect("no manifest"))
        .expect("manifest is not valid JSON")
}

pub fn entry_text(message: &MessageEnvelope) -> String {
    String::from_utf8(message.segment(ENTRY_SEGMENT).expect("no entry").to_vec())
        .expect("entry is not UTF-8")
}

pub fn test_cipher() -> PayloadCipher {
    PayloadCipher::from_secret(
        Some(ENCRYPTION_KEY.to_string()),
        Some(ENCRYPTION_SALT.to_string()),
    )
}

pub fn positions(count: usize) -> Vec<String> {
    (1..=count).map(|i| i.to_string()).collect()
}
