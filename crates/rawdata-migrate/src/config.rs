//! Migration target configuration.
//!
//! [`TargetConfig`] carries everything a run needs to know about where
//! messages go: topic, log provider, encryption material, segment file
//! limits and pipeline sizing. The binary fills it from CLI flags and
//! environment variables; tests build it directly.

use crate::error::{Error, Result};
use crate::log::SegmentConfig;
use crate::pipeline::{DEFAULT_QUEUE_CAPACITY, DEFAULT_SHUTDOWN_TIMEOUT, PipelineConfig};
use rawdata_core::PayloadCipher;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default maximum segment file size (64 MiB).
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Default number of messages between segment fsyncs.
pub const DEFAULT_SYNC_INTERVAL: usize = 1000;

/// Message-log provider identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogProvider {
    Memory,
    #[default]
    Segment,
}

impl fmt::Display for LogProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Segment => "segment",
        })
    }
}

impl FromStr for LogProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "segment" | "file" => Ok(Self::Segment),
            other => Err(format!(
                "unknown log provider '{other}' (expected 'memory' or 'segment')"
            )),
        }
    }
}

/// Where and how a run publishes its messages.
#[derive(Clone)]
pub struct TargetConfig {
    pub topic: String,
    pub provider: LogProvider,
    pub encryption_key: Option<String>,
    pub encryption_salt: Option<String>,
    /// Base directory for segment files.
    pub local_temp_folder: PathBuf,
    /// Seal a segment once it has been open this long.
    pub max_seconds: Option<u64>,
    /// Seal a segment once it reaches this size.
    pub max_bytes: usize,
    /// Messages between segment fsyncs.
    pub sync_interval: usize,
    /// Outstanding-work queue capacity.
    pub queue_capacity: usize,
    pub worker_threads: usize,
    pub compress: bool,
    pub shutdown_timeout: Duration,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            provider: LogProvider::default(),
            encryption_key: None,
            encryption_salt: None,
            local_temp_folder: PathBuf::from("./rawdata"),
            max_seconds: None,
            max_bytes: DEFAULT_MAX_BYTES,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_threads: num_cpus::get(),
            compress: true,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl TargetConfig {
    /// A configuration for `topic` with every other option at its default.
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::Config("topic must not be empty".to_string()));
        }
        if self.topic.contains(['/', '\\']) || self.topic == "." || self.topic == ".." {
            return Err(Error::Config(format!(
                "topic '{}' must not contain path separators",
                self.topic
            )));
        }
        if self.max_bytes == 0 {
            return Err(Error::Config("max_bytes must be greater than zero".to_string()));
        }
        if self.worker_threads == 0 {
            return Err(Error::Config(
                "worker_threads must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn segment_config(&self) -> SegmentConfig {
        SegmentConfig {
            output_dir: self.local_temp_folder.clone(),
            max_segment_size: self.max_bytes,
            max_segment_age: self.max_seconds.map(Duration::from_secs),
            sync_interval: self.sync_interval,
            compress: self.compress,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.queue_capacity,
            worker_threads: self.worker_threads,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    /// Build the payload cipher, taking the secret material out of the config.
    ///
    /// The key and salt are moved into the cipher, which wipes them once the
    /// key is derived; the config no longer holds them afterwards.
    pub fn take_cipher(&mut self) -> PayloadCipher {
        PayloadCipher::from_secret(self.encryption_key.take(), self.encryption_salt.take())
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("TargetConfig")
            .field("topic", &self.topic)
            .field("provider", &self.provider)
            .field("encryption_key", &redact(&self.encryption_key))
            .field("encryption_salt", &redact(&self.encryption_salt))
            .field("local_temp_folder", &self.local_temp_folder)
            .field("max_seconds", &self.max_seconds)
            .field("max_bytes", &self.max_bytes)
            .field("sync_interval", &self.sync_interval)
            .field("queue_capacity", &self.queue_capacity)
            .field("worker_threads", &self.worker_threads)
            .field("compress", &self.compress)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TargetConfig::for_topic("kostra");
        assert_eq!(config.provider, LogProvider::Segment);
        assert_eq!(config.max_bytes, 64 * 1024 * 1024);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.sync_interval, 1000);
        assert!(config.max_seconds.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(TargetConfig::for_topic("").validate().is_err());
        assert!(TargetConfig::for_topic("a/b").validate().is_err());

        let config = TargetConfig {
            max_bytes: 0,
            ..TargetConfig::for_topic("t")
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("memory".parse::<LogProvider>().unwrap(), LogProvider::Memory);
        assert_eq!("Segment".parse::<LogProvider>().unwrap(), LogProvider::Segment);
        assert!("kafka".parse::<LogProvider>().is_err());
    }

    #[test]
    fn test_segment_config_mapping() {
        let config = TargetConfig {
            max_seconds: Some(30),
            max_bytes: 1024,
            compress: false,
            ..TargetConfig::for_topic("t")
        };
        let segment = config.segment_config();
        assert_eq!(segment.max_segment_age, Some(Duration::from_secs(30)));
        assert_eq!(segment.max_segment_size, 1024);
        assert!(!segment.compress);
    }

    #[test]
    fn test_take_cipher_clears_secrets() {
        let mut config = TargetConfig {
            encryption_key: Some("key".to_string()),
            encryption_salt: Some("salt".to_string()),
            ..TargetConfig::for_topic("t")
        };
        let cipher = config.take_cipher();
        assert!(cipher.is_enabled());
        assert!(config.encryption_key.is_none());
        assert!(config.encryption_salt.is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = TargetConfig {
            encryption_key: Some("hunter2".to_string()),
            ..TargetConfig::for_topic("t")
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
