//! In-memory log provider.

use super::{LogClient, LogProducer};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rawdata_core::MessageEnvelope;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Keeps every published envelope in memory, per topic.
#[derive(Default)]
pub struct MemoryLogClient {
    producers: Mutex<HashMap<String, Arc<MemoryProducer>>>,
}

impl MemoryLogClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Envelopes published to a topic so far, in publish order.
    pub fn messages(&self, topic: &str) -> Vec<MessageEnvelope> {
        self.producers
            .lock()
            .get(topic)
            .map(|p| p.messages())
            .unwrap_or_default()
    }

    /// Positions published to a topic so far, in publish order.
    pub fn positions(&self, topic: &str) -> Vec<String> {
        self.messages(topic)
            .into_iter()
            .map(|m| m.position)
            .collect()
    }
}

impl LogClient for MemoryLogClient {
    fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>> {
        let mut producers = self.producers.lock();
        let producer = producers
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(MemoryProducer::new(topic)));
        Ok(Arc::clone(producer) as Arc<dyn LogProducer>)
    }

    fn close(&self) -> Result<()> {
        for producer in self.producers.lock().values() {
            producer.close()?;
        }
        Ok(())
    }
}

pub struct MemoryProducer {
    topic: String,
    messages: Mutex<Vec<MessageEnvelope>>,
    batches: Mutex<Vec<usize>>,
    closed: AtomicBool,
}

impl MemoryProducer {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            messages: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn messages(&self) -> Vec<MessageEnvelope> {
        self.messages.lock().clone()
    }

    /// Size of every publish call, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

impl LogProducer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn publish(&self, messages: Vec<MessageEnvelope>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Publish(format!("producer for {} is closed", self.topic)));
        }
        self.batches.lock().push(messages.len());
        self.messages.lock().extend(messages);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_preserves_order_per_topic() {
        let client = MemoryLogClient::new();
        let a = client.producer("a").unwrap();
        let b = client.producer("b").unwrap();

        a.publish(vec![MessageEnvelope::new("1"), MessageEnvelope::new("2")])
            .unwrap();
        b.publish(vec![MessageEnvelope::new("9")]).unwrap();
        a.publish(vec![MessageEnvelope::new("3")]).unwrap();

        assert_eq!(client.positions("a"), vec!["1", "2", "3"]);
        assert_eq!(client.positions("b"), vec!["9"]);
        assert!(client.positions("c").is_empty());
    }

    #[test]
    fn test_same_topic_same_producer() {
        let client = MemoryLogClient::new();
        client
            .producer("t")
            .unwrap()
            .publish(vec![MessageEnvelope::new("1")])
            .unwrap();
        client
            .producer("t")
            .unwrap()
            .publish(vec![MessageEnvelope::new("2")])
            .unwrap();
        assert_eq!(client.positions("t"), vec!["1", "2"]);
    }

    #[test]
    fn test_publish_after_close_fails() {
        let client = MemoryLogClient::new();
        let producer = client.producer("t").unwrap();
        client.close().unwrap();

        let err = producer.publish(vec![MessageEnvelope::new("1")]).unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
    }
}
