//! Concurrent transform with in-order publication.
//!
//! [`PublishPipeline::submit`] registers a position with the
//! [`ReorderBuffer`], then hands the record's transform to the
//! [`WorkerPool`]. The worker builds the manifest and entry bytes, encrypts
//! both segments if a key is configured, and completes the position. The
//! reorder buffer releases ready runs to the log producer in discovery
//! order.
//!
//! # Backpressure
//!
//! At most `queue_capacity` task handles are outstanding. When the queue is
//! full, the pipeline waits for *every* outstanding handle (a full drain)
//! before accepting the new one. If the queue is still full afterwards
//! (capacity zero) the submission fails with
//! [`Error::CapacityExceeded`].
//!
//! # Failure
//!
//! A failing worker sets a shared flag and its handle yields
//! [`Error::WorkerFailed`]. The next `submit` or `drain` surfaces that
//! error and the pipeline refuses further work.

use super::pool::{DEFAULT_SHUTDOWN_TIMEOUT, TaskHandle, WorkerPool};
use super::reorder::ReorderBuffer;
use crate::error::{Error, Result};
use crate::log::LogProducer;
use metrics::counter;
use rawdata_core::metrics::{BACKPRESSURE_DRAINS, MESSAGES_PUBLISHED, RELEASE_BATCHES};
use rawdata_core::{ENTRY_SEGMENT, MANIFEST_SEGMENT, ManifestEntry, MessageEnvelope, PayloadCipher};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default outstanding-work queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Sizing for a [`PublishPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub worker_threads: usize,
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_threads: num_cpus::get(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// The output of one record transform: manifest plus entry payload.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub manifest: ManifestEntry,
    pub content: Vec<u8>,
}

/// Counters for one pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Positions submitted.
    pub submitted: u64,
    /// Messages handed to the log producer.
    pub published: u64,
    /// Full drains forced by a full queue.
    pub backpressure_drains: u64,
}

/// State shared with every worker task.
struct Shared {
    reorder: ReorderBuffer<MessageEnvelope>,
    producer: Arc<dyn LogProducer>,
    cipher: PayloadCipher,
    failed: AtomicBool,
    published: AtomicU64,
}

/// Bounded, fail-fast, order-preserving publish pipeline.
pub struct PublishPipeline {
    pool: WorkerPool,
    shared: Arc<Shared>,
    outstanding: VecDeque<TaskHandle<Result<()>>>,
    capacity: usize,
    shutdown_timeout: Duration,
    submitted: u64,
    drains: u64,
    aborted: bool,
    closed: bool,
}

impl PublishPipeline {
    pub fn new(
        config: PipelineConfig,
        producer: Arc<dyn LogProducer>,
        cipher: PayloadCipher,
    ) -> Result<Self> {
        info!(
            "Starting publish pipeline for {}: {} workers, queue capacity {}, encryption {}",
            producer.topic(),
            config.worker_threads,
            config.queue_capacity,
            if cipher.is_enabled() { "on" } else { "off" }
        );

        Ok(Self {
            pool: WorkerPool::new(config.worker_threads)?,
            shared: Arc::new(Shared {
                reorder: ReorderBuffer::new(),
                producer,
                cipher,
                failed: AtomicBool::new(false),
                published: AtomicU64::new(0),
            }),
            outstanding: VecDeque::with_capacity(config.queue_capacity),
            capacity: config.queue_capacity,
            shutdown_timeout: config.shutdown_timeout,
            submitted: 0,
            drains: 0,
            aborted: false,
            closed: false,
        })
    }

    /// Register `position` and dispatch its transform to a worker.
    ///
    /// The position is added to the reorder buffer before dispatch, so
    /// positions must be submitted in discovery order.
    pub fn submit<F>(&mut self, position: impl Into<String>, transform: F) -> Result<()>
    where
        F: FnOnce() -> Result<PendingMessage> + Send + 'static,
    {
        self.ensure_accepting()?;
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(self.fail(None));
        }

        let position = position.into();
        self.shared.reorder.add_expected(position.clone())?;

        let shared = Arc::clone(&self.shared);
        let dispatched = self.pool.execute(move || {
            let result = process(&shared, &position, transform);
            if let Err(e) = result {
                shared.failed.store(true, Ordering::Release);
                return Err(Error::WorkerFailed {
                    position,
                    source: Box::new(e),
                });
            }
            Ok(())
        });
        // The position is already expected; it can never be released now.
        let handle = match dispatched {
            Ok(handle) => handle,
            Err(e) => {
                self.aborted = true;
                return Err(e);
            }
        };
        self.submitted += 1;

        if self.outstanding.len() >= self.capacity {
            self.drains += 1;
            counter!(BACKPRESSURE_DRAINS).increment(1);
            debug!(
                "Outstanding queue full ({} handles), draining",
                self.outstanding.len()
            );

            if let Err(e) = self.drain() {
                return Err(self.fail(Some((handle, e))));
            }
            if self.outstanding.len() >= self.capacity {
                // Nothing may be left running unobserved.
                let outcome = handle.wait().and_then(|r| r);
                self.aborted = true;
                if let Err(e) = outcome {
                    warn!("Rejected task also failed: {}", e);
                }
                return Err(Error::CapacityExceeded {
                    capacity: self.capacity,
                });
            }
        }

        self.outstanding.push_back(handle);
        Ok(())
    }

    /// Wait for every outstanding task, returning the first failure.
    pub fn drain(&mut self) -> Result<()> {
        let count = self.outstanding.len();
        let mut first_error = None;

        for handle in self.outstanding.drain(..) {
            if let Err(e) = handle.wait().and_then(|r| r) {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    debug!("Additional failure while draining: {}", e);
                }
            }
        }

        if count > 0 {
            debug!("Drained {} outstanding tasks", count);
        }

        match first_error {
            Some(e) => {
                self.aborted = true;
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Drain, stop the workers and verify every position was published.
    ///
    /// Calling this again after it has returned is a no-op.
    pub fn close(&mut self) -> Result<PipelineStats> {
        if self.closed {
            return Ok(self.stats());
        }
        self.closed = true;

        let drained = self.drain();
        if !self.pool.shutdown(self.shutdown_timeout) {
            warn!("Worker pool did not stop within {:?}", self.shutdown_timeout);
        }
        drained?;
        if self.aborted {
            return Err(Error::Aborted(
                "pipeline stopped after an earlier failure".to_string(),
            ));
        }

        let unreleased = self.shared.reorder.outstanding();
        if unreleased > 0 {
            return Err(Error::OrderingViolation(format!(
                "{unreleased} positions were never released"
            )));
        }

        let stats = self.stats();
        info!(
            "Published message total count: {} ({} backpressure drains)",
            stats.published, stats.backpressure_drains
        );
        Ok(stats)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.submitted,
            published: self.shared.published.load(Ordering::Relaxed),
            backpressure_drains: self.drains,
        }
    }

    /// Handles currently awaiting completion.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Aborted("pipeline is closed".to_string()));
        }
        if self.aborted {
            return Err(Error::Aborted(
                "pipeline stopped after an earlier failure".to_string(),
            ));
        }
        Ok(())
    }

    /// Collect the failure that stopped the pipeline.
    ///
    /// A handle that was dispatched but not queued is waited on first.
    fn fail(&mut self, pending: Option<(TaskHandle<Result<()>>, Error)>) -> Error {
        let error = match pending {
            Some((handle, error)) => {
                handle.wait().ok();
                error
            }
            None => match self.drain() {
                Err(e) => e,
                Ok(()) => Error::Aborted("a worker failed".to_string()),
            },
        };
        self.aborted = true;
        error
    }
}

/// Worker side: transform, encrypt, complete.
fn process<F>(shared: &Shared, position: &str, transform: F) -> Result<()>
where
    F: FnOnce() -> Result<PendingMessage>,
{
    let message = transform()?;
    let manifest = shared.cipher.maybe_encrypt(message.manifest.to_json_bytes()?)?;
    let entry = shared.cipher.maybe_encrypt(message.content)?;

    let envelope = MessageEnvelope::new(position)
        .with_segment(MANIFEST_SEGMENT, manifest)
        .with_segment(ENTRY_SEGMENT, entry);

    shared
        .reorder
        .add_completed(position, envelope, |batch| publish_batch(shared, batch))?;
    Ok(())
}

/// Runs under the reorder buffer's lock.
fn publish_batch(shared: &Shared, batch: Vec<(String, MessageEnvelope)>) -> Result<()> {
    let count = batch.len() as u64;
    let messages = batch.into_iter().map(|(_, message)| message).collect();

    shared.producer.publish(messages)?;
    shared.published.fetch_add(count, Ordering::Relaxed);

    counter!(MESSAGES_PUBLISHED).increment(count);
    counter!(RELEASE_BATCHES).increment(1);
    Ok(())
}
