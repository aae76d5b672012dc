//! Fixed-size worker thread pool.
//!
//! Tasks are fed to a fixed set of OS threads through an unbounded
//! `crossbeam-channel`. Each submission returns a [`TaskHandle`] that yields
//! the task's return value. A task that panics is reported through its
//! handle as [`Error::WorkerLost`]; the worker thread itself keeps running.

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default bounded wait for workers to exit on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A pool of worker threads executing submitted closures.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    exited: Receiver<usize>,
}

impl WorkerPool {
    /// Spawn `size` worker threads (at least one).
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let (exit_tx, exited) = crossbeam_channel::bounded(size);

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let jobs = receiver.clone();
            let exit_tx = exit_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("migrate-worker-{id}"))
                .spawn(move || {
                    for job in jobs.iter() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            warn!("Task panicked on worker {}", id);
                        }
                    }
                    // The pool may already have given up waiting.
                    exit_tx.send(id).ok();
                })?;
            workers.push(handle);
        }

        debug!("Started worker pool with {} threads", size);
        Ok(Self {
            sender: Some(sender),
            workers,
            exited,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task; its result is delivered through the returned handle.
    pub fn execute<F, R>(&self, task: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::WorkerLost("worker pool is shut down".to_string()))?;

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            result_tx.send(task()).ok();
        });
        sender
            .send(job)
            .map_err(|_| Error::WorkerLost("worker pool disconnected".to_string()))?;

        Ok(TaskHandle {
            receiver: result_rx,
        })
    }

    /// Stop accepting tasks and wait up to `timeout` for queued work to finish.
    ///
    /// Returns `true` if every worker exited in time. Workers still running
    /// after the timeout are detached. Calling this again is a no-op.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        let Some(sender) = self.sender.take() else {
            return true;
        };
        drop(sender);

        let deadline = Instant::now() + timeout;
        let mut exited = 0;
        while exited < self.workers.len() {
            match self.exited.recv_deadline(deadline) {
                Ok(_) => exited += 1,
                Err(_) => break,
            }
        }

        if exited < self.workers.len() {
            warn!(
                "Worker pool shutdown timed out after {:?}: {} of {} workers still running",
                timeout,
                self.workers.len() - exited,
                self.workers.len()
            );
            self.workers.clear();
            return false;
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
        debug!("Worker pool shut down");
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    }
}

/// Handle to the result of a task submitted to a [`WorkerPool`].
pub struct TaskHandle<R> {
    receiver: Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Block until the task finishes and return its value.
    pub fn wait(self) -> Result<R> {
        self.receiver
            .recv()
            .map_err(|_| Error::WorkerLost("task ended without producing a result".to_string()))
    }
}
