//! Completion-order to discovery-order conversion.
//!
//! Positions are registered with [`ReorderBuffer::add_expected`] in the order
//! records are discovered. Workers report results with
//! [`ReorderBuffer::add_completed`] in whatever order they finish. Each
//! completion releases the longest ready run at the head of the expected
//! queue, in one batch, to the caller's release callback.
//!
//! The head check, the drain and the callback all run under one mutex, so
//! two completions can never interleave their release batches.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

/// Buffers out-of-order completions and releases them in expected order.
pub struct ReorderBuffer<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    expected: VecDeque<String>,
    /// Positions in `expected` that have not completed yet.
    awaiting: HashSet<String>,
    completed: HashMap<String, T>,
    released: u64,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                expected: VecDeque::new(),
                awaiting: HashSet::new(),
                completed: HashMap::new(),
                released: 0,
            }),
        }
    }

    /// Append a newly discovered position to the tail of the expected queue.
    ///
    /// Must be called once per position, before its work is dispatched.
    pub fn add_expected(&self, position: impl Into<String>) -> Result<()> {
        let position = position.into();
        let mut state = self.state.lock();

        if state.awaiting.contains(&position) || state.completed.contains_key(&position) {
            return Err(Error::OrderingViolation(format!(
                "position {position} is already pending"
            )));
        }

        state.awaiting.insert(position.clone());
        state.expected.push_back(position);
        Ok(())
    }

    /// Record a finished position and release every ready head position.
    ///
    /// `on_release` is invoked at most once per call, with the released
    /// `(position, payload)` pairs in expected order, while the buffer's lock
    /// is held. Returns the number of positions released.
    ///
    /// Completing a position that is not awaiting completion (unknown,
    /// already completed, or already released) is an ordering violation and
    /// releases nothing.
    pub fn add_completed<F>(&self, position: &str, payload: T, on_release: F) -> Result<usize>
    where
        F: FnOnce(Vec<(String, T)>) -> Result<()>,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.awaiting.remove(position) {
            return Err(Error::OrderingViolation(format!(
                "position {position} was not awaiting completion"
            )));
        }
        state.completed.insert(position.to_string(), payload);

        let mut batch = Vec::new();
        while let Some(head) = state.expected.front() {
            let Some(payload) = state.completed.remove(head) else {
                break;
            };
            if let Some(head) = state.expected.pop_front() {
                batch.push((head, payload));
            }
        }

        if batch.is_empty() {
            return Ok(0);
        }

        let released = batch.len();
        state.released += released as u64;
        on_release(batch)?;
        Ok(released)
    }

    /// Positions discovered but not yet released.
    pub fn outstanding(&self) -> usize {
        self.state.lock().expected.len()
    }

    /// Completed positions waiting on an earlier position.
    pub fn buffered(&self) -> usize {
        self.state.lock().completed.len()
    }

    /// Total positions released so far.
    pub fn released(&self) -> u64 {
        self.state.lock().released
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().expected.is_empty()
    }
}
