//! Heap entry wrapping a unit of queued work.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

/// A queued payload plus its scheduling and retry bookkeeping.
#[derive(Debug, Clone)]
pub struct WorkItem<T> {
    /// The payload handed to the job handler.
    pub data: T,
    /// Higher values are served first.
    pub priority: i32,
    /// Failed attempts so far.
    pub retries: u32,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the item was created.
    pub created_at: DateTime<Utc>,
    /// Insertion order, assigned by the queue. Breaks priority ties FIFO.
    pub(crate) sequence: u64,
}

impl<T> WorkItem<T> {
    /// Wrap `data` with default priority and no retries.
    pub fn new(data: T) -> Self {
        Self {
            data,
            priority: 0,
            retries: 0,
            max_retries: 0,
            last_error: None,
            created_at: Utc::now(),
            sequence: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether another failure would exhaust the retry budget.
    pub fn is_final_attempt(&self) -> bool {
        self.retries >= self.max_retries
    }
}

impl<T> PartialEq for WorkItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for WorkItem<T> {}

impl<T> PartialOrd for WorkItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for WorkItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (older) first
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other_ordering => other_ordering,
        }
    }
}
