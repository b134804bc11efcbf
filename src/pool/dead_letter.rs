//! Bounded record of work items the pool gave up on.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::queue::WorkItem;
use crate::sync::lock;

/// A failed item and when it was given up on.
#[derive(Debug)]
pub struct DeadLetter<T> {
    pub item: WorkItem<T>,
    pub failed_at: DateTime<Utc>,
}

/// Ring buffer of dead letters. The oldest entry is evicted when full.
pub struct DeadLetterQueue<T> {
    entries: Mutex<VecDeque<DeadLetter<T>>>,
    capacity: usize,
    total: AtomicU64,
}

impl<T> DeadLetterQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            total: AtomicU64::new(0),
        }
    }

    /// Record an item the pool gave up on.
    pub fn push(&self, item: WorkItem<T>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            priority = item.priority,
            retries = item.retries,
            last_error = item.last_error.as_deref().unwrap_or("unknown"),
            "Work item moved to dead letters"
        );

        if self.capacity == 0 {
            return;
        }

        let mut entries = lock(&self.entries);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(DeadLetter {
            item,
            failed_at: Utc::now(),
        });
    }

    /// Entries currently retained.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Items ever dead-lettered, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Take every retained entry, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        lock(&self.entries).drain(..).collect()
    }
}
