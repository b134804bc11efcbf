//! Thread-safe priority queue with blocking pop.
//!
//! Items are served highest priority first; equal priorities come out in
//! insertion order. Waiters park on a single [`Notify`] that is signalled on
//! every push and on close.

mod item;

pub use item::WorkItem;

use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::sync::lock;

/// How long [`PriorityQueue::pop_item`] may wait for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail with [`QueueError::Empty`] immediately.
    NoWait,
    /// Block until an item arrives, the wait is cancelled, or the queue closes.
    Forever,
    /// Block up to the given duration, then fail with [`QueueError::Timeout`].
    For(Duration),
}

struct QueueState<T> {
    heap: BinaryHeap<WorkItem<T>>,
    closed: bool,
    next_sequence: u64,
}

/// Bounded max-heap of [`WorkItem`]s.
pub struct PriorityQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> PriorityQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::with_capacity(capacity.min(1024)),
                closed: false,
                next_sequence: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push an item, waking one waiter.
    pub fn push_item(&self, item: WorkItem<T>) -> Result<(), QueueError> {
        self.try_push(item).map_err(|(err, _)| err)
    }

    /// Push an item, handing it back on rejection.
    pub fn try_push(&self, mut item: WorkItem<T>) -> Result<(), (QueueError, WorkItem<T>)> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err((QueueError::Closed, item));
            }
            if state.heap.len() >= self.capacity {
                let capacity = self.capacity;
                return Err((QueueError::Full { capacity }, item));
            }
            item.sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the highest-priority item, waiting according to `wait`.
    pub async fn pop_item(
        &self,
        cancel: &CancellationToken,
        wait: Wait,
    ) -> Result<WorkItem<T>, QueueError> {
        let deadline = match wait {
            Wait::For(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };

        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop()? {
                return Ok(item);
            }

            match (wait, deadline) {
                (Wait::NoWait, _) => return Err(QueueError::Empty),
                (Wait::For(timeout), Some(deadline)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = cancel.cancelled() => return Err(self.give_up(QueueError::Cancelled)),
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(self.give_up(QueueError::Timeout(timeout)));
                        }
                    }
                }
                _ => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = cancel.cancelled() => return Err(self.give_up(QueueError::Cancelled)),
                    }
                }
            }
        }
    }

    fn try_pop(&self) -> Result<Option<WorkItem<T>>, QueueError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(QueueError::Closed);
        }
        Ok(state.heap.pop())
    }

    /// Forward a wakeup this waiter may have consumed without taking an item.
    fn give_up(&self, err: QueueError) -> QueueError {
        if !self.is_empty() {
            self.notify.notify_one();
        }
        err
    }

    /// Close the queue. Idempotent; wakes every waiter.
    pub fn close(&self) {
        let was_open = {
            let mut state = lock(&self.state);
            !std::mem::replace(&mut state.closed, true)
        };
        if was_open {
            tracing::debug!("Priority queue closed");
        }
        self.notify.notify_waiters();
    }

    /// Remove every remaining item, highest priority first. Works on a
    /// closed queue so leftovers can be accounted for at shutdown.
    pub fn drain(&self) -> Vec<WorkItem<T>> {
        let mut state = lock(&self.state);
        let mut items = Vec::with_capacity(state.heap.len());
        while let Some(item) = state.heap.pop() {
            items.push(item);
        }
        items
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).heap.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
