//! Fixed-size worker pool draining a shared priority queue.
//!
//! Each worker pops the highest-priority [`WorkItem`], hands its payload to the
//! pool's [`JobHandler`] and retries failures in place with linear backoff
//! (`min(retries * base, cap)`). Items that exhaust their retries, fail with a
//! non-retryable error, or are still pending at shutdown are moved to a
//! bounded [`DeadLetterQueue`] instead of being discarded.

mod dead_letter;

pub use dead_letter::{DeadLetter, DeadLetterQueue};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{ExecutionError, QueueError};
use crate::queue::{PriorityQueue, Wait, WorkItem};
use crate::sync::lock;

/// Which attempt a handler invocation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// No retry follows if this attempt fails.
    pub is_final: bool,
}

/// Processes one payload. Returning a retryable error schedules a retry if
/// the item has budget left.
#[async_trait]
pub trait JobHandler<T>: Send + Sync {
    async fn handle(&self, job: &mut T, attempt: Attempt) -> Result<(), ExecutionError>;

    /// Called for a job the pool gives up on without a final attempt:
    /// stopped mid-backoff, or still queued at shutdown.
    fn abandon(&self, _job: &mut T, _reason: &str) {}
}

/// A job the queue refused, handed back to the caller.
#[derive(Debug)]
pub struct Rejected<T> {
    pub job: T,
    pub error: QueueError,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queued: usize,
    pub processed: u64,
    pub failed_attempts: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed_attempts: AtomicU64,
    retried: AtomicU64,
}

struct Shared<T> {
    config: PoolConfig,
    queue: PriorityQueue<T>,
    handler: Arc<dyn JobHandler<T>>,
    stop: CancellationToken,
    dead_letters: DeadLetterQueue<T>,
    counters: Counters,
}

/// A bounded, priority-ordered worker pool.
pub struct WorkPool<T> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkPool<T> {
    /// Create a pool. Workers are spawned by [`WorkPool::start`].
    pub fn new(config: PoolConfig, handler: Arc<dyn JobHandler<T>>) -> Self {
        let shared = Shared {
            queue: PriorityQueue::new(config.queue_capacity),
            dead_letters: DeadLetterQueue::new(config.dead_letter_capacity),
            handler,
            stop: CancellationToken::new(),
            counters: Counters::default(),
            config,
        };
        Self {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker loops. Calling it again, or after stop, does nothing.
    pub fn start(&self) {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() || self.shared.stop.is_cancelled() {
            return;
        }
        for worker_id in 0..self.shared.config.workers {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(async move {
                shared.run_worker(worker_id).await;
            }));
        }
        info!(
            workers = self.shared.config.workers,
            queue_capacity = self.shared.config.queue_capacity,
            "Work pool started"
        );
    }

    /// Enqueue at default priority with no retries.
    pub fn submit(&self, job: T) -> Result<(), QueueError> {
        self.submit_with_retries(job, 0, 0)
    }

    /// Enqueue with an explicit priority and retry budget.
    pub fn submit_with_retries(
        &self,
        job: T,
        priority: i32,
        max_retries: u32,
    ) -> Result<(), QueueError> {
        self.try_submit(job, priority, max_retries)
            .map_err(|rejected| rejected.error)
    }

    /// Like [`WorkPool::submit_with_retries`], but returns the job on
    /// rejection so the caller can run it elsewhere.
    pub fn try_submit(&self, job: T, priority: i32, max_retries: u32) -> Result<(), Rejected<T>> {
        if self.shared.stop.is_cancelled() {
            return Err(Rejected {
                job,
                error: QueueError::Closed,
            });
        }
        let item = WorkItem::new(job)
            .with_priority(priority)
            .with_max_retries(max_retries);
        self.shared
            .queue
            .try_push(item)
            .map_err(|(error, item)| Rejected {
                job: item.data,
                error,
            })
    }

    /// Signal workers to stop and close the queue. Idempotent.
    pub fn stop(&self) {
        if !self.shared.stop.is_cancelled() {
            info!("Stopping work pool");
        }
        self.shared.stop.cancel();
        self.shared.queue.close();
    }

    /// Stop, wait for every worker to exit, then dead-letter whatever was
    /// still queued.
    pub async fn shutdown(&self) {
        self.stop();
        let handles = std::mem::take(&mut *lock(&self.workers));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        let leftovers = self.shared.queue.drain();
        if !leftovers.is_empty() {
            warn!(count = leftovers.len(), "Abandoning queued jobs at shutdown");
        }
        for item in leftovers {
            self.shared.abandon(item, "work pool shut down before the job ran");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        PoolStats {
            workers: self.shared.config.workers,
            queued: self.shared.queue.len(),
            processed: counters.processed.load(Ordering::Relaxed),
            failed_attempts: counters.failed_attempts.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            dead_lettered: self.shared.dead_letters.total(),
        }
    }

    /// Exhausted items retained for inspection.
    pub fn dead_letters(&self) -> &DeadLetterQueue<T> {
        &self.shared.dead_letters
    }

    /// Take the retained dead letters.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter<T>> {
        self.shared.dead_letters.drain()
    }
}

impl<T: Send + 'static> Shared<T> {
    async fn run_worker(&self, worker_id: usize) {
        debug!(worker_id, "Worker started");
        while !self.stop.is_cancelled() {
            let item = match self
                .queue
                .pop_item(&self.stop, Wait::For(self.config.pop_timeout))
                .await
            {
                Ok(item) => item,
                Err(QueueError::Timeout(_)) => continue,
                Err(_) => break,
            };
            self.process(item, worker_id).await;
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn process(&self, mut item: WorkItem<T>, worker_id: usize) {
        loop {
            let attempt = Attempt {
                number: item.retries + 1,
                is_final: item.is_final_attempt(),
            };
            let outcome = AssertUnwindSafe(self.handler.handle(&mut item.data, attempt))
                .catch_unwind()
                .await;

            let error = match outcome {
                Ok(Ok(())) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(Err(e)) => e,
                Err(panic) => ExecutionError::Panicked(panic_message(panic.as_ref())),
            };

            self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
            item.retries += 1;
            item.last_error = Some(error.to_string());

            if item.retries > item.max_retries || !error.is_retryable() {
                self.dead_letters.push(item);
                return;
            }

            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            let delay = self.config.backoff(item.retries);
            warn!(
                worker_id,
                attempt = attempt.number,
                max_retries = item.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = item.last_error.as_deref().unwrap_or_default(),
                "Job failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.cancelled() => {
                    debug!(worker_id, "Pool stopping during backoff, abandoning retry");
                    self.abandon(item, "work pool stopped during retry backoff");
                    return;
                }
            }
        }
    }

    fn abandon(&self, mut item: WorkItem<T>, reason: &str) {
        self.handler.abandon(&mut item.data, reason);
        item.last_error = Some(reason.to_string());
        self.dead_letters.push(item);
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            queue_capacity: 64,
            pop_timeout: Duration::from_millis(50),
            retry_base: Duration::from_millis(5),
            retry_cap: Duration::from_millis(20),
            dead_letter_capacity: 8,
        }
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<u32>,
        delay: Duration,
    }

    #[async_trait]
    impl JobHandler<u32> for Recorder {
        async fn handle(&self, job: &mut u32, _attempt: Attempt) -> Result<(), ExecutionError> {
            tokio::time::sleep(self.delay).await;
            let _ = self.tx.send(*job);
            Ok(())
        }
    }

    struct AlwaysFails {
        calls: Arc<AtomicU32>,
        finals: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler<&'static str> for AlwaysFails {
        async fn handle(
            &self,
            _job: &mut &'static str,
            attempt: Attempt,
        ) -> Result<(), ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if attempt.is_final {
                self.finals.fetch_add(1, Ordering::SeqCst);
            }
            Err(ExecutionError::Failed("boom".into()))
        }
    }

    struct Rejects {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler<u8> for Rejects {
        async fn handle(&self, job: &mut u8, _attempt: Attempt) -> Result<(), ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ExecutionError::InvalidParams {
                task_type: format!("job-{job}"),
                reason: "missing field".into(),
            })
        }
    }

    struct CountsAbandoned {
        abandoned: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler<u8> for CountsAbandoned {
        async fn handle(&self, _job: &mut u8, _attempt: Attempt) -> Result<(), ExecutionError> {
            Ok(())
        }

        fn abandon(&self, _job: &mut u8, _reason: &str) {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler<()> for Panics {
        async fn handle(&self, _job: &mut (), _attempt: Attempt) -> Result<(), ExecutionError> {
            panic!("handler exploded");
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn single_worker_completes_in_priority_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = WorkPool::new(
            fast_config(1),
            Arc::new(Recorder {
                tx,
                delay: Duration::from_millis(10),
            }),
        );

        // job value doubles as an id: priority * 10 + submission index
        for (index, priority) in [1, 5, 3, 5, 2].into_iter().enumerate() {
            let id = priority as u32 * 10 + index as u32;
            pool.submit_with_retries(id, priority, 0).unwrap();
        }
        pool.start();

        let mut completed = Vec::new();
        for _ in 0..5 {
            let id = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            completed.push(id);
        }
        assert_eq!(completed, vec![51, 53, 32, 24, 10]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn always_failing_job_runs_max_retries_plus_one_then_dead_letters() {
        let calls = Arc::new(AtomicU32::new(0));
        let finals = Arc::new(AtomicU32::new(0));
        let pool = WorkPool::new(
            fast_config(1),
            Arc::new(AlwaysFails {
                calls: Arc::clone(&calls),
                finals: Arc::clone(&finals),
            }),
        );
        pool.start();
        pool.submit_with_retries("doomed", 0, 3).unwrap();

        wait_for(|| pool.dead_letters().total() == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(finals.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.failed_attempts, 4);
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.processed, 0);

        let dead = pool.drain_dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].item.retries, 4);
        assert!(dead[0].item.last_error.as_deref().unwrap().contains("boom"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_worker() {
        let pool = WorkPool::new(fast_config(1), Arc::new(Panics));
        pool.start();
        pool.submit(()).unwrap();
        pool.submit(()).unwrap();

        wait_for(|| pool.dead_letters().total() == 2).await;
        let dead = pool.drain_dead_letters();
        assert!(
            dead[0]
                .item
                .last_error
                .as_deref()
                .unwrap()
                .contains("handler exploded")
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn non_retryable_error_skips_remaining_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let pool = WorkPool::new(
            fast_config(1),
            Arc::new(Rejects {
                calls: Arc::clone(&calls),
            }),
        );
        pool.start();
        pool.submit_with_retries(7, 0, 5).unwrap();

        wait_for(|| pool.dead_letters().total() == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().retried, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn queued_jobs_are_abandoned_at_shutdown() {
        let abandoned = Arc::new(AtomicU32::new(0));
        let pool = WorkPool::new(
            fast_config(1),
            Arc::new(CountsAbandoned {
                abandoned: Arc::clone(&abandoned),
            }),
        );
        // never started, so nothing drains the queue
        pool.submit(1).unwrap();
        pool.submit(2).unwrap();
        pool.shutdown().await;

        assert_eq!(abandoned.load(Ordering::SeqCst), 2);
        assert_eq!(pool.dead_letters().total(), 2);
    }

    #[tokio::test]
    async fn try_submit_hands_back_rejected_job() {
        let mut config = fast_config(1);
        config.queue_capacity = 1;
        let pool = WorkPool::new(
            config,
            Arc::new(CountsAbandoned {
                abandoned: Arc::new(AtomicU32::new(0)),
            }),
        );
        pool.try_submit(1, 0, 0).unwrap();
        let rejected = pool.try_submit(2, 0, 0).unwrap_err();
        assert_eq!(rejected.job, 2);
        assert_eq!(rejected.error, QueueError::Full { capacity: 1 });
    }

    #[tokio::test]
    async fn submit_after_stop_fails_closed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = WorkPool::new(
            fast_config(2),
            Arc::new(Recorder {
                tx,
                delay: Duration::ZERO,
            }),
        );
        pool.start();
        pool.stop();
        pool.stop();

        assert_eq!(pool.submit(1).unwrap_err(), QueueError::Closed);
        assert!(pool.is_stopped());
        tokio::time::timeout(Duration::from_secs(2), pool.shutdown())
            .await
            .expect("workers should exit promptly");
    }
}
