//! Deferred tasks waiting for their scheduled time.
//!
//! A ticker scans the pending map every `tick_interval`, promotes due tasks
//! into the work pool and runs client maintenance (daily quota reset and
//! idle-client pruning). Tasks due in the same tick have no relative order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{TaskDispatcher, TaskJob};
use crate::config::SchedulerConfig;
use crate::error::QueueError;
use crate::pool::{JobHandler, Rejected, WorkPool};
use crate::quota::ClientManager;
use crate::sync::lock;

pub struct ScheduledTasks {
    pending: Mutex<HashMap<Uuid, TaskJob>>,
    pool: Arc<WorkPool<TaskJob>>,
    dispatcher: Arc<TaskDispatcher>,
    clients: Arc<ClientManager>,
    config: SchedulerConfig,
    stop: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTasks {
    pub(crate) fn new(
        pool: Arc<WorkPool<TaskJob>>,
        dispatcher: Arc<TaskDispatcher>,
        clients: Arc<ClientManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            pool,
            dispatcher,
            clients,
            config,
            stop: CancellationToken::new(),
            ticker: Mutex::new(None),
        }
    }

    /// Hold an admitted job until its scheduled time. Once stopped, the job
    /// is handed back and the caller settles its quota.
    pub(crate) fn add(&self, job: TaskJob) -> Result<(), TaskJob> {
        let mut pending = lock(&self.pending);
        // checked under the lock so `stop` either drains the job or refuses it
        if self.stop.is_cancelled() {
            return Err(job);
        }
        debug!(
            task_id = %job.task.id,
            client_id = %job.client.id(),
            scheduled_time = ?job.task.scheduled_time,
            "Task scheduled"
        );
        pending.insert(job.task.id, job);
        Ok(())
    }

    /// Remove a pending job. The caller settles its quota.
    pub(crate) fn remove(&self, task_id: Uuid) -> Option<TaskJob> {
        lock(&self.pending).remove(&task_id)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, task_id: Uuid) -> bool {
        lock(&self.pending).contains_key(&task_id)
    }

    /// Spawn the ticker. Does nothing if it is already running or stopped.
    pub(crate) fn start(self: &Arc<Self>) {
        let mut ticker = lock(&self.ticker);
        if ticker.is_some() || self.stop.is_cancelled() {
            return;
        }
        let this = Arc::clone(self);
        *ticker = Some(tokio::spawn(async move { this.run().await }));
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "Scheduled task ticker started"
        );
    }

    async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = interval.tick() => {
                    self.promote_due(Utc::now());
                    self.maintain().await;
                }
            }
        }
        debug!("Scheduled task ticker stopped");
    }

    fn take_due(&self, now: DateTime<Utc>) -> Vec<TaskJob> {
        let mut pending = lock(&self.pending);
        let due: Vec<Uuid> = pending
            .iter()
            .filter(|(_, job)| job.task.is_due(now))
            .map(|(id, _)| *id)
            .collect();
        due.iter().filter_map(|id| pending.remove(id)).collect()
    }

    /// Move every job due at `now` into the work pool. Returns how many moved.
    pub(crate) fn promote_due(&self, now: DateTime<Utc>) -> usize {
        let due = self.take_due(now);
        let count = due.len();
        for job in due {
            let task_id = job.task.id;
            let (priority, max_retries) = (job.task.priority, job.task.max_retries);
            match self.pool.try_submit(job, priority, max_retries) {
                Ok(()) => debug!(%task_id, "Scheduled task promoted"),
                Err(Rejected {
                    mut job,
                    error: QueueError::Closed,
                }) => {
                    self.dispatcher
                        .abandon(&mut job, "work pool stopped before the scheduled task ran");
                }
                Err(Rejected { job, error }) => {
                    warn!(
                        %task_id,
                        error = %error,
                        "Work pool rejected scheduled task, running it detached"
                    );
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tokio::spawn(async move { dispatcher.run_detached(job).await });
                }
            }
        }
        count
    }

    async fn maintain(&self) {
        let reset = self.clients.reset_daily_quotas().await;
        if reset > 0 {
            info!(clients = reset, "Daily quotas reset");
        }
        self.clients.prune_idle(self.config.idle_client_ttl).await;
    }

    /// Stop the ticker and hand back every job still pending.
    pub(crate) async fn stop(&self) -> Vec<TaskJob> {
        self.stop.cancel();
        let handle = lock(&self.ticker).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduled task ticker ended abnormally");
            }
        }
        lock(&self.pending).drain().map(|(_, job)| job).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::quota::ClientContext;
    use crate::quota::ResourceQuota;
    use crate::task::{Task, TaskRegistry};
    use chrono::TimeDelta;
    use serde_json::Value;

    fn scheduled(pool: Arc<WorkPool<TaskJob>>) -> ScheduledTasks {
        let dispatcher = Arc::new(TaskDispatcher::new(Arc::new(TaskRegistry::new())));
        ScheduledTasks::new(
            pool,
            dispatcher,
            Arc::new(ClientManager::new()),
            SchedulerConfig::default(),
        )
    }

    fn pool(queue_capacity: usize) -> Arc<WorkPool<TaskJob>> {
        let config = PoolConfig {
            queue_capacity,
            ..PoolConfig::default()
        };
        let dispatcher = Arc::new(TaskDispatcher::new(Arc::new(TaskRegistry::new())));
        Arc::new(WorkPool::new(config, dispatcher))
    }

    fn job_at(offset: TimeDelta) -> TaskJob {
        let client = Arc::new(ClientContext::new("c", ResourceQuota::with_limits(10, 10)));
        client.quota().try_increment().unwrap();
        let task = Task::new("noop", Value::Null).scheduled_at(Utc::now() + offset);
        TaskJob::new(task, client)
    }

    #[tokio::test]
    async fn only_due_jobs_are_promoted() {
        let pool = pool(8);
        let tasks = scheduled(Arc::clone(&pool));
        let past = job_at(TimeDelta::seconds(-1));
        let future = job_at(TimeDelta::hours(1));
        let future_id = future.task.id;
        tasks.add(past).unwrap();
        tasks.add(future).unwrap();

        assert_eq!(tasks.promote_due(Utc::now()), 1);
        assert_eq!(pool.stats().queued, 1);
        assert!(tasks.is_pending(future_id));
        assert_eq!(tasks.pending_count(), 1);
    }

    #[tokio::test]
    async fn closed_pool_releases_quota_of_promoted_job() {
        let pool = pool(8);
        pool.stop();
        let tasks = scheduled(pool);
        let job = job_at(TimeDelta::zero());
        let client = Arc::clone(&job.client);
        tasks.add(job).unwrap();

        tasks.promote_due(Utc::now() + TimeDelta::seconds(1));
        assert_eq!(client.active_tasks(), 0);
        assert_eq!(tasks.pending_count(), 0);
    }

    #[tokio::test]
    async fn stop_returns_pending_jobs() {
        let tasks = Arc::new(scheduled(pool(8)));
        tasks.start();
        tasks.add(job_at(TimeDelta::hours(1))).unwrap();

        let leftover = tokio::time::timeout(std::time::Duration::from_secs(2), tasks.stop())
            .await
            .unwrap();
        assert_eq!(leftover.len(), 1);
        assert_eq!(tasks.pending_count(), 0);
    }

    #[tokio::test]
    async fn add_after_stop_hands_job_back() {
        let tasks = Arc::new(scheduled(pool(8)));
        tasks.start();
        tokio::time::timeout(std::time::Duration::from_secs(2), tasks.stop())
            .await
            .unwrap();

        let job = job_at(TimeDelta::hours(1));
        let id = job.task.id;
        let refused = tasks.add(job).unwrap_err();
        assert_eq!(refused.task.id, id);
        assert_eq!(tasks.pending_count(), 0);
    }
}
