//! Task admission and lifecycle.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{TaskDispatcher, TaskJob};
use super::scheduled::ScheduledTasks;
use crate::config::{PoolConfig, ResourceConfig, SchedulerConfig};
use crate::error::{ExecutionError, QueueError, SubmitError};
use crate::pool::{DeadLetter, JobHandler, PoolStats, WorkPool};
use crate::quota::{ClientContext, ClientManager, QuotaSnapshot, UserLevel};
use crate::task::{Task, TaskExecutor, TaskRegistry};

/// Admits tasks against per-client quotas and runs them on a shared
/// [`WorkPool`], either immediately or at their scheduled time.
///
/// Every admitted task holds one running slot in its client's quota until the
/// dispatcher completes it, fails it, or the manager abandons it at stop.
pub struct TaskManager {
    registry: Arc<TaskRegistry>,
    clients: Arc<ClientManager>,
    dispatcher: Arc<TaskDispatcher>,
    pool: Arc<WorkPool<TaskJob>>,
    scheduled: Arc<ScheduledTasks>,
}

impl TaskManager {
    pub fn new(registry: TaskRegistry, pool: PoolConfig, scheduler: SchedulerConfig) -> Self {
        Self::with_clients(registry, ClientManager::new(), pool, scheduler)
    }

    /// Pool sizing from `resources`, default scheduler settings.
    pub fn from_resources(registry: TaskRegistry, resources: ResourceConfig) -> Self {
        Self::new(registry, resources.into(), SchedulerConfig::default())
    }

    pub fn with_clients(
        registry: TaskRegistry,
        clients: ClientManager,
        pool: PoolConfig,
        scheduler: SchedulerConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let clients = Arc::new(clients);
        let dispatcher = Arc::new(TaskDispatcher::new(Arc::clone(&registry)));
        let handler: Arc<dyn JobHandler<TaskJob>> = dispatcher.clone();
        let pool = Arc::new(WorkPool::new(pool, handler));
        let scheduled = Arc::new(ScheduledTasks::new(
            Arc::clone(&pool),
            Arc::clone(&dispatcher),
            Arc::clone(&clients),
            scheduler,
        ));
        Self {
            registry,
            clients,
            dispatcher,
            pool,
            scheduled,
        }
    }

    pub fn register_task_executor(
        &self,
        task_type: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) {
        self.registry.register(task_type, executor);
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    /// Start the workers and the scheduled-task ticker.
    pub fn start(&self) {
        self.pool.start();
        self.scheduled.start();
        info!(task_types = ?self.registry.list(), "Task manager started");
    }

    /// Stop accepting work, fail every task that has not run yet, and wait
    /// for in-flight tasks to finish.
    pub async fn stop(&self) {
        info!("Stopping task manager");
        for mut job in self.scheduled.stop().await {
            self.dispatcher
                .abandon(&mut job, "task manager stopped before the scheduled time");
        }
        self.pool.shutdown().await;
        info!("Task manager stopped");
    }

    /// Admit a task for `client_id`.
    ///
    /// Tasks with a future `scheduled_time` are held until then; everything
    /// else goes straight to the work pool. Returns the task ID.
    pub async fn submit_task(&self, client_id: &str, task: Task) -> Result<Uuid, SubmitError> {
        self.ensure_registered(&task)?;
        match task.scheduled_time {
            Some(at) if at > Utc::now() => self.schedule_task(client_id, task).await,
            _ => self.submit_immediate_task(client_id, task).await,
        }
    }

    async fn submit_immediate_task(
        &self,
        client_id: &str,
        mut task: Task,
    ) -> Result<Uuid, SubmitError> {
        task.client_id = client_id.to_string();
        let client = self.admit(client_id).await?;
        let (task_id, priority, max_retries) = (task.id, task.priority, task.max_retries);

        let job = TaskJob::new(task, Arc::clone(&client));
        if let Err(e) = self.pool.submit_with_retries(job, priority, max_retries) {
            client.quota().rollback();
            warn!(%task_id, %client_id, error = %e, "Work pool rejected task, quota rolled back");
            return Err(e.into());
        }

        debug!(%task_id, %client_id, priority, "Task submitted");
        Ok(task_id)
    }

    /// Admit a task to run at its `scheduled_time`. Quota is reserved now,
    /// not when the task becomes due.
    pub async fn schedule_task(
        &self,
        client_id: &str,
        mut task: Task,
    ) -> Result<Uuid, SubmitError> {
        self.ensure_registered(&task)?;
        if task.scheduled_time.is_none() {
            return Err(SubmitError::MissingScheduledTime { id: task.id });
        }
        if self.pool.is_stopped() {
            return Err(QueueError::Closed.into());
        }

        task.client_id = client_id.to_string();
        let client = self.admit(client_id).await?;
        let task_id = task.id;
        if let Err(job) = self.scheduled.add(TaskJob::new(task, client)) {
            job.client.quota().rollback();
            warn!(%task_id, %client_id, "Task manager stopping, scheduled task refused");
            return Err(QueueError::Closed.into());
        }
        Ok(task_id)
    }

    /// Withdraw a task that has not reached its scheduled time yet. Its
    /// quota reservation is returned and its callback sees
    /// [`ExecutionError::Cancelled`].
    pub fn cancel_scheduled(&self, task_id: Uuid) -> Result<(), SubmitError> {
        let mut job = self
            .scheduled
            .remove(task_id)
            .ok_or(SubmitError::ScheduledNotFound { id: task_id })?;

        job.client.quota().rollback();
        job.task.mark_failed(ExecutionError::Cancelled.to_string());
        if let Some(callback) = job.task.callback() {
            callback.on_error(&job.task, &ExecutionError::Cancelled);
        }
        info!(%task_id, client_id = %job.client.id(), "Scheduled task cancelled");
        Ok(())
    }

    fn ensure_registered(&self, task: &Task) -> Result<(), SubmitError> {
        if self.registry.has(&task.task_type) {
            Ok(())
        } else {
            Err(SubmitError::TaskTypeNotRegistered {
                task_type: task.task_type.clone(),
            })
        }
    }

    async fn admit(&self, client_id: &str) -> Result<Arc<ClientContext>, SubmitError> {
        let client = self.clients.get_or_create(client_id).await;
        if let Err(source) = client.quota().try_increment() {
            warn!(%client_id, reason = %source, "Task rejected by quota");
            return Err(SubmitError::QuotaExceeded {
                client_id: client_id.to_string(),
                source,
            });
        }
        Ok(client)
    }

    pub async fn set_user_level(&self, client_id: &str, level: UserLevel) {
        self.clients.set_user_level(client_id, level).await;
        info!(%client_id, %level, "User level changed");
    }

    /// Override a client's ceilings, e.g. for a custom plan.
    pub async fn set_client_limits(
        &self,
        client_id: &str,
        max_total_tasks: u32,
        max_concurrent_tasks: u32,
    ) {
        self.clients
            .get_or_create(client_id)
            .await
            .quota()
            .set_limits(max_total_tasks, max_concurrent_tasks);
    }

    /// Current quota usage, if the client is known.
    pub async fn quota(&self, client_id: &str) -> Option<QuotaSnapshot> {
        self.clients.snapshot(client_id).await
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.pending_count()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Take the tasks the pool gave up on.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter<TaskJob>> {
        self.pool.drain_dead_letters()
    }
}
