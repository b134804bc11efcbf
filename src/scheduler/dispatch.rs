//! Runs admitted tasks through their executors and settles their quota.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::ExecutionError;
use crate::pool::{Attempt, JobHandler, panic_message};
use crate::quota::ClientContext;
use crate::task::{Task, TaskRegistry};

/// An admitted task bound to the client whose quota it holds.
#[derive(Debug)]
pub struct TaskJob {
    pub task: Task,
    pub client: Arc<ClientContext>,
}

impl TaskJob {
    pub fn new(task: Task, client: Arc<ClientContext>) -> Self {
        Self { task, client }
    }
}

/// Pool handler for [`TaskJob`]s.
///
/// Every job it sees ends in exactly one of `complete` or `fail`, each of
/// which releases the client's running slot once and notifies the callback.
pub(crate) struct TaskDispatcher {
    registry: Arc<TaskRegistry>,
}

impl TaskDispatcher {
    pub(crate) fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    fn complete(job: &mut TaskJob, result: Value) {
        job.client.quota().complete_task();
        job.task.mark_complete(result);
        debug!(task_id = %job.task.id, client_id = %job.client.id(), "Task complete");
        if let (Some(callback), Some(result)) = (job.task.callback(), job.task.result.as_ref()) {
            callback.on_complete(&job.task, result);
        }
    }

    pub(crate) fn fail(job: &mut TaskJob, error: ExecutionError) {
        job.client.quota().complete_task();
        job.task.mark_failed(error.to_string());
        if let Some(callback) = job.task.callback() {
            callback.on_error(&job.task, &error);
        }
    }

    /// Run a job once outside the pool, as its only attempt.
    pub(crate) async fn run_detached(&self, mut job: TaskJob) {
        let task_id = job.task.id;
        let attempt = Attempt {
            number: 1,
            is_final: true,
        };
        match AssertUnwindSafe(self.handle(&mut job, attempt))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%task_id, error = %e, "Detached task failed"),
            Err(panic) => error!(
                %task_id,
                panic = %panic_message(panic.as_ref()),
                "Detached task panicked"
            ),
        }
    }
}

#[async_trait]
impl JobHandler<TaskJob> for TaskDispatcher {
    async fn handle(&self, job: &mut TaskJob, attempt: Attempt) -> Result<(), ExecutionError> {
        let task_id = job.task.id;
        let client_id = job.client.id().to_string();

        if job.task.is_cancelled() {
            debug!(%task_id, %client_id, "Task cancelled before execution, skipping");
            Self::fail(job, ExecutionError::Cancelled);
            return Ok(());
        }

        let Some(executor) = self.registry.get(&job.task.task_type) else {
            // unregistered after admission
            warn!(%task_id, task_type = %job.task.task_type, "No executor for task");
            let reason = format!("no executor registered for {}", job.task.task_type);
            Self::fail(job, ExecutionError::Failed(reason));
            return Ok(());
        };

        job.task.mark_running();
        debug!(
            %task_id,
            %client_id,
            task_type = %job.task.task_type,
            attempt = attempt.number,
            "Executing task"
        );

        let outcome = AssertUnwindSafe(executor.execute(&job.task))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => {
                Self::complete(job, result);
                Ok(())
            }
            Ok(Err(e)) if e.is_retryable() && !attempt.is_final => {
                job.task.mark_retrying(e.to_string());
                Err(e)
            }
            Ok(Err(e)) => {
                warn!(%task_id, %client_id, attempt = attempt.number, error = %e, "Task failed");
                Self::fail(job, e.clone());
                Err(e)
            }
            Err(panic) => {
                let e = ExecutionError::Panicked(panic_message(panic.as_ref()));
                error!(%task_id, %client_id, error = %e, "Task executor panicked");
                Self::fail(job, e.clone());
                Err(e)
            }
        }
    }

    fn abandon(&self, job: &mut TaskJob, reason: &str) {
        warn!(task_id = %job.task.id, reason, "Abandoning task");
        Self::fail(job, ExecutionError::Failed(reason.to_string()));
    }
}
