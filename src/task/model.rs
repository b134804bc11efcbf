//! Task value object.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::callback::TaskCallback;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, waiting for a worker or its scheduled time.
    Pending,
    /// An executor is working on it.
    Running,
    /// Finished with a result.
    Complete,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A unit of asynchronous work.
///
/// Owned by the submitting client until it reaches a terminal state; only
/// the worker executing it mutates it after submission.
#[derive(Clone, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub status: TaskStatus,
    pub params: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Run no earlier than this. `None` means run immediately.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Set on submission.
    pub client_id: String,
    /// Higher runs first.
    pub priority: i32,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    cancel: CancellationToken,
    #[serde(skip)]
    callback: Option<Arc<dyn TaskCallback>>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, params: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            params,
            result: None,
            error: None,
            scheduled_time: None,
            client_id: String::new(),
            priority: 0,
            max_retries: 0,
            created_at: now,
            updated_at: now,
            cancel: CancellationToken::new(),
            callback: None,
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

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    /// Tie the task to a caller-owned token, usually the connection's.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn TaskCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn callback(&self) -> Option<&Arc<dyn TaskCallback>> {
        self.callback.as_ref()
    }

    /// Whether a scheduled task is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.is_none_or(|at| at <= now)
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_complete(&mut self, result: serde_json::Value) {
        self.status = TaskStatus::Complete;
        self.result = Some(result);
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// A failed attempt that will be retried: record the error, stay pending.
    pub(crate) fn mark_retrying(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Pending;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("status", &self.status)
            .field("client_id", &self.client_id)
            .field("priority", &self.priority)
            .field("scheduled_time", &self.scheduled_time)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
