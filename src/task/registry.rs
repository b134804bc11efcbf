//! Registry mapping task types to their executors.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::model::Task;
use crate::error::ExecutionError;
use crate::sync::{read, write};

/// Performs the work for one task type.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, ExecutionError>;
}

/// Adapts an async closure taking an owned [`Task`] into a [`TaskExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

/// Build an executor from an async closure.
pub fn executor_fn<F, Fut>(f: F) -> Arc<FnExecutor<F>>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ExecutionError>> + Send + 'static,
{
    Arc::new(FnExecutor { f })
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ExecutionError>> + Send,
{
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, ExecutionError> {
        (self.f)(task.clone()).await
    }
}

/// Task type → executor map, owned by one scheduler instance.
pub struct TaskRegistry {
    executors: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Register an executor. A later registration for the same type wins.
    pub fn register(&self, task_type: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        let task_type = task_type.into();
        if write(&self.executors)
            .insert(task_type.clone(), executor)
            .is_some()
        {
            tracing::warn!(task_type = %task_type, "Replaced existing task executor");
        } else {
            tracing::debug!("Registered task executor: {}", task_type);
        }
    }

    /// Builder-style registration for startup wiring.
    pub fn with(self, task_type: impl Into<String>, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(task_type, executor);
        self
    }

    pub fn unregister(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        write(&self.executors).remove(task_type)
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        read(&self.executors).get(task_type).cloned()
    }

    pub fn has(&self, task_type: &str) -> bool {
        read(&self.executors).contains_key(task_type)
    }

    /// Registered task types.
    pub fn list(&self) -> Vec<String> {
        read(&self.executors).keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        read(&self.executors).len()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
