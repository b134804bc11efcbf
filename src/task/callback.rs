//! Completion callbacks supplied by the submitter.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::model::Task;
use crate::error::ExecutionError;
use crate::sync::lock;

/// Final result of a task as seen by its submitter.
pub type TaskOutcome = Result<serde_json::Value, ExecutionError>;

/// Notified once when a task reaches a terminal state.
///
/// Called from a worker; implementations must not block.
pub trait TaskCallback: Send + Sync {
    fn on_complete(&self, task: &Task, result: &serde_json::Value);
    fn on_error(&self, task: &Task, error: &ExecutionError);
}

/// Callback that forwards the outcome over a oneshot channel.
pub struct OneshotCallback {
    tx: Mutex<Option<oneshot::Sender<TaskOutcome>>>,
}

impl OneshotCallback {
    /// Create a callback and the receiver its outcome is delivered to.
    pub fn channel() -> (Arc<Self>, oneshot::Receiver<TaskOutcome>) {
        let (tx, rx) = oneshot::channel();
        let callback = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        });
        (callback, rx)
    }

    fn send(&self, outcome: TaskOutcome) {
        if let Some(tx) = lock(&self.tx).take() {
            // Receiver gone means the connection went away
            let _ = tx.send(outcome);
        }
    }
}

impl TaskCallback for OneshotCallback {
    fn on_complete(&self, _task: &Task, result: &serde_json::Value) {
        self.send(Ok(result.clone()));
    }

    fn on_error(&self, _task: &Task, error: &ExecutionError) {
        self.send(Err(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_first_outcome_only() {
        let (callback, rx) = OneshotCallback::channel();
        let task = Task::new("llm", serde_json::Value::Null);

        callback.on_complete(&task, &serde_json::json!("first"));
        callback.on_error(&task, &ExecutionError::Failed("late".into()));

        assert_eq!(rx.await.unwrap().unwrap(), serde_json::json!("first"));
    }

    #[tokio::test]
    async fn dropped_receiver_is_ignored() {
        let (callback, rx) = OneshotCallback::channel();
        drop(rx);
        let task = Task::new("llm", serde_json::Value::Null);
        callback.on_error(&task, &ExecutionError::Cancelled);
    }
}
