//! Error types for the dispatch core.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Priority queue errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,

    #[error("Queue is empty")]
    Empty,

    #[error("Queue is full ({capacity} items)")]
    Full { capacity: usize },

    #[error("Timed out after {0:?} waiting for an item")]
    Timeout(Duration),

    #[error("Wait cancelled")]
    Cancelled,
}

/// Per-client quota rejections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    #[error("Daily task limit reached ({used}/{max})")]
    DailyLimitReached { used: u32, max: u32 },

    #[error("Concurrent task limit reached ({running}/{max})")]
    ConcurrencyLimitReached { running: u32, max: u32 },
}

/// Admission errors, returned synchronously and never retried.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Task type {task_type} is not registered")]
    TaskTypeNotRegistered { task_type: String },

    #[error("Quota exceeded for client {client_id}: {source}")]
    QuotaExceeded {
        client_id: String,
        #[source]
        source: QuotaError,
    },

    #[error("Task {id} has no scheduled time")]
    MissingScheduledTime { id: Uuid },

    #[error("Scheduled task {id} not found")]
    ScheduledNotFound { id: Uuid },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl SubmitError {
    /// Whether this rejection came from the client's quota.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// Errors raised while a task executes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Invalid parameters for {task_type}: {reason}")]
    InvalidParams { task_type: String, reason: String },

    #[error("Task was cancelled before it ran")]
    Cancelled,

    #[error("Executor panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl ExecutionError {
    /// Whether another attempt could succeed. Envelope backpressure is
    /// surfaced to the caller instead of being retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed(_) => true,
            Self::Provider(e) => !e.is_backpressure(),
            Self::InvalidParams { .. } | Self::Cancelled | Self::Panicked(_) => false,
        }
    }
}

/// Errors from an upstream AI provider or its resilience envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    #[error("Rate limit exceeded for provider {provider}")]
    RateLimitExceeded { provider: String },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Connection pool for {provider} is closed")]
    PoolClosed { provider: String },
}

impl ProviderError {
    /// Errors produced by the envelope itself rather than the upstream call.
    ///
    /// These should be turned into a "service busy" reply, not retried.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::RateLimitExceeded { .. })
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_message_includes_reason() {
        let err = SubmitError::QuotaExceeded {
            client_id: "c1".into(),
            source: QuotaError::ConcurrencyLimitReached { running: 5, max: 5 },
        };
        assert!(err.is_quota_exceeded());
        assert_eq!(
            err.to_string(),
            "Quota exceeded for client c1: Concurrent task limit reached (5/5)"
        );
    }

    #[test]
    fn backpressure_classification() {
        let open = ProviderError::CircuitOpen {
            provider: "tts".into(),
        };
        let failed = ProviderError::RequestFailed {
            provider: "tts".into(),
            reason: "502".into(),
        };
        assert!(open.is_backpressure());
        assert!(!failed.is_backpressure());
    }

    #[test]
    fn only_transient_execution_errors_retry() {
        assert!(ExecutionError::Failed("flaky".into()).is_retryable());
        assert!(
            ExecutionError::Provider(ProviderError::Timeout {
                provider: "llm".into(),
                timeout: Duration::from_secs(3),
            })
            .is_retryable()
        );
        assert!(
            !ExecutionError::Provider(ProviderError::RateLimitExceeded {
                provider: "llm".into()
            })
            .is_retryable()
        );
        assert!(!ExecutionError::Cancelled.is_retryable());
        assert!(!ExecutionError::Panicked("x".into()).is_retryable());
    }

    #[test]
    fn queue_error_converts_into_submit_error() {
        let err: SubmitError = QueueError::Closed.into();
        assert!(matches!(err, SubmitError::Queue(QueueError::Closed)));
        assert_eq!(err.to_string(), "Queue is closed");
    }
}
