//! Task executors for the speech → language model → speech pipeline.
//!
//! Each executor decodes its request from the task params, calls its provider
//! and abandons the call if the task's cancellation token fires first.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    AsrProvider, ChatRequest, LlmProvider, SynthesizeRequest, TranscribeRequest, TtsProvider,
};
use crate::error::{ExecutionError, ProviderError};
use crate::task::{Task, TaskExecutor};

/// Task type handled by [`AsrExecutor`].
pub const ASR_TASK: &str = "asr";
/// Task type handled by [`LlmExecutor`].
pub const LLM_TASK: &str = "llm";
/// Task type handled by [`TtsExecutor`].
pub const TTS_TASK: &str = "tts";

fn decode<R: DeserializeOwned>(task: &Task) -> Result<R, ExecutionError> {
    serde_json::from_value(task.params.clone()).map_err(|e| ExecutionError::InvalidParams {
        task_type: task.task_type.clone(),
        reason: e.to_string(),
    })
}

async fn until_cancelled<T>(
    task: &Task,
    call: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ExecutionError> {
    tokio::select! {
        result = call => result.map_err(ExecutionError::from),
        _ = task.cancellation().cancelled() => Err(ExecutionError::Cancelled),
    }
}

/// Transcribes `{"audio": [..], "sample_rate"?, "language"?}` into `{"text"}`.
pub struct AsrExecutor {
    provider: Arc<dyn AsrProvider>,
}

impl AsrExecutor {
    pub fn new(provider: Arc<dyn AsrProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TaskExecutor for AsrExecutor {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, ExecutionError> {
        let request: TranscribeRequest = decode(task)?;
        let text = until_cancelled(task, self.provider.transcribe(&request)).await?;
        Ok(json!({ "text": text }))
    }
}

/// Answers `{"messages": [..], ..}` with `{"reply"}`.
pub struct LlmExecutor {
    provider: Arc<dyn LlmProvider>,
}

impl LlmExecutor {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TaskExecutor for LlmExecutor {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, ExecutionError> {
        let request: ChatRequest = decode(task)?;
        let reply = until_cancelled(task, self.provider.chat(&request)).await?;
        Ok(json!({ "reply": reply }))
    }
}

/// Speaks `{"text", "voice"?, "speed"?, "format"?}` into `{"audio", "format"}`.
pub struct TtsExecutor {
    provider: Arc<dyn TtsProvider>,
}

impl TtsExecutor {
    pub fn new(provider: Arc<dyn TtsProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TaskExecutor for TtsExecutor {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, ExecutionError> {
        let request: SynthesizeRequest = decode(task)?;
        let audio = until_cancelled(task, self.provider.synthesize(&request)).await?;
        Ok(json!({ "audio": audio, "format": request.format }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::EchoProvider;
    use std::time::Duration;

    #[tokio::test]
    async fn llm_executor_replies() {
        let executor = LlmExecutor::new(Arc::new(EchoProvider::new()));
        let task = Task::new(
            LLM_TASK,
            json!({"messages": [{"role": "user", "content": "ping"}]}),
        );
        let result = executor.execute(&task).await.unwrap();
        assert_eq!(result["reply"], "You said: ping");
    }

    #[tokio::test]
    async fn bad_params_are_invalid() {
        let executor = TtsExecutor::new(Arc::new(EchoProvider::new()));
        let task = Task::new(TTS_TASK, json!({"voice": "alloy"}));
        let err = executor.execute(&task).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::InvalidParams { ref task_type, .. } if task_type == "tts"
        ));
    }

    #[tokio::test]
    async fn cancellation_aborts_slow_provider() {
        let executor = AsrExecutor::new(Arc::new(EchoProvider::with_latency(
            Duration::from_secs(10),
        )));
        let task = Task::new(ASR_TASK, json!({"audio": [104, 105]}));
        let token = task.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(2), executor.execute(&task))
            .await
            .expect("cancellation should abort the call")
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
    }
}
