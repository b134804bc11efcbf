//! Offline provider that echoes its input. Used by the demo binary and tests.

use std::time::Duration;

use async_trait::async_trait;

use super::{
    AsrProvider, ChatRequest, LlmProvider, SynthesizeRequest, TranscribeRequest, TtsProvider,
};
use crate::error::ProviderError;

#[derive(Debug, Clone, Default)]
pub struct EchoProvider {
    latency: Duration,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated upstream latency per call.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl AsrProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    /// Interprets the audio bytes as UTF-8 text.
    async fn transcribe(&self, request: &TranscribeRequest) -> Result<String, ProviderError> {
        self.pause().await;
        String::from_utf8(request.audio.clone()).map_err(|e| ProviderError::RequestFailed {
            provider: "echo".to_string(),
            reason: format!("audio is not utf-8: {e}"),
        })
    }
}

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        self.pause().await;
        let last = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!("You said: {last}"))
    }
}

#[async_trait]
impl TtsProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn synthesize(&self, request: &SynthesizeRequest) -> Result<Vec<u8>, ProviderError> {
        self.pause().await;
        Ok(request.text.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    #[tokio::test]
    async fn echoes_through_each_stage() {
        let echo = EchoProvider::new();
        let text = echo
            .transcribe(&TranscribeRequest {
                audio: b"hello".to_vec(),
                sample_rate: 16_000,
                language: None,
            })
            .await
            .unwrap();
        assert_eq!(text, "hello");

        let reply = echo
            .chat(&ChatRequest::new(vec![ChatMessage::user(text)]))
            .await
            .unwrap();
        assert_eq!(reply, "You said: hello");

        let audio = echo.synthesize(&SynthesizeRequest::new("ok")).await.unwrap();
        assert_eq!(audio, b"ok");
    }

    #[tokio::test]
    async fn non_utf8_audio_fails() {
        let err = EchoProvider::new()
            .transcribe(&TranscribeRequest {
                audio: vec![0xff, 0xfe],
                sample_rate: 16_000,
                language: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RequestFailed { .. }));
    }
}
