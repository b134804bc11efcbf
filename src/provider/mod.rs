//! Pluggable speech-recognition, language-model and speech-synthesis
//! providers.
//!
//! Concrete network clients live outside this crate; they implement the
//! traits here and are wrapped in [`Resilient`] so every call passes through
//! a per-instance resilience envelope.

mod echo;
mod executors;
mod resilient;

pub use echo::EchoProvider;
pub use executors::{ASR_TASK, AsrExecutor, LLM_TASK, LlmExecutor, TTS_TASK, TtsExecutor};
pub use resilient::Resilient;

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::resilience::CacheKey;

/// Audio to transcribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeRequest {
    /// Raw PCM samples.
    pub audio: Vec<u8>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// BCP-47 hint; `None` lets the provider detect it.
    #[serde(default)]
    pub language: Option<String>,
}

fn default_sample_rate() -> u32 {
    16_000
}

impl TranscribeRequest {
    pub fn cache_key(&self, provider: &str) -> String {
        let mut hasher = DefaultHasher::new();
        self.audio.hash(&mut hasher);
        CacheKey::new(provider)
            .field("op", "transcribe")
            .field("audio", format!("{:016x}/{}", hasher.finish(), self.audio.len()))
            .field("sample_rate", self.sample_rate)
            .opt_field("language", self.language.as_deref())
            .build()
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Provider default when `None`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }

    pub fn cache_key(&self, provider: &str) -> String {
        let key = CacheKey::new(provider)
            .field("op", "chat")
            .opt_field("model", self.model.as_deref())
            .field("temperature", self.temperature)
            .field("max_tokens", self.max_tokens)
            .field("turns", self.messages.len());
        self.messages
            .iter()
            .fold(key, |key, m| key.field("role", &m.role).field("content", &m.content))
            .build()
    }
}

/// Text to speak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Output encoding, e.g. `pcm16` or `opus`.
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_voice() -> String {
    "default".to_string()
}

fn default_speed() -> f32 {
    1.0
}

fn default_format() -> String {
    "pcm16".to_string()
}

impl SynthesizeRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: default_voice(),
            speed: default_speed(),
            format: default_format(),
        }
    }

    pub fn cache_key(&self, provider: &str) -> String {
        CacheKey::new(provider)
            .field("op", "synthesize")
            .field("text", &self.text)
            .field("voice", &self.voice)
            .field("speed", self.speed)
            .field("format", &self.format)
            .build()
    }
}

/// Speech-to-text.
#[async_trait]
pub trait AsrProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn transcribe(&self, request: &TranscribeRequest) -> Result<String, ProviderError>;
}

/// Chat completion.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn chat(&self, request: &ChatRequest) -> Result<String, ProviderError>;
}

/// Text-to-speech.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn synthesize(&self, request: &SynthesizeRequest) -> Result<Vec<u8>, ProviderError>;
}

#[async_trait]
impl<P: AsrProvider + ?Sized> AsrProvider for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn transcribe(&self, request: &TranscribeRequest) -> Result<String, ProviderError> {
        (**self).transcribe(request).await
    }
}

#[async_trait]
impl<P: LlmProvider + ?Sized> LlmProvider for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        (**self).chat(request).await
    }
}

#[async_trait]
impl<P: TtsProvider + ?Sized> TtsProvider for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn synthesize(&self, request: &SynthesizeRequest) -> Result<Vec<u8>, ProviderError> {
        (**self).synthesize(request).await
    }
}
