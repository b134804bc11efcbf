//! Provider wrapper that routes every call through a resilience envelope.

use async_trait::async_trait;

use super::{
    AsrProvider, ChatRequest, LlmProvider, SynthesizeRequest, TranscribeRequest, TtsProvider,
};
use crate::config::ResilienceConfig;
use crate::error::ProviderError;
use crate::resilience::Resilience;

/// A provider plus its own circuit breaker, rate limiter and cache.
///
/// `V` is the provider's output type; the wrapper implements whichever of
/// [`AsrProvider`], [`LlmProvider`] and [`TtsProvider`] the inner provider
/// does.
pub struct Resilient<P, V> {
    inner: P,
    envelope: Resilience<V>,
    cache_responses: bool,
}

impl<P, V: Clone> Resilient<P, V> {
    pub fn new(inner: P, provider: impl Into<String>, config: &ResilienceConfig) -> Self {
        Self {
            inner,
            envelope: Resilience::new(provider, config),
            cache_responses: true,
        }
    }

    /// Turn response caching off, e.g. for sampling LLM calls.
    pub fn without_cache(mut self) -> Self {
        self.cache_responses = false;
        self
    }

    pub fn envelope(&self) -> &Resilience<V> {
        &self.envelope
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn key(&self, build: impl FnOnce(&str) -> String) -> Option<String> {
        self.cache_responses
            .then(|| build(self.envelope.provider()))
    }
}

#[async_trait]
impl<P: AsrProvider> AsrProvider for Resilient<P, String> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn transcribe(&self, request: &TranscribeRequest) -> Result<String, ProviderError> {
        let key = self.key(|p| request.cache_key(p));
        self.envelope
            .call(key.as_deref(), || self.inner.transcribe(request))
            .await
    }
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for Resilient<P, String> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let key = self.key(|p| request.cache_key(p));
        self.envelope
            .call(key.as_deref(), || self.inner.chat(request))
            .await
    }
}

#[async_trait]
impl<P: TtsProvider> TtsProvider for Resilient<P, Vec<u8>> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn synthesize(&self, request: &SynthesizeRequest) -> Result<Vec<u8>, ProviderError> {
        let key = self.key(|p| request.cache_key(p));
        self.envelope
            .call(key.as_deref(), || self.inner.synthesize(request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTts {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TtsProvider for CountingTts {
        fn name(&self) -> &str {
            "counting"
        }

        async fn synthesize(&self, request: &SynthesizeRequest) -> Result<Vec<u8>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(request.text.as_bytes().to_vec())
        }
    }

    fn counting() -> CountingTts {
        CountingTts {
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn identical_requests_hit_the_cache() {
        let tts = Resilient::<_, Vec<u8>>::new(counting(), "tts", &ResilienceConfig::default());
        let req = SynthesizeRequest::new("hello");
        tts.synthesize(&req).await.unwrap();
        tts.synthesize(&req).await.unwrap();
        assert_eq!(tts.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_options_miss_the_cache() {
        let tts = Resilient::<_, Vec<u8>>::new(counting(), "tts", &ResilienceConfig::default());
        let req = SynthesizeRequest::new("hello");
        let mut faster = req.clone();
        faster.speed = 2.0;
        tts.synthesize(&req).await.unwrap();
        tts.synthesize(&faster).await.unwrap();
        assert_eq!(tts.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_can_be_disabled() {
        let tts = Resilient::<_, Vec<u8>>::new(counting(), "tts", &ResilienceConfig::default())
            .without_cache();
        let req = SynthesizeRequest::new("hello");
        tts.synthesize(&req).await.unwrap();
        tts.synthesize(&req).await.unwrap();
        assert_eq!(tts.inner().calls.load(Ordering::SeqCst), 2);
        assert!(tts.envelope().cache().is_empty());
    }
}
