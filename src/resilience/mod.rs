//! Resilience primitives wrapped around every outbound provider call.
//!
//! Each provider instance owns its own [`Resilience`] envelope; nothing is
//! shared across providers. A call goes through, in order:
//!
//! 1. the [`ResponseCache`] (hits return without touching the upstream),
//! 2. the [`RateLimiter`] (`RateLimitExceeded` when the window is full),
//! 3. the [`CircuitBreaker`] (`CircuitOpen` while cooling down),
//! 4. the upstream call, whose outcome feeds the breaker and the cache.
//!
//! Envelope rejections are returned immediately and are not retried here.

mod cache;
mod circuit_breaker;
mod connection_pool;
mod rate_limiter;

pub use cache::{CacheKey, ResponseCache};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use connection_pool::{ConnectionFactory, ConnectionPool, PooledConnection};
pub use rate_limiter::RateLimiter;

use std::future::Future;

use crate::config::ResilienceConfig;
use crate::error::ProviderError;

/// Circuit breaker, rate limiter and response cache for one provider.
pub struct Resilience<V> {
    provider: String,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    cache: ResponseCache<V>,
}

impl<V: Clone> Resilience<V> {
    pub fn new(provider: impl Into<String>, config: &ResilienceConfig) -> Self {
        Self {
            provider: provider.into(),
            breaker: CircuitBreaker::new(config.max_failures, config.retry_after),
            limiter: RateLimiter::new(config.max_requests, config.window),
            cache: ResponseCache::new(config.cache_ttl, config.cache_capacity),
        }
    }

    /// Run `call` inside the envelope. With `cache_key` set, a fresh cached
    /// response is returned instead and successful results are stored.
    pub async fn call<F, Fut>(&self, cache_key: Option<&str>, call: F) -> Result<V, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ProviderError>>,
    {
        if let Some(key) = cache_key
            && let Some(hit) = self.cache.get(key)
        {
            tracing::debug!(provider = %self.provider, "Response cache hit");
            return Ok(hit);
        }

        if !self.limiter.allow_request() {
            tracing::debug!(provider = %self.provider, "Rate limit exceeded");
            return Err(ProviderError::RateLimitExceeded {
                provider: self.provider.clone(),
            });
        }

        if self.breaker.is_open() {
            return Err(ProviderError::CircuitOpen {
                provider: self.provider.clone(),
            });
        }

        let mut outcome = CallOutcome::new(&self.breaker);
        let result = call().await;
        match &result {
            Ok(value) => {
                outcome.succeeded();
                if let Some(key) = cache_key {
                    self.cache.set(key, value.clone());
                }
            }
            Err(e) => {
                tracing::warn!(provider = %self.provider, error = %e, "Provider call failed");
                outcome.failed();
            }
        }
        result
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache<V> {
        &self.cache
    }
}

/// Reports a call's outcome to the breaker exactly once. A call dropped
/// before finishing, e.g. because the client hung up, says nothing about
/// the upstream: it records no outcome and only hands back a half-open
/// trial slot.
struct CallOutcome<'a> {
    breaker: &'a CircuitBreaker,
    reported: bool,
}

impl<'a> CallOutcome<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            reported: false,
        }
    }

    fn succeeded(&mut self) {
        self.reported = true;
        self.breaker.record_success();
    }

    fn failed(&mut self) {
        self.reported = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallOutcome<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            max_failures: 2,
            retry_after: Duration::from_secs(60),
            max_requests: 100,
            window: Duration::from_secs(1),
            cache_ttl: Duration::from_secs(60),
            cache_capacity: 16,
            max_connections: 1,
        }
    }

    fn failing() -> Result<String, ProviderError> {
        Err(ProviderError::RequestFailed {
            provider: "llm".into(),
            reason: "503".into(),
        })
    }

    #[tokio::test]
    async fn cache_hit_skips_upstream() {
        let envelope = Resilience::new("llm", &config());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = envelope
                .call(Some("k"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("answer".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "answer");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_open_the_circuit() {
        let envelope = Resilience::new("llm", &config());
        for _ in 0..2 {
            let err = envelope.call(None, || async { failing() }).await.unwrap_err();
            assert!(matches!(err, ProviderError::RequestFailed { .. }));
        }

        let err = envelope
            .call(None, || async { Ok("never".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::CircuitOpen {
                provider: "llm".into()
            }
        );
        assert!(err.is_backpressure());
    }

    #[tokio::test]
    async fn failed_results_are_not_cached() {
        let envelope = Resilience::new("llm", &config());
        let _ = envelope.call(Some("k"), || async { failing() }).await;
        assert!(envelope.cache().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_rejects_before_upstream() {
        let mut cfg = config();
        cfg.max_requests = 1;
        let envelope = Resilience::new("tts", &cfg);

        envelope
            .call(None, || async { Ok("one".to_string()) })
            .await
            .unwrap();
        let err = envelope
            .call(None, || async { Ok("two".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RateLimitExceeded { .. }));
        assert_eq!(envelope.breaker().failures(), 0);
    }

    #[tokio::test]
    async fn dropped_call_leaves_breaker_closed() {
        let mut cfg = config();
        cfg.max_failures = 1;
        let envelope = Resilience::new("asr", &cfg);

        for _ in 0..3 {
            let slow = envelope.call(None, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("late".to_string())
            });
            assert!(
                tokio::time::timeout(Duration::from_millis(10), slow)
                    .await
                    .is_err()
            );
        }
        assert_eq!(envelope.breaker().state(), CircuitState::Closed);
        assert_eq!(envelope.breaker().failures(), 0);

        let value = envelope
            .call(None, || async { Ok("fine".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fine");
    }

    #[tokio::test]
    async fn dropped_trial_admits_next_caller() {
        let mut cfg = config();
        cfg.max_failures = 1;
        cfg.retry_after = Duration::from_millis(20);
        let envelope = Resilience::new("asr", &cfg);
        let _ = envelope.call(None, || async { failing() }).await;
        assert_eq!(envelope.breaker().state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let trial = envelope.call(None, || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("late".to_string())
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(10), trial)
                .await
                .is_err()
        );
        assert_eq!(envelope.breaker().state(), CircuitState::Open);

        let value = envelope
            .call(None, || async { Ok("back".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "back");
        assert_eq!(envelope.breaker().state(), CircuitState::Closed);
    }
}
