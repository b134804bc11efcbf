//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

const ENV_MAX_WORKERS: &str = "VOICE_DISPATCH_MAX_WORKERS";
const ENV_MAX_TASKS_PER_CLIENT: &str = "VOICE_DISPATCH_MAX_TASKS_PER_CLIENT";

/// Sizing of the shared work pool.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// Number of worker loops (the concurrency slot count).
    pub max_workers: usize,
    /// Queue slots reserved per client, per worker.
    pub max_tasks_per_client: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            max_tasks_per_client: 20,
        }
    }
}

impl ResourceConfig {
    /// Queue capacity derived from the pool sizing.
    pub fn queue_size(&self) -> usize {
        self.max_tasks_per_client * self.max_workers
    }

    /// Load from environment variables, falling back to defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_workers: env_usize(ENV_MAX_WORKERS, defaults.max_workers)?,
            max_tasks_per_client: env_usize(
                ENV_MAX_TASKS_PER_CLIENT,
                defaults.max_tasks_per_client,
            )?,
        })
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_positive(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<usize, ConfigError> {
    let value: usize = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?} is not a number: {e}"),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// Work pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker loops.
    pub workers: usize,
    /// Maximum number of queued items.
    pub queue_capacity: usize,
    /// How long a worker blocks on an empty queue before re-checking stop.
    pub pop_timeout: Duration,
    /// Backoff step per retry (linear).
    pub retry_base: Duration,
    /// Upper bound on a single backoff sleep.
    pub retry_cap: Duration,
    /// Exhausted items kept for inspection.
    pub dead_letter_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        ResourceConfig::default().into()
    }
}

impl From<ResourceConfig> for PoolConfig {
    fn from(resources: ResourceConfig) -> Self {
        Self {
            workers: resources.max_workers,
            queue_capacity: resources.queue_size(),
            pop_timeout: Duration::from_secs(5),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(60),
            dead_letter_capacity: 256,
        }
    }
}

impl PoolConfig {
    /// Backoff before retry number `retries` (1-based): `min(retries * base, cap)`.
    pub fn backoff(&self, retries: u32) -> Duration {
        self.retry_base
            .checked_mul(retries)
            .map_or(self.retry_cap, |d| d.min(self.retry_cap))
    }
}

/// Deferred-task ticker configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often pending scheduled tasks are scanned.
    pub tick_interval: Duration,
    /// Idle default-tier clients with no usage today are dropped after this long.
    pub idle_client_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            idle_client_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Per-provider resilience envelope settings.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,
    /// Cooldown before a half-open trial.
    pub retry_after: Duration,
    /// Requests admitted per window.
    pub max_requests: usize,
    /// Sliding window length.
    pub window: Duration,
    /// Response cache entry lifetime.
    pub cache_ttl: Duration,
    /// Maximum cached responses.
    pub cache_capacity: usize,
    /// Maximum concurrent connections to the upstream.
    pub max_connections: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            retry_after: Duration::from_secs(30),
            max_requests: 10,
            window: Duration::from_secs(1),
            cache_ttl: Duration::from_secs(300), // 5 minutes
            cache_capacity: 1000,
            max_connections: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queue_size() {
        assert_eq!(ResourceConfig::default().queue_size(), 160);
        assert_eq!(PoolConfig::default().queue_capacity, 160);
        assert_eq!(PoolConfig::default().workers, 8);
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let config = PoolConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(3), Duration::from_secs(3));
        assert_eq!(config.backoff(61), Duration::from_secs(60));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn parse_rejects_zero_and_garbage() {
        assert_eq!(parse_positive("K", " 12 ").unwrap(), 12);
        assert!(matches!(
            parse_positive("K", "0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_positive("K", "eight"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
