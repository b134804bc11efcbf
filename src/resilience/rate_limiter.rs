//! Sliding-window admission control.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sync::lock;

/// Admits at most `max_requests` calls in any `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests.min(1024))),
        }
    }

    /// Record and admit a request, or refuse it if the window is full.
    pub fn allow_request(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = lock(&self.timestamps);

        while let Some(&oldest) = timestamps.front() {
            if now.duration_since(oldest) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.max_requests {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Requests recorded in the current window (including stale ones not yet purged).
    pub fn in_flight(&self) -> usize {
        lock(&self.timestamps).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_the_request_past_the_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.allow_request());
        assert!(limiter.allow_request());
        assert!(limiter.allow_request());
        assert!(!limiter.allow_request());
        assert_eq!(limiter.in_flight(), 3);
    }

    #[test]
    fn admits_again_after_the_window_passes() {
        let limiter = RateLimiter::new(2, Duration::from_millis(30));
        assert!(limiter.allow_request());
        assert!(limiter.allow_request());
        assert!(!limiter.allow_request());

        std::thread::sleep(Duration::from_millis(45));
        assert!(limiter.allow_request());
        assert!(limiter.allow_request());
        assert!(!limiter.allow_request());
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert!(!limiter.allow_request());
    }
}
