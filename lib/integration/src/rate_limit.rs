//! Rate limiting for outbound integration calls.
//!
//! Respects external API constraints by limiting request rates per provider
//! over a sliding window.

use crate::error::ConnectorError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Window duration in seconds.
    pub window_seconds: u32,
}

impl RateLimitConfig {
    #[must_use]
    pub fn new(max_requests: u32, window_seconds: u32) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    #[must_use]
    pub fn per_second(max_requests: u32) -> Self {
        Self::new(max_requests, 1)
    }

    #[must_use]
    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, 60)
    }

    fn window(&self) -> Duration {
        Duration::seconds(i64::from(self.window_seconds))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed.
    Allowed { remaining: u32 },
    /// Rate limit exceeded.
    Exceeded { retry_after: Duration },
}

impl RateLimitResult {
    /// Returns true if the request is allowed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Returns the number of remaining requests (0 if exceeded).
    #[must_use]
    pub fn remaining(&self) -> u32 {
        match self {
            Self::Allowed { remaining } => *remaining,
            Self::Exceeded { .. } => 0,
        }
    }

    /// Converts an exceeded result into a retryable connector error.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::RateLimited`] if the limit was exceeded.
    pub fn into_result(self) -> Result<(), ConnectorError> {
        match self {
            Self::Allowed { .. } => Ok(()),
            Self::Exceeded { retry_after } => Err(ConnectorError::RateLimited {
                retry_after_secs: u64::try_from(retry_after.num_seconds().max(1)).ok(),
            }),
        }
    }
}

/// A sliding-window rate limiter keyed by provider.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    default: RateLimitConfig,
    overrides: Arc<HashMap<String, RateLimitConfig>>,
    /// Request timestamps within the current window, per key.
    state: Arc<Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>>,
}

impl RateLimiter {
    /// Creates a limiter applying `default` to every key.
    #[must_use]
    pub fn new(default: RateLimitConfig) -> Self {
        Self {
            default,
            overrides: Arc::new(HashMap::new()),
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a limiter with the published limits of the built-in providers.
    #[must_use]
    pub fn with_provider_defaults() -> Self {
        Self::new(RateLimitConfig::per_minute(120))
            .with_limit("slack", RateLimitConfig::per_minute(50))
            .with_limit("github", RateLimitConfig::per_minute(80))
            .with_limit("notion", RateLimitConfig::per_second(3))
            .with_limit("openai", RateLimitConfig::per_minute(60))
            .with_limit("twilio", RateLimitConfig::per_second(1))
    }

    /// Sets a specific limit for `key`.
    #[must_use]
    pub fn with_limit(mut self, key: impl Into<String>, config: RateLimitConfig) -> Self {
        Arc::make_mut(&mut self.overrides).insert(key.into(), config);
        self
    }

    /// Returns the limit that applies to `key`.
    #[must_use]
    pub fn config_for(&self, key: &str) -> RateLimitConfig {
        self.overrides.get(key).copied().unwrap_or(self.default)
    }

    /// Checks if a request is allowed for `key` and records it if so.
    pub fn check_and_increment(&self, key: &str) -> RateLimitResult {
        self.check_and_increment_at(key, Utc::now())
    }

    /// Like [`RateLimiter::check_and_increment`] at an explicit instant.
    pub fn check_and_increment_at(&self, key: &str, now: DateTime<Utc>) -> RateLimitResult {
        let config = self.config_for(key);
        let window = config.window();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let stamps = state.entry(key.to_string()).or_default();

        while stamps.front().is_some_and(|&t| now - t >= window) {
            stamps.pop_front();
        }

        let used = u32::try_from(stamps.len()).unwrap_or(u32::MAX);
        if used >= config.max_requests {
            let retry_after = stamps
                .front()
                .map_or(window, |&oldest| oldest + window - now);
            return RateLimitResult::Exceeded { retry_after };
        }

        stamps.push_back(now);
        RateLimitResult::Allowed {
            remaining: config.max_requests - used - 1,
        }
    }

    /// Records a request for `key`, failing if the budget is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::RateLimited`] when over budget.
    pub fn acquire(&self, key: &str) -> Result<(), ConnectorError> {
        self.check_and_increment(key).into_result()
    }

    /// Forgets all recorded requests for `key`.
    pub fn reset(&self, key: &str) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_provider_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_under_limit() {
        let limiter = RateLimiter::new(RateLimitConfig::new(10, 60));
        for i in 0..10 {
            let result = limiter.check_and_increment("test");
            assert!(result.is_allowed());
            assert_eq!(result.remaining(), 10 - i - 1);
        }
    }

    #[test]
    fn blocks_over_limit() {
        let limiter = RateLimiter::new(RateLimitConfig::new(5, 60));
        for _ in 0..5 {
            assert!(limiter.check_and_increment("test").is_allowed());
        }
        let result = limiter.check_and_increment("test");
        assert!(!result.is_allowed());
        assert!(matches!(
            limiter.acquire("test"),
            Err(ConnectorError::RateLimited { .. })
        ));
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new(RateLimitConfig::new(2, 10));
        let start = Utc::now();
        assert!(limiter.check_and_increment_at("k", start).is_allowed());
        assert!(limiter.check_and_increment_at("k", start + Duration::seconds(5)).is_allowed());
        assert!(!limiter.check_and_increment_at("k", start + Duration::seconds(6)).is_allowed());
        // The first request has aged out; the second has not.
        assert!(limiter.check_and_increment_at("k", start + Duration::seconds(10)).is_allowed());
        assert!(!limiter.check_and_increment_at("k", start + Duration::seconds(11)).is_allowed());
    }

    #[test]
    fn per_key_isolation_and_overrides() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, 60))
            .with_limit("wide", RateLimitConfig::new(3, 60));
        assert!(limiter.check_and_increment("a").is_allowed());
        assert!(!limiter.check_and_increment("a").is_allowed());
        assert!(limiter.check_and_increment("b").is_allowed());
        for _ in 0..3 {
            assert!(limiter.check_and_increment("wide").is_allowed());
        }
    }

    #[test]
    fn reset_clears_key() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, 60));
        limiter.check_and_increment("test");
        assert!(!limiter.check_and_increment("test").is_allowed());
        limiter.reset("test");
        assert!(limiter.check_and_increment("test").is_allowed());
    }

    #[test]
    fn clones_share_state() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, 60));
        let clone = limiter.clone();
        assert!(limiter.check_and_increment("x").is_allowed());
        assert!(!clone.check_and_increment("x").is_allowed());
    }
}
