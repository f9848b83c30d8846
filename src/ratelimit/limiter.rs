//! The contract every rate limiting backend implements.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{GuardError, Result};

/// Default number of requests allowed per window.
const DEFAULT_MAX_REQUESTS: u32 = 5;
/// Default sliding window length.
const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// A sliding window rate limiter.
///
/// Implementations must be safe to share between tasks. For a single key,
/// concurrent `check` calls observe a linear history of their own
/// increments: two callers can never both be admitted past the limit.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Evaluate `key` against the limit and, if allowed, record one unit of
    /// consumption in the same atomic step.
    ///
    /// Transient backend trouble is absorbed by the backend (see
    /// `DistributedLimiter`); callers are not expected to deny on `Err`.
    async fn check(&self, key: &str) -> Result<RateLimitDecision>;

    /// Forget all consumption recorded for `key`.
    async fn clear(&self, key: &str);

    /// Release background resources. Call once; the limiter must not be used
    /// afterwards.
    async fn stop(&self);

    /// The limit this limiter enforces.
    fn config(&self) -> LimitConfig;

    /// Current time as this limiter sees it.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Configuration for a sliding window limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Maximum requests admitted within any one window
    pub max_requests: u32,
    /// Length of the sliding window
    pub window: Duration,
}

impl LimitConfig {
    /// Create a new limit configuration.
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Reject limits that could never admit anything.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(GuardError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(GuardError::Config(
                "window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The window as a signed chrono duration, saturating on overflow.
    pub(crate) fn window_delta(&self) -> TimeDelta {
        to_delta(self.window)
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

/// The outcome of a single `Limiter::check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request was admitted (and recorded)
    pub allowed: bool,
    /// Requests left in the current window, never negative
    pub remaining: u32,
    /// When a denied key is expected to be admitted again
    pub reset_at: DateTime<Utc>,
}

/// Everything needed to render rate limit headers for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Maximum requests allowed in the window
    pub limit: u32,
    /// Requests remaining in the current window
    pub remaining: u32,
    /// When the window resets
    pub reset_at: DateTime<Utc>,
    /// Whether the request was allowed
    pub allowed: bool,
}

impl RateLimitInfo {
    /// Combine a decision with the limit it was made against.
    pub fn from_decision(decision: RateLimitDecision, config: LimitConfig) -> Self {
        Self {
            limit: config.max_requests,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
            allowed: decision.allowed,
        }
    }

    /// Seconds until the window resets, never less than 1 so it is always a
    /// valid `Retry-After` value.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_secs_at(Utc::now())
    }

    /// Same as [`retry_after_secs`](Self::retry_after_secs) against an explicit `now`.
    pub fn retry_after_secs_at(&self, now: DateTime<Utc>) -> u64 {
        seconds_until(self.reset_at, now).max(1)
    }
}

/// Join a namespace prefix and a key with `:`. An empty prefix leaves the key
/// untouched.
pub(crate) fn namespaced(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", prefix, key)
    }
}

/// Convert a std duration to chrono, saturating instead of failing.
pub(crate) fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// `now - window`, clamped to the earliest representable instant.
pub(crate) fn window_start(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `at + window`, clamped to the latest representable instant.
pub(crate) fn window_end(at: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(window)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whole seconds from `now` until `at`, truncated, zero if `at` has passed.
pub(crate) fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (at - now).num_seconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_resetting_at(reset_at: DateTime<Utc>) -> RateLimitInfo {
        RateLimitInfo {
            limit: 5,
            remaining: 0,
            reset_at,
            allowed: false,
        }
    }

    #[test]
    fn test_default_config() {
        let config = LimitConfig::default();
        assert_eq!(config.max_requests, 5);
        assert_eq!(config.window, Duration::from_secs(900));
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let config = LimitConfig::new(0, Duration::from_secs(60));
        assert!(matches!(config.validate(), Err(GuardError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = LimitConfig::new(10, Duration::ZERO);
        assert!(matches!(config.validate(), Err(GuardError::Config(_))));
    }

    #[test]
    fn test_validate_accepts_sane_config() {
        assert!(LimitConfig::new(10, Duration::from_secs(60)).validate().is_ok());
    }

    #[test]
    fn test_retry_after_in_future() {
        let now = Utc::now();
        let info = info_resetting_at(now + TimeDelta::seconds(90));
        assert_eq!(info.retry_after_secs_at(now), 90);
    }

    #[test]
    fn test_retry_after_minimum_is_one() {
        let now = Utc::now();

        let past = info_resetting_at(now - TimeDelta::seconds(30));
        assert_eq!(past.retry_after_secs_at(now), 1);

        let sub_second = info_resetting_at(now + TimeDelta::milliseconds(400));
        assert_eq!(sub_second.retry_after_secs_at(now), 1);
    }

    #[test]
    fn test_namespaced_keys() {
        assert_eq!(namespaced("login:ip", "1.2.3.4"), "login:ip:1.2.3.4");
        assert_eq!(namespaced("", "1.2.3.4"), "1.2.3.4");
    }

    #[test]
    fn test_window_math_saturates() {
        let now = Utc::now();
        let huge = to_delta(Duration::from_secs(u64::MAX));

        assert_eq!(window_start(now, huge), DateTime::<Utc>::MIN_UTC);
        assert_eq!(window_end(now, huge), DateTime::<Utc>::MAX_UTC);
    }
}
