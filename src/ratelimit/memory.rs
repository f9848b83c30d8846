//! In-process sliding window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::limiter::{
    namespaced, window_end, window_start, LimitConfig, Limiter, RateLimitDecision,
};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::sweep::Sweeper;

/// How often stale keys are evicted unless configured otherwise.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Sliding window limiter keeping per-key timestamps in process memory.
///
/// Suitable for single-instance deployments. Each key's record is guarded by
/// its map shard's lock for the whole prune/count/record sequence, so checks
/// on one key are linearizable while unrelated keys rarely contend.
pub struct MemoryLimiter {
    /// Shared with the sweeper through a weak reference
    windows: Arc<WindowTable>,
    /// Namespace prepended to every key
    prefix: String,
    /// Background eviction task, taken on stop
    sweeper: Mutex<Option<Sweeper>>,
}

/// Accepted-request timestamps per namespaced key.
struct WindowTable {
    entries: DashMap<String, Vec<DateTime<Utc>>>,
    config: LimitConfig,
    clock: Arc<dyn Clock>,
}

impl WindowTable {
    fn check(&self, full_key: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let window = self.config.window_delta();
        let cutoff = window_start(now, window);

        let mut timestamps = self.entries.entry(full_key.to_string()).or_default();
        timestamps.retain(|ts| *ts > cutoff);

        let reset_at = match timestamps.iter().min() {
            Some(oldest) => window_end(*oldest, window),
            None => window_end(now, window),
        };

        let max = self.config.max_requests as usize;
        if timestamps.len() >= max {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            };
        }

        timestamps.push(now);
        RateLimitDecision {
            allowed: true,
            remaining: (max - timestamps.len()) as u32,
            reset_at,
        }
    }

    fn live_count(&self, full_key: &str) -> usize {
        let cutoff = window_start(self.clock.now(), self.config.window_delta());
        self.entries
            .get(full_key)
            .map(|ts| ts.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0)
    }

    /// Drop expired timestamps and every key left with none.
    fn evict_stale(&self) {
        let cutoff = window_start(self.clock.now(), self.config.window_delta());
        let before = self.entries.len();

        self.entries.retain(|_, timestamps| {
            timestamps.retain(|ts| *ts > cutoff);
            !timestamps.is_empty()
        });

        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Evicted stale rate limit keys");
        }
    }
}

impl MemoryLimiter {
    /// Create a limiter using the system clock and the default sweep interval.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: LimitConfig, prefix: impl Into<String>) -> Self {
        Self::with_clock(config, prefix, Arc::new(SystemClock), DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a limiter with an explicit clock and sweep interval.
    pub fn with_clock(
        config: LimitConfig,
        prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
        sweep_interval: Duration,
    ) -> Self {
        let prefix = prefix.into();
        let windows = Arc::new(WindowTable {
            entries: DashMap::new(),
            config,
            clock,
        });

        let sweeper = Sweeper::spawn(
            "ratelimit-memory",
            sweep_interval,
            Arc::downgrade(&windows),
            WindowTable::evict_stale,
        );

        info!(
            prefix = %prefix,
            max_requests = config.max_requests,
            window_secs = config.window.as_secs(),
            "In-memory rate limiter initialized"
        );

        Self {
            windows,
            prefix,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Number of recorded requests for `key` still inside the window.
    pub fn attempt_count(&self, key: &str) -> usize {
        self.windows.live_count(&namespaced(&self.prefix, key))
    }

    /// Number of keys currently tracked.
    pub fn entry_count(&self) -> usize {
        self.windows.entries.len()
    }

    /// The namespace prepended to keys.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl Limiter for MemoryLimiter {
    async fn check(&self, key: &str) -> Result<RateLimitDecision> {
        let full_key = namespaced(&self.prefix, key);
        trace!(key = %full_key, "Checking in-memory rate limit");

        let decision = self.windows.check(&full_key);
        if !decision.allowed {
            debug!(key = %full_key, reset_at = %decision.reset_at, "Rate limit exceeded");
        }
        Ok(decision)
    }

    async fn clear(&self, key: &str) {
        self.windows.entries.remove(&namespaced(&self.prefix, key));
    }

    async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
    }

    fn config(&self) -> LimitConfig {
        self.windows.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.windows.clock.now()
    }
}

impl std::fmt::Debug for MemoryLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLimiter")
            .field("prefix", &self.prefix)
            .field("config", &self.windows.config)
            .field("entries", &self.windows.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeDelta;

    const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);

    fn test_limiter(max: u32, window: Duration, prefix: &str) -> (MemoryLimiter, ManualClock) {
        let clock = ManualClock::default();
        let limiter = MemoryLimiter::with_clock(
            LimitConfig::new(max, window),
            prefix,
            Arc::new(clock.clone()),
            DEFAULT_SWEEP_INTERVAL,
        );
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_then_denies() {
        let (limiter, clock) = test_limiter(5, FIFTEEN_MINUTES, "");
        let first = clock.now();

        for expected in [4, 3, 2, 1, 0] {
            let decision = limiter.check("user@example.com").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            clock.advance(TimeDelta::milliseconds(100));
        }

        let denied = limiter.check("user@example.com").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, first + TimeDelta::minutes(15));

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_window_slides() {
        let window = Duration::from_secs(60);
        let (limiter, clock) = test_limiter(3, window, "");

        for _ in 0..3 {
            assert!(limiter.check("k").await.unwrap().allowed);
        }
        assert!(!limiter.check("k").await.unwrap().allowed);

        clock.advance(TimeDelta::seconds(59));
        assert!(!limiter.check("k").await.unwrap().allowed);

        clock.advance(TimeDelta::seconds(1) + TimeDelta::milliseconds(1));
        assert!(limiter.check("k").await.unwrap().allowed);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_oldest_entry_expires_first() {
        let (limiter, clock) = test_limiter(2, Duration::from_secs(60), "");
        let first = clock.now();

        limiter.check("k").await.unwrap();
        clock.advance(TimeDelta::seconds(30));
        limiter.check("k").await.unwrap();

        let denied = limiter.check("k").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, first + TimeDelta::seconds(60));

        // Only the first entry has aged out.
        clock.advance(TimeDelta::seconds(31));
        let decision = limiter.check("k").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!limiter.check("k").await.unwrap().allowed);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_reset_for_fresh_key_is_now_plus_window() {
        let (limiter, clock) = test_limiter(5, FIFTEEN_MINUTES, "");
        let now = clock.now();

        let decision = limiter.check("fresh").await.unwrap();
        assert_eq!(decision.reset_at, now + TimeDelta::minutes(15));

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_remaining_is_monotonic() {
        let (limiter, _clock) = test_limiter(10, FIFTEEN_MINUTES, "");

        let mut previous = u32::MAX;
        for _ in 0..15 {
            let decision = limiter.check("k").await.unwrap();
            assert!(decision.remaining <= previous);
            previous = decision.remaining;
        }

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let (limiter, _clock) = test_limiter(2, FIFTEEN_MINUTES, "");

        limiter.check("a").await.unwrap();
        limiter.check("a").await.unwrap();
        assert!(!limiter.check("a").await.unwrap().allowed);

        let other = limiter.check("b").await.unwrap();
        assert!(other.allowed);
        assert_eq!(other.remaining, 1);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_clear_behaves_like_unseen_key() {
        let (limiter, _clock) = test_limiter(3, FIFTEEN_MINUTES, "login:email");

        for _ in 0..3 {
            limiter.check("a@b.com").await.unwrap();
        }
        assert!(!limiter.check("a@b.com").await.unwrap().allowed);

        limiter.clear("a@b.com").await;
        assert_eq!(limiter.attempt_count("a@b.com"), 0);

        let after_clear = limiter.check("a@b.com").await.unwrap();
        let unseen = limiter.check("never@seen.com").await.unwrap();
        assert_eq!(after_clear, unseen);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_attempt_and_entry_counts() {
        let (limiter, _clock) = test_limiter(10, FIFTEEN_MINUTES, "");

        assert_eq!(limiter.entry_count(), 0);
        limiter.check("a").await.unwrap();
        limiter.check("a").await.unwrap();
        limiter.check("b").await.unwrap();

        assert_eq!(limiter.attempt_count("a"), 2);
        assert_eq!(limiter.attempt_count("b"), 1);
        assert_eq!(limiter.attempt_count("c"), 0);
        assert_eq!(limiter.entry_count(), 2);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_prefix_namespaces_keys() {
        let (limiter, _clock) = test_limiter(5, FIFTEEN_MINUTES, "login:ip");
        assert_eq!(limiter.prefix(), "login:ip");

        limiter.check("1.2.3.4").await.unwrap();

        assert!(limiter.windows.entries.contains_key("login:ip:1.2.3.4"));
        assert!(!limiter.windows.entries.contains_key("1.2.3.4"));

        limiter.clear("1.2.3.4").await;
        assert_eq!(limiter.entry_count(), 0);

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_empty_prefix_uses_bare_key() {
        let (limiter, _clock) = test_limiter(5, FIFTEEN_MINUTES, "");

        limiter.check("1.2.3.4").await.unwrap();
        assert!(limiter.windows.entries.contains_key("1.2.3.4"));

        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_config_is_reported() {
        let (limiter, _clock) = test_limiter(7, Duration::from_secs(30), "");
        assert_eq!(limiter.config(), LimitConfig::new(7, Duration::from_secs(30)));
        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_stale_keys() {
        let clock = ManualClock::default();
        let limiter = MemoryLimiter::with_clock(
            LimitConfig::new(5, Duration::from_secs(60)),
            "",
            Arc::new(clock.clone()),
            Duration::from_secs(10),
        );

        limiter.check("one-off").await.unwrap();
        assert_eq!(limiter.entry_count(), 1);

        clock.advance(TimeDelta::seconds(61));
        limiter.check("active").await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(limiter.entry_count(), 1);
        assert_eq!(limiter.attempt_count("active"), 1);

        limiter.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(MemoryLimiter::new(
            LimitConfig::new(10, FIFTEEN_MINUTES),
            "concurrent",
        ));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("shared").await.unwrap().allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 10);
        limiter.stop().await;
    }
}
