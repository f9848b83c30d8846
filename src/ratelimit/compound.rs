//! Evaluating several limiters for one request.

use chrono::Utc;
use tracing::{debug, warn};

use super::limiter::{window_end, LimitConfig, Limiter, RateLimitDecision, RateLimitInfo};

/// One limiter to consult, the key to consult it with, and the limit to
/// report in headers.
#[derive(Clone, Copy)]
pub struct LimiterCheck<'a> {
    pub limiter: &'a dyn Limiter,
    pub key: &'a str,
    pub config: LimitConfig,
}

impl<'a> LimiterCheck<'a> {
    /// Check `key` against `limiter`, reporting the limiter's own config.
    pub fn new(limiter: &'a dyn Limiter, key: &'a str) -> Self {
        Self {
            limiter,
            key,
            config: limiter.config(),
        }
    }
}

/// Run a single check and attach the limit to the decision.
///
/// A backend error is treated as an allowance: limiting problems must not
/// take the protected endpoint down with them. The fallback window is
/// anchored at the limiter's own clock.
pub async fn check_with_config(limiter: &dyn Limiter, key: &str, config: LimitConfig) -> RateLimitInfo {
    let decision = match limiter.check(key).await {
        Ok(decision) => decision,
        Err(e) => {
            warn!(error = %e, key = %key, "Rate limit check failed, allowing request");
            RateLimitDecision {
                allowed: true,
                remaining: config.max_requests.saturating_sub(1),
                reset_at: window_end(limiter.now(), config.window_delta()),
            }
        }
    };
    RateLimitInfo::from_decision(decision, config)
}

/// Evaluate `checks` in order.
///
/// The first denial is returned immediately and later limiters are not
/// consulted. If every limiter allows, the result with the fewest remaining
/// requests is returned; ties go to the earlier check. An empty list allows
/// with a zero limit.
pub async fn compound_check(checks: &[LimiterCheck<'_>]) -> RateLimitInfo {
    let mut strictest: Option<RateLimitInfo> = None;

    for check in checks {
        let info = check_with_config(check.limiter, check.key, check.config).await;
        if !info.allowed {
            debug!(key = %check.key, "Compound rate limit denied");
            return info;
        }

        match strictest {
            Some(current) if current.remaining <= info.remaining => {}
            _ => strictest = Some(info),
        }
    }

    strictest.unwrap_or_else(|| RateLimitInfo {
        limit: 0,
        remaining: 0,
        reset_at: Utc::now(),
        allowed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::{GuardError, Result};
    use crate::ratelimit::MemoryLimiter;
    use crate::ratelimit::DEFAULT_SWEEP_INTERVAL;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Returns a fixed decision and counts how often it was asked.
    struct FixedLimiter {
        decision: RateLimitDecision,
        config: LimitConfig,
        calls: AtomicUsize,
    }

    impl FixedLimiter {
        fn new(allowed: bool, remaining: u32, reset_at: DateTime<Utc>) -> Self {
            Self {
                decision: RateLimitDecision {
                    allowed,
                    remaining,
                    reset_at,
                },
                config: LimitConfig::new(10, Duration::from_secs(60)),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Limiter for FixedLimiter {
        async fn check(&self, _key: &str) -> Result<RateLimitDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decision)
        }

        async fn clear(&self, _key: &str) {}

        async fn stop(&self) {}

        fn config(&self) -> LimitConfig {
            self.config
        }
    }

    struct BrokenLimiter;

    #[async_trait]
    impl Limiter for BrokenLimiter {
        async fn check(&self, _key: &str) -> Result<RateLimitDecision> {
            Err(GuardError::Config("broken".to_string()))
        }

        async fn clear(&self, _key: &str) {}

        async fn stop(&self) {}

        fn config(&self) -> LimitConfig {
            LimitConfig::new(3, Duration::from_secs(60))
        }

        fn now(&self) -> DateTime<Utc> {
            broken_now()
        }
    }

    fn broken_now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn test_strictest_allowance_wins() {
        let now = Utc::now();
        let a = FixedLimiter::new(true, 2, now);
        let b = FixedLimiter::new(true, 5, now);

        let info = compound_check(&[LimiterCheck::new(&b, "b"), LimiterCheck::new(&a, "a")]).await;
        assert!(info.allowed);
        assert_eq!(info.remaining, 2);

        let info = compound_check(&[LimiterCheck::new(&a, "a"), LimiterCheck::new(&b, "b")]).await;
        assert_eq!(info.remaining, 2);
    }

    #[tokio::test]
    async fn test_tie_goes_to_first() {
        let first_reset = Utc::now();
        let a = FixedLimiter::new(true, 3, first_reset);
        let b = FixedLimiter::new(true, 3, first_reset + TimeDelta::minutes(5));

        let info = compound_check(&[LimiterCheck::new(&a, "a"), LimiterCheck::new(&b, "b")]).await;
        assert_eq!(info.reset_at, first_reset);
    }

    #[tokio::test]
    async fn test_denial_wins_regardless_of_order() {
        let now = Utc::now();
        let allow = FixedLimiter::new(true, 5, now);
        let deny = FixedLimiter::new(false, 0, now + TimeDelta::minutes(1));

        let info = compound_check(&[LimiterCheck::new(&allow, "x"), LimiterCheck::new(&deny, "y")]).await;
        assert!(!info.allowed);
        assert_eq!(info.remaining, 0);

        let info = compound_check(&[LimiterCheck::new(&deny, "y"), LimiterCheck::new(&allow, "x")]).await;
        assert!(!info.allowed);
    }

    #[tokio::test]
    async fn test_first_denial_short_circuits() {
        let now = Utc::now();
        let deny = FixedLimiter::new(false, 0, now);
        let later = FixedLimiter::new(true, 5, now);

        compound_check(&[LimiterCheck::new(&deny, "y"), LimiterCheck::new(&later, "x")]).await;

        assert_eq!(deny.calls(), 1);
        assert_eq!(later.calls(), 0);
    }

    #[tokio::test]
    async fn test_explicit_config_is_reported() {
        let limiter = FixedLimiter::new(true, 1, Utc::now());
        let check = LimiterCheck {
            limiter: &limiter,
            key: "k",
            config: LimitConfig::new(42, Duration::from_secs(1)),
        };

        let info = compound_check(&[check]).await;
        assert_eq!(info.limit, 42);
    }

    #[tokio::test]
    async fn test_empty_list_allows() {
        let info = compound_check(&[]).await;
        assert!(info.allowed);
        assert_eq!(info.limit, 0);
        assert_eq!(info.remaining, 0);
    }

    #[tokio::test]
    async fn test_backend_error_allows() {
        let info = check_with_config(&BrokenLimiter, "k", BrokenLimiter.config()).await;
        assert!(info.allowed);
        assert_eq!(info.limit, 3);
        assert_eq!(info.remaining, 2);
    }

    #[tokio::test]
    async fn test_backend_error_resets_from_limiter_clock() {
        let info = check_with_config(&BrokenLimiter, "k", BrokenLimiter.config()).await;
        assert_eq!(info.reset_at, broken_now() + TimeDelta::seconds(60));

        let clock = Arc::new(ManualClock::default());
        let limiter = MemoryLimiter::with_clock(
            LimitConfig::new(1, Duration::from_secs(60)),
            "",
            clock.clone(),
            DEFAULT_SWEEP_INTERVAL,
        );
        clock.advance(TimeDelta::hours(3));
        assert_eq!(limiter.now(), clock.now());
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_email_and_ip_limits_combine() {
        let clock = Arc::new(ManualClock::default());
        let email = MemoryLimiter::with_clock(
            LimitConfig::new(2, Duration::from_secs(900)),
            "login:email",
            clock.clone(),
            DEFAULT_SWEEP_INTERVAL,
        );
        let ip = MemoryLimiter::with_clock(
            LimitConfig::new(20, Duration::from_secs(900)),
            "login:ip",
            clock.clone(),
            DEFAULT_SWEEP_INTERVAL,
        );
        let checks = [
            LimiterCheck::new(&email, "user@example.com"),
            LimiterCheck::new(&ip, "10.0.0.1"),
        ];

        let first = compound_check(&checks).await;
        assert_eq!((first.limit, first.remaining), (2, 1));

        let second = compound_check(&checks).await;
        assert_eq!((second.limit, second.remaining), (2, 0));

        let third = compound_check(&checks).await;
        assert!(!third.allowed);
        // The denied email check stopped evaluation before the IP limiter.
        assert_eq!(ip.attempt_count("10.0.0.1"), 2);

        email.stop().await;
        ip.stop().await;
    }
}
