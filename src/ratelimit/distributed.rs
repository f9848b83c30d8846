//! Distributed rate limiter backed by a shared store.
//!
//! This module provides a sliding window limiter whose state lives in a
//! store shared by every service instance, so all instances enforce one
//! global limit. The prune/count/record sequence runs as a single atomic
//! operation inside the store; there is no client-side lock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use super::limiter::{namespaced, window_end, LimitConfig, Limiter, RateLimitDecision};
use super::redis_store::RedisStore;
use crate::clock::{Clock, SystemClock};
use crate::config::RedisSettings;
use crate::error::Result;

/// Prefix used when the caller does not supply one.
pub const DEFAULT_PREFIX: &str = "ratelimit";

/// Raw result of the store's sliding window operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    /// Whether the request was admitted and recorded
    pub allowed: bool,
    /// `max_requests - count` (minus one when admitted); may be negative
    pub remaining: i64,
    /// Reset instant in Unix nanoseconds
    pub reset_at_nanos: i64,
}

/// A shared store able to run the sliding window atomically.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Prune entries at or before `now_nanos - window_nanos`, count the rest
    /// and, if fewer than `max_requests`, insert `member` scored at
    /// `now_nanos`. All in one atomic step.
    async fn check_and_record(
        &self,
        key: &str,
        now_nanos: i64,
        window_nanos: i64,
        max_requests: i64,
        member: &str,
    ) -> Result<ScriptReply>;

    /// Remove every entry for `key`.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Release the connection.
    async fn close(&self);
}

/// A sliding window limiter whose state lives in a [`WindowStore`].
///
/// If the store fails at request time the limiter fails open: the request
/// is allowed and a `RATE LIMITING DEGRADED` warning is logged.
pub struct DistributedLimiter {
    /// The shared store
    store: Arc<dyn WindowStore>,
    /// Limit enforced for every key
    config: LimitConfig,
    /// Namespace prepended to every key
    prefix: String,
    /// Source of `now`
    clock: Arc<dyn Clock>,
}

impl DistributedLimiter {
    /// Connect to Redis at `url` and verify it answers before returning.
    ///
    /// Fails if the URL is empty or malformed, or if the store does not
    /// respond within the configured connect timeout.
    pub async fn connect(
        config: LimitConfig,
        prefix: impl Into<String>,
        url: &str,
        settings: &RedisSettings,
    ) -> Result<Self> {
        let store = RedisStore::connect(
            url,
            settings.connect_timeout(),
            settings.command_timeout(),
        )
        .await?;

        Ok(Self::with_store(
            config,
            prefix,
            Arc::new(store),
            Arc::new(SystemClock),
        ))
    }

    /// Build a limiter around an already connected store.
    pub fn with_store(
        config: LimitConfig,
        prefix: impl Into<String>,
        store: Arc<dyn WindowStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut prefix = prefix.into();
        if prefix.is_empty() {
            prefix = DEFAULT_PREFIX.to_string();
        }

        info!(
            prefix = %prefix,
            max_requests = config.max_requests,
            window_secs = config.window.as_secs(),
            "Distributed rate limiter initialized"
        );

        Self {
            store,
            config,
            prefix,
            clock,
        }
    }

    /// The namespace prepended to keys.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The answer given while the store is unavailable.
    fn fail_open(&self, now: DateTime<Utc>) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            remaining: self.config.max_requests.saturating_sub(1),
            reset_at: window_end(now, self.config.window_delta()),
        }
    }
}

#[async_trait]
impl Limiter for DistributedLimiter {
    async fn check(&self, key: &str) -> Result<RateLimitDecision> {
        let now = self.clock.now();
        let full_key = namespaced(&self.prefix, key);

        let now_nanos = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let window_nanos = i64::try_from(self.config.window.as_nanos()).unwrap_or(i64::MAX);
        let member = format!("{}-{}", now_nanos, Uuid::new_v4());

        trace!(key = %full_key, "Checking distributed rate limit");

        let reply = match self
            .store
            .check_and_record(
                &full_key,
                now_nanos,
                window_nanos,
                i64::from(self.config.max_requests),
                &member,
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    error = %e,
                    key = %key,
                    prefix = %self.prefix,
                    "RATE LIMITING DEGRADED: shared store unavailable, allowing request without \
                     rate limit check. Rate limiting is effectively disabled until the store \
                     recovers. Consider RATE_LIMIT_BACKEND=memory as a fallback."
                );
                return Ok(self.fail_open(now));
            }
        };

        let remaining = reply.remaining.clamp(0, i64::from(u32::MAX)) as u32;
        Ok(RateLimitDecision {
            allowed: reply.allowed,
            remaining,
            reset_at: DateTime::<Utc>::from_timestamp_nanos(reply.reset_at_nanos),
        })
    }

    async fn clear(&self, key: &str) {
        let full_key = namespaced(&self.prefix, key);
        if let Err(e) = self.store.delete(&full_key).await {
            error!(error = %e, key = %key, prefix = %self.prefix, "Rate limit clear failed");
        }
    }

    async fn stop(&self) {
        self.store.close().await;
    }

    fn config(&self) -> LimitConfig {
        self.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl std::fmt::Debug for DistributedLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLimiter")
            .field("prefix", &self.prefix)
            .field("config", &self.config)
            .finish()
    }
}
