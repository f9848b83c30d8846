//! Backend selection between the in-process and distributed limiters.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::distributed::DistributedLimiter;
use super::limiter::{LimitConfig, Limiter, RateLimitDecision};
use super::memory::MemoryLimiter;
use crate::clock::SystemClock;
use crate::config::{BackendKind, GuardSettings};
use crate::error::Result;

/// A limiter of either kind behind the single [`Limiter`] contract.
#[derive(Debug)]
pub enum Backend {
    /// Process-local sliding windows
    Memory(MemoryLimiter),
    /// Sliding windows shared by every instance through the store
    Distributed(DistributedLimiter),
}

impl Backend {
    /// Which kind of backend this is.
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Memory(_) => BackendKind::Memory,
            Backend::Distributed(_) => BackendKind::Distributed,
        }
    }

    /// The namespace prepended to keys.
    pub fn prefix(&self) -> &str {
        match self {
            Backend::Memory(limiter) => limiter.prefix(),
            Backend::Distributed(limiter) => limiter.prefix(),
        }
    }
}

#[async_trait]
impl Limiter for Backend {
    async fn check(&self, key: &str) -> Result<RateLimitDecision> {
        match self {
            Backend::Memory(limiter) => limiter.check(key).await,
            Backend::Distributed(limiter) => limiter.check(key).await,
        }
    }

    async fn clear(&self, key: &str) {
        match self {
            Backend::Memory(limiter) => limiter.clear(key).await,
            Backend::Distributed(limiter) => limiter.clear(key).await,
        }
    }

    async fn stop(&self) {
        match self {
            Backend::Memory(limiter) => limiter.stop().await,
            Backend::Distributed(limiter) => limiter.stop().await,
        }
    }

    fn config(&self) -> LimitConfig {
        match self {
            Backend::Memory(limiter) => limiter.config(),
            Backend::Distributed(limiter) => limiter.config(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        match self {
            Backend::Memory(limiter) => limiter.now(),
            Backend::Distributed(limiter) => limiter.now(),
        }
    }
}

/// Build the limiter the deployment asks for.
///
/// A distributed backend that cannot be constructed (missing or malformed
/// URL, unreachable store) is replaced by an in-process one with a warning;
/// startup never fails here.
pub async fn select_backend(
    config: LimitConfig,
    prefix: &str,
    settings: &GuardSettings,
) -> Backend {
    if settings.rate_limit_backend == BackendKind::Distributed {
        match settings.redis_url.as_deref() {
            Some(url) => {
                match DistributedLimiter::connect(config, prefix, url, &settings.redis).await {
                    Ok(limiter) => return Backend::Distributed(limiter),
                    Err(e) => warn!(
                        error = %e,
                        prefix = %prefix,
                        "Failed to create distributed rate limiter, falling back to in-memory"
                    ),
                }
            }
            None => warn!(
                prefix = %prefix,
                "Distributed rate limiting requested but REDIS_URL is not set, falling back to in-memory"
            ),
        }
    }

    info!(prefix = %prefix, "Using in-memory rate limiter");
    Backend::Memory(MemoryLimiter::with_clock(
        config,
        prefix,
        Arc::new(SystemClock),
        settings.sweep_interval(),
    ))
}
