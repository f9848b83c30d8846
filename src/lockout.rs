//! Account lockout after repeated authentication failures.
//!
//! This is separate from rate limiting: a limiter controls how often a key
//! may be tried, while the lockout tracker counts *failures* per identifier
//! and blocks the identifier outright once a threshold is reached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{GuardError, Result};
use crate::ratelimit::limiter::{namespaced, seconds_until, to_delta, window_end, window_start};
use crate::ratelimit::DEFAULT_SWEEP_INTERVAL;
use crate::sweep::Sweeper;

/// Account lockout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutConfig {
    /// Failures within `failure_window` that trigger a lock
    pub max_failures: u32,
    /// How long a lock lasts
    pub lockout_duration: Duration,
    /// Failures older than this never count toward the threshold
    pub failure_window: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            lockout_duration: Duration::from_secs(15 * 60),
            failure_window: Duration::from_secs(15 * 60),
        }
    }
}

impl LockoutConfig {
    /// Reject policies that could never lock or never unlock.
    pub fn validate(&self) -> Result<()> {
        if self.max_failures == 0 {
            return Err(GuardError::Config(
                "max_failures must be greater than zero".to_string(),
            ));
        }
        if self.lockout_duration.is_zero() || self.failure_window.is_zero() {
            return Err(GuardError::Config(
                "lockout_duration and failure_window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// The lockout state of one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStatus {
    /// Whether the identifier is currently locked
    pub locked: bool,
    /// Failures counted toward the threshold
    pub failure_count: u32,
    /// The threshold
    pub max_failures: u32,
    /// When the lock expires; only set while locked
    pub locked_until: Option<DateTime<Utc>>,
    /// Failures left before a lock
    pub remaining_attempts: u32,
}

impl LockoutStatus {
    /// Seconds until the identifier unlocks: 0 if not locked, otherwise at
    /// least 1.
    pub fn seconds_until_unlock(&self) -> u64 {
        self.seconds_until_unlock_at(Utc::now())
    }

    /// Same as [`seconds_until_unlock`](Self::seconds_until_unlock) against an explicit `now`.
    pub fn seconds_until_unlock_at(&self, now: DateTime<Utc>) -> u64 {
        match (self.locked, self.locked_until) {
            (true, Some(until)) => seconds_until(until, now).max(1),
            _ => 0,
        }
    }
}

/// Failures and lock for one identifier.
#[derive(Debug, Default)]
struct LockoutEntry {
    failures: Vec<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
}

impl LockoutEntry {
    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

struct LockoutTable {
    entries: RwLock<HashMap<String, LockoutEntry>>,
    config: LockoutConfig,
    clock: Arc<dyn Clock>,
}

impl LockoutTable {
    fn locked_status(&self, entry: &LockoutEntry) -> LockoutStatus {
        LockoutStatus {
            locked: true,
            failure_count: entry.failures.len() as u32,
            max_failures: self.config.max_failures,
            locked_until: entry.locked_until,
            remaining_attempts: 0,
        }
    }

    fn open_status(&self, failure_count: u32) -> LockoutStatus {
        LockoutStatus {
            locked: false,
            failure_count,
            max_failures: self.config.max_failures,
            locked_until: None,
            remaining_attempts: self.config.max_failures.saturating_sub(failure_count),
        }
    }

    fn check(&self, full_key: &str) -> LockoutStatus {
        let now = self.clock.now();
        let entries = self.entries.read();

        let Some(entry) = entries.get(full_key) else {
            return self.open_status(0);
        };

        if entry.is_locked(now) {
            return self.locked_status(entry);
        }

        let cutoff = window_start(now, to_delta(self.config.failure_window));
        let failure_count = entry.failures.iter().filter(|ts| **ts > cutoff).count();
        self.open_status(failure_count as u32)
    }

    fn record_failure(&self, full_key: &str) -> LockoutStatus {
        let now = self.clock.now();
        let (status, newly_locked) = {
            let mut entries = self.entries.write();
            let entry = entries.entry(full_key.to_string()).or_default();

            // Failures are frozen while locked.
            if entry.is_locked(now) {
                return self.locked_status(entry);
            }

            let cutoff = window_start(now, to_delta(self.config.failure_window));
            entry.failures.retain(|ts| *ts > cutoff);
            entry.failures.push(now);

            let failure_count = entry.failures.len() as u32;
            if failure_count >= self.config.max_failures {
                entry.locked_until =
                    Some(window_end(now, to_delta(self.config.lockout_duration)));
                (self.locked_status(entry), true)
            } else {
                (self.open_status(failure_count), false)
            }
        };

        // Logged after the map lock is released.
        if newly_locked {
            if let Some(until) = status.locked_until {
                warn!(
                    identifier = %full_key,
                    failures = status.failure_count,
                    locked_until = %until,
                    "Account locked after repeated failures"
                );
            }
        }

        status
    }

    /// Drop identifiers that are unlocked and have no failures in the window.
    fn evict_stale(&self) {
        let now = self.clock.now();
        let cutoff = window_start(now, to_delta(self.config.failure_window));
        let (evicted, remaining) = {
            let mut entries = self.entries.write();
            let before = entries.len();

            entries.retain(|_, entry| {
                if entry.is_locked(now) {
                    return true;
                }
                entry.failures.retain(|ts| *ts > cutoff);
                !entry.failures.is_empty()
            });

            (before.saturating_sub(entries.len()), entries.len())
        };

        if evicted > 0 {
            debug!(evicted, remaining, "Evicted stale lockout entries");
        }
    }
}

/// Tracks authentication failures per identifier and locks identifiers that
/// fail too often.
///
/// Call [`check`](Self::check) *before* verifying credentials so a locked
/// identifier never reaches verification, then report the outcome with
/// [`record_failure`](Self::record_failure) or
/// [`record_success`](Self::record_success).
pub struct AccountLockout {
    table: Arc<LockoutTable>,
    prefix: String,
    sweeper: Mutex<Option<Sweeper>>,
}

impl AccountLockout {
    /// Create a tracker using the system clock and default sweep interval.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: LockoutConfig, prefix: impl Into<String>) -> Self {
        Self::with_clock(config, prefix, Arc::new(SystemClock), DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a tracker with an explicit clock and sweep interval.
    pub fn with_clock(
        config: LockoutConfig,
        prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
        sweep_interval: Duration,
    ) -> Self {
        let prefix = prefix.into();
        let table = Arc::new(LockoutTable {
            entries: RwLock::new(HashMap::new()),
            config,
            clock,
        });

        let sweeper = Sweeper::spawn(
            "lockout",
            sweep_interval,
            Arc::downgrade(&table),
            LockoutTable::evict_stale,
        );

        info!(
            prefix = %prefix,
            max_failures = config.max_failures,
            lockout_secs = config.lockout_duration.as_secs(),
            failure_window_secs = config.failure_window.as_secs(),
            "Account lockout initialized"
        );

        Self {
            table,
            prefix,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Current status of `identifier`. Read-only.
    pub fn check(&self, identifier: &str) -> LockoutStatus {
        self.table.check(&namespaced(&self.prefix, identifier))
    }

    /// Record one failed attempt.
    ///
    /// While locked this returns the lock unchanged: the lock is not extended
    /// and no further failures accumulate. Reaching the threshold creates the
    /// lock.
    pub fn record_failure(&self, identifier: &str) -> LockoutStatus {
        self.table.record_failure(&namespaced(&self.prefix, identifier))
    }

    /// Forget every failure and any lock for `identifier`.
    pub fn record_success(&self, identifier: &str) {
        self.table
            .entries
            .write()
            .remove(&namespaced(&self.prefix, identifier));
    }

    /// The policy this tracker enforces.
    pub fn config(&self) -> LockoutConfig {
        self.table.config
    }

    /// The namespace prepended to identifiers.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of identifiers currently tracked.
    pub fn entry_count(&self) -> usize {
        self.table.entries.read().len()
    }

    /// Stop the background sweep and wait for it to exit.
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
    }
}

impl std::fmt::Debug for AccountLockout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountLockout")
            .field("prefix", &self.prefix)
            .field("config", &self.table.config)
            .finish()
    }
}
