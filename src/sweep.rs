//! Periodic background eviction with explicit shutdown.
//!
//! A [`Sweeper`] owns a tokio task that wakes on a fixed interval and runs a
//! sweep function against a [`Weak`] reference to its owner's state. The task
//! never keeps the state alive: once the owner is dropped the next tick ends
//! the loop. [`Sweeper::stop`] signals shutdown and waits for the task to
//! finish, so no sweep can run after it returns.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Smallest interval a sweeper will tick at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a running sweep task.
#[derive(Debug)]
pub(crate) struct Sweeper {
    name: &'static str,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn a sweep task on the current tokio runtime.
    ///
    /// The first sweep happens one full `every` after spawning.
    pub(crate) fn spawn<T, F>(name: &'static str, every: Duration, target: Weak<T>, sweep: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let every = every.max(MIN_INTERVAL);
        let (shutdown, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    // Also fires when the sender is dropped without a stop.
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(state) = target.upgrade() else {
                            break;
                        };
                        sweep(&state);
                    }
                }
            }

            debug!(sweeper = name, "Sweeper exited");
        });

        debug!(sweeper = name, interval_ms = every.as_millis() as u64, "Sweeper started");

        Self {
            name,
            shutdown,
            handle,
        }
    }

    /// Signal the task to exit and wait until it has.
    pub(crate) async fn stop(self) {
        // The task may already have exited because its owner was dropped.
        let _ = self.shutdown.send(());

        if let Err(e) = self.handle.await {
            warn!(sweeper = self.name, error = %e, "Sweeper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_ticks_on_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::spawn(
            "test",
            Duration::from_secs(10),
            Arc::downgrade(&counter),
            |c: &AtomicUsize| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        sweeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sweep_after_stop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::spawn(
            "test",
            Duration::from_secs(1),
            Arc::downgrade(&counter),
            |c: &AtomicUsize| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        sweeper.stop().await;
        let after_stop = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
        assert_eq!(after_stop, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_exits_when_owner_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::spawn(
            "test",
            Duration::from_secs(1),
            Arc::downgrade(&counter),
            |c: &AtomicUsize| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        drop(counter);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(sweeper.handle.is_finished());
        sweeper.stop().await;
    }
}
