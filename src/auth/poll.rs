//! Deadline-bounded, cancellable polling of a broker resource
//!
//! There is no attempt limit: each read is cheap and the wait is dominated by
//! the human in the browser. The loop stops on `fulfilled`, on cancellation,
//! or once the flow deadline has passed. Both abort conditions are checked
//! before each read, so a read that starts just under the deadline still runs
//! to completion.

use super::broker::{CloudBroker, CloudToken};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default pause between two status reads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Source of "now" for deadline checks
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Suspension primitive used between polls
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Hand-driven clock whose `sleep` advances time instantly
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner()) += by;
    }

    /// Time elapsed since the clock was created
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

#[async_trait]
impl Sleeper for ManualClock {
    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Cooperative cancellation shared between the flow and whoever cancels it
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Watches one broker resource until it is fulfilled or the wait is abandoned
pub struct PollingCoordinator {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    interval: Duration,
}

impl Default for PollingCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(TokioSleeper))
    }
}

impl PollingCoordinator {
    pub fn new(clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            clock,
            sleeper,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Current time according to the injected clock
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Poll `url` until it reads `fulfilled`.
    ///
    /// Returns `None` when cancelled or when `now - started_at >= timeout`;
    /// callers cannot (and need not) tell the two apart. Read failures are
    /// logged and retried on the next tick.
    pub async fn wait_for_fulfillment(
        &self,
        broker: &dyn CloudBroker,
        url: &str,
        started_at: Instant,
        timeout: Duration,
        cancel: &CancellationFlag,
    ) -> Option<CloudToken> {
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("Sign-in cancelled after {} status checks", attempts);
                return None;
            }

            let elapsed = self.clock.now().saturating_duration_since(started_at);
            if elapsed >= timeout {
                tracing::info!(
                    "Sign-in timed out after {}s ({} status checks)",
                    elapsed.as_secs(),
                    attempts
                );
                return None;
            }

            attempts += 1;
            match broker.fetch_status(url).await {
                Ok(token) if token.is_fulfilled() => {
                    tracing::debug!("Cloud token fulfilled after {} status checks", attempts);
                    return Some(token);
                }
                Ok(token) => {
                    tracing::debug!("Cloud token status {:?}, waiting", token.status);
                }
                Err(e) => {
                    tracing::warn!("Cloud token status check failed, retrying: {:#}", e);
                }
            }

            self.sleeper.sleep(self.interval).await;
        }
    }
}
