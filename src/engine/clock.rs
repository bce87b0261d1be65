//! Time source for waits and durations
//!
//! Control loops never call `tokio::time` directly; they go through a
//! [`Clock`] so tests can run them without real time passing.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{OmenError, Result};

#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);

    fn now(&self) -> Instant;
}

/// Real time through tokio
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Virtual time: sleeps return at once and advance `now`
#[derive(Debug)]
pub struct InstantClock {
    start: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for InstantClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }
}

impl InstantClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

#[async_trait]
impl Clock for InstantClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        *self.elapsed.lock() += duration;
        tokio::task::yield_now().await;
    }

    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock()
    }
}

/// Sleep unless cancelled first; cancellation wins ties
pub async fn cancellable_sleep(clock: &dyn Clock, duration: Duration, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(OmenError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OmenError::Cancelled),
        _ = clock.sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_instant_clock_advances() {
        let clock = InstantClock::new();
        let t0 = clock.now();
        clock.sleep(Duration::from_millis(2500)).await;
        clock.sleep(Duration::from_millis(300)).await;
        assert_eq!(clock.now() - t0, Duration::from_millis(2800));
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_sleep() {
        let clock = InstantClock::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable_sleep(&clock, Duration::from_secs(1), &cancel).await;
        assert!(matches!(result, Err(OmenError::Cancelled)));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_sleep_is_cancellable() {
        let clock = TokioClock;
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            child.cancel();
        });
        let result = cancellable_sleep(&clock, Duration::from_secs(60), &cancel).await;
        assert!(matches!(result, Err(OmenError::Cancelled)));
    }
}
