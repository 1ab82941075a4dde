//! Wall-clock and sleep seams.
//!
//! Deadlines are persisted as Unix epoch seconds so they survive across
//! invocations; the clock is read through [`mockable::Clock`] and every wait
//! goes through a [`Sleeper`], which lets tests drive time by hand.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};

pub use mockable::{Clock, DefaultClock};

/// Something that can suspend the current task.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Hand-driven clock. Sleeping advances the clock instead of blocking.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    /// Starts the clock at `secs` seconds after the Unix epoch.
    pub fn at_epoch(secs: i64) -> Self {
        let start = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default();
        Self {
            now: Arc::new(Mutex::new(start)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        let step = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        *now += step;
    }

    pub fn epoch(&self) -> i64 {
        self.utc().timestamp()
    }

    /// Number of times a caller slept on this clock.
    pub fn sleep_count(&self) -> usize {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .sum()
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Sleeper for ManualClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        self.advance(duration);
    }
}

/// Time sources for one invocation, passed explicitly to every component.
#[derive(Clone)]
pub struct RunContext {
    clock: Arc<dyn Clock + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl RunContext {
    pub fn new(clock: Arc<dyn Clock + Send + Sync>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { clock, sleeper }
    }

    /// Real wall clock and tokio timer.
    pub fn system() -> Self {
        Self::new(Arc::new(DefaultClock), Arc::new(TokioSleeper))
    }

    /// Drives both time and sleeping from the same manual clock.
    pub fn manual(clock: &ManualClock) -> Self {
        Self::new(Arc::new(clock.clone()), Arc::new(clock.clone()))
    }

    /// Current Unix epoch seconds.
    pub fn now(&self) -> i64 {
        self.clock.utc().timestamp()
    }

    pub async fn sleep(&self, duration: Duration) {
        self.sleeper.sleep(duration).await;
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("now", &self.now())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_sleep_advances_clock() {
        let clock = ManualClock::at_epoch(1_000);
        let ctx = RunContext::manual(&clock);

        ctx.sleep(Duration::from_secs(5)).await;
        ctx.sleep(Duration::from_secs(5)).await;

        assert_eq!(ctx.now(), 1_010);
        assert_eq!(clock.sleep_count(), 2);
        assert_eq!(clock.total_slept(), Duration::from_secs(10));
    }

    #[test]
    fn advance_moves_epoch() {
        let clock = ManualClock::at_epoch(42);
        clock.advance(Duration::from_secs(800));
        assert_eq!(clock.epoch(), 842);
    }
}
