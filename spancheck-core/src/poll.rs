//! Deadline-bounded polling against an eventually consistent source.
//!
//! A [`Poller`] repeatedly runs a [`Probe`] on a fixed interval until the
//! probe reports [`Progress::Done`], the wait budget runs out, or a shutdown
//! signal arrives. A probe error ends the wait at once; there is no retry.
//!
//! Time comes from a [`Clock`] so the loop can be driven by [`ManualClock`]
//! in tests without real sleeps.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

// ============================================================================
// Clock
// ============================================================================

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual time: `sleep` returns immediately after advancing the clock.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += by;
    }

    /// Virtual time since construction.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Poller
// ============================================================================

/// Result of one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress<T> {
    /// Condition satisfied; stop polling.
    Done(T),
    /// Not there yet; the value is kept as the latest observation.
    Pending(T),
}

#[async_trait]
pub trait Probe: Send {
    type Output: Send;
    type Error: Send;

    async fn probe(&mut self) -> Result<Progress<Self::Output>, Self::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Ready(T),
    /// Budget exhausted; carries the last pending observation, if any.
    TimedOut(Option<T>),
    /// Shutdown requested before the condition held.
    Interrupted(Option<T>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub max_wait: Duration,
    /// Initial delay before the first probe, charged against `max_wait`.
    pub settle: Duration,
}

impl Poller {
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            max_wait,
            settle: Duration::ZERO,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Run `probe` until done, out of budget, or interrupted.
    ///
    /// A `TimedOut` outcome is only returned once at least `max_wait` has
    /// elapsed since the call started. A poll that has not answered when
    /// the budget runs out, or when shutdown arrives, is abandoned.
    pub async fn run<P: Probe>(
        &self,
        clock: &dyn Clock,
        mut shutdown: Option<watch::Receiver<bool>>,
        probe: &mut P,
    ) -> Result<PollOutcome<P::Output>, P::Error> {
        let started = clock.now();

        if !self.settle.is_zero() {
            let settle = self.settle.min(self.max_wait);
            tracing::debug!(settle_ms = settle.as_millis() as u64, "Settling before first probe");
            if pause(clock, settle, &mut shutdown).await {
                return Ok(PollOutcome::Interrupted(None));
            }
        }

        let mut last = None;
        loop {
            let remaining = self
                .max_wait
                .saturating_sub(clock.now().saturating_duration_since(started));
            match bounded(clock, remaining, &mut shutdown, probe.probe()).await {
                Bounded::Finished(result) => match result? {
                    Progress::Done(v) => return Ok(PollOutcome::Ready(v)),
                    Progress::Pending(v) => last = Some(v),
                },
                Bounded::TimedOut => {
                    tracing::warn!("Query still running when the wait budget ran out");
                    return Ok(PollOutcome::TimedOut(last));
                }
                Bounded::Interrupted => return Ok(PollOutcome::Interrupted(last)),
            }

            let elapsed = clock.now().saturating_duration_since(started);
            if elapsed >= self.max_wait {
                return Ok(PollOutcome::TimedOut(last));
            }

            let remaining = self.max_wait - elapsed;
            if pause(clock, self.interval.min(remaining), &mut shutdown).await {
                return Ok(PollOutcome::Interrupted(last));
            }
        }
    }
}

/// How a [`bounded`] future ended.
#[derive(Debug, PartialEq)]
pub enum Bounded<T> {
    Finished(T),
    TimedOut,
    Interrupted,
}

/// Await `fut` for at most `limit` of `clock` time, giving up early on shutdown.
///
/// `fut` is always polled first, so work that is already complete wins
/// over an expired limit or a pending signal.
pub async fn bounded<F: Future>(
    clock: &dyn Clock,
    limit: Duration,
    shutdown: &mut Option<watch::Receiver<bool>>,
    fut: F,
) -> Bounded<F::Output> {
    tokio::select! {
        biased;
        out = fut => Bounded::Finished(out),
        _ = signalled(shutdown) => Bounded::Interrupted,
        _ = clock.sleep(limit) => Bounded::TimedOut,
    }
}

/// Resolves once shutdown is requested; never, if there is no live sender.
async fn signalled(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown.as_mut() {
        if rx.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Sleep for `duration`. Returns `true` if shutdown was signalled instead.
async fn pause(
    clock: &dyn Clock,
    duration: Duration,
    shutdown: &mut Option<watch::Receiver<bool>>,
) -> bool {
    let Some(rx) = shutdown.as_mut() else {
        clock.sleep(duration).await;
        return false;
    };

    let mut sleep = clock.sleep(duration);
    let signalled = tokio::select! {
        _ = &mut sleep => return false,
        res = rx.wait_for(|stop| *stop) => res.is_ok(),
    };

    if !signalled {
        // Sender gone: nothing can interrupt any more.
        *shutdown = None;
        sleep.await;
    }
    signalled
}

// ============================================================================
// TESTS
// ============================================================================
