//! Capacity-one token bucket gating every outbound accrual request.
//!
//! The rate is hot-swappable: a 429 from the authority clamps it to zero
//! immediately and schedules a restoration to the advertised rate once the
//! cooldown elapses.

use std::pin::pin;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::Notify;
use tokio::time::Duration;
use tokio::time::Instant;
use tokio::time::sleep_until;

pub struct RateLimiter {
    state: Mutex<LimiterState>,
    notify: Notify,
}

struct LimiterState {
    /// Tokens per second. `f64::INFINITY` disables limiting; `0.0` blocks.
    rate: f64,
    /// Fractional tokens currently in the bucket, at most 1.
    tokens: f64,
    updated_at: Instant,
    /// A rate change scheduled for a future instant.
    pending: Option<(Instant, f64)>,
}

impl RateLimiter {
    pub fn new(rate: f64) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                rate: rate.max(0.0),
                tokens: 1.0,
                updated_at: Instant::now(),
                pending: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY)
    }

    /// Take one token, waiting for the bucket to refill if necessary. Callers
    /// that need a deadline wrap this in [`tokio::time::timeout`]; dropping
    /// the future consumes nothing.
    pub async fn acquire(&self) {
        loop {
            // Register for wakeups before inspecting state so a concurrent
            // `set_limit` cannot slip between the check and the wait.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let deadline = {
                let mut state = self
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                state.refill(now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                state.next_token_at(now)
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => {}
                        _ = &mut notified => {}
                    }
                }
                // Rate is zero with nothing scheduled; only a limit change
                // can unblock us.
                None => notified.await,
            }
        }
    }

    /// Refills proceed at `rate` from now on. Wakes all waiters.
    pub fn set_limit(&self, rate: f64) {
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.refill(Instant::now());
            state.rate = rate.max(0.0);
            state.pending = None;
        }
        self.notify.notify_waiters();
    }

    /// Apply `rate` starting at instant `at`; refills before `at` continue at
    /// the current rate. A later `set_limit` cancels the scheduled change.
    pub fn set_limit_at(&self, at: Instant, rate: f64) {
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.refill(Instant::now());
            state.pending = Some((at, rate.max(0.0)));
        }
        self.notify.notify_waiters();
    }
}

impl LimiterState {
    fn refill(&mut self, now: Instant) {
        if let Some((at, rate)) = self.pending
            && now >= at
        {
            self.advance(at);
            self.rate = rate;
            self.pending = None;
        }
        self.advance(now);
    }

    fn advance(&mut self, to: Instant) {
        if self.rate.is_infinite() {
            self.tokens = 1.0;
            self.updated_at = to;
            return;
        }
        if to <= self.updated_at {
            return;
        }
        let elapsed = (to - self.updated_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(1.0);
        self.updated_at = to;
    }

    /// Earliest instant at which a full token could be available, or `None`
    /// when only a rate change can produce one.
    fn next_token_at(&self, now: Instant) -> Option<Instant> {
        if self.rate > 0.0 {
            let wait = (1.0 - self.tokens) / self.rate;
            return Some(now + Duration::from_secs_f64(wait));
        }
        self.pending.map(|(at, _)| at)
    }
}
