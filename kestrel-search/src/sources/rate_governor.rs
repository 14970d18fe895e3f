//! Per-source request throttling
//!
//! A token bucket (governor) caps steady-state request rate. When a source
//! answers "slow down" the backoff deadline is pushed forward, which delays the
//! next call from every worker sharing this governor. The rate-limited call
//! itself is not retried.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Backoff applied when a source rate-limits without a `Retry-After` header
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

pub struct RateGovernor {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    backoff_until: Mutex<Option<Instant>>,
}

impl RateGovernor {
    /// Governor allowing `requests_per_second` calls (minimum 1)
    pub fn per_second(requests_per_second: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            backoff_until: Mutex::new(None),
        }
    }

    /// Wait until a call is permitted
    pub async fn acquire(&self) {
        if let Some(remaining) = self.backoff_remaining() {
            debug!(wait_ms = remaining.as_millis() as u64, "Waiting out source backoff");
            tokio::time::sleep(remaining).await;
        }
        self.limiter.until_ready().await;
    }

    /// Delay the next call by at least `delay`
    ///
    /// An existing later deadline is kept.
    pub fn back_off(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut guard = self.backoff_until.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(existing) if existing >= deadline => {}
            _ => *guard = Some(deadline),
        }
    }

    /// Time left before the next call may start, if a backoff is active
    pub fn backoff_remaining(&self) -> Option<Duration> {
        let guard = self.backoff_until.lock().unwrap_or_else(|e| e.into_inner());
        guard.and_then(|deadline| {
            let now = Instant::now();
            (deadline > now).then(|| deadline - now)
        })
    }
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGovernor")
            .field("backoff_remaining", &self.backoff_remaining())
            .finish()
    }
}
