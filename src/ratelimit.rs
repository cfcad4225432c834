//! Process-wide rate budget for recognizer calls.
//!
//! Two budgets mirror the provider's quota terms: a cap on simultaneous calls
//! and an optional cap on calls started per rolling window. Tokens are only
//! handed out as [`RatePermit`]s, which give the token back when dropped, so
//! every exit path of a worker releases exactly once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Budget parameters. Replaced wholesale on reload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBudget {
    pub max_concurrent: usize,
    /// At most `.0` acquisitions per rolling `.1`.
    pub window: Option<(u32, Duration)>,
    pub acquire_timeout: Duration,
}

impl From<&RateConfig> for RateBudget {
    fn from(c: &RateConfig) -> Self {
        Self {
            max_concurrent: c.max_concurrent,
            window: c
                .max_calls_per_window
                .zip(c.window_ms)
                .map(|(n, ms)| (n, Duration::from_millis(ms))),
            acquire_timeout: c.acquire_timeout(),
        }
    }
}

/// Point-in-time view for the status surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub window_used: usize,
    pub window_limit: Option<u32>,
    pub peak_in_flight: usize,
    pub granted: u64,
}

struct Inner {
    budget: RateBudget,
    in_flight: usize,
    /// Start times of acquisitions inside the current window.
    recent: VecDeque<Instant>,
    peak_in_flight: usize,
    granted: u64,
}

impl Inner {
    fn prune(&mut self, now: Instant) {
        if let Some((_, window)) = self.budget.window {
            while let Some(&oldest) = self.recent.front() {
                if now.duration_since(oldest) >= window {
                    self.recent.pop_front();
                } else {
                    break;
                }
            }
        } else {
            self.recent.clear();
        }
    }

    /// Take a token, or say how long until the window frees one (`None` if the
    /// concurrency budget is what blocks).
    fn try_take(&mut self, now: Instant) -> std::result::Result<(), Option<Duration>> {
        self.prune(now);

        if let Some((limit, window)) = self.budget.window {
            if self.recent.len() >= limit as usize {
                let wait = self
                    .recent
                    .front()
                    .map(|&oldest| (oldest + window).saturating_duration_since(now))
                    .unwrap_or(window);
                return Err(Some(wait));
            }
        }
        if self.in_flight >= self.budget.max_concurrent {
            return Err(None);
        }

        self.in_flight += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
        self.granted += 1;
        if self.budget.window.is_some() {
            self.recent.push_back(now);
        }
        Ok(())
    }
}

pub struct RateLimiter {
    inner: Mutex<Inner>,
    released: Notify,
}

impl RateLimiter {
    pub fn new(budget: RateBudget) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                budget,
                in_flight: 0,
                recent: VecDeque::new(),
                peak_in_flight: 0,
                granted: 0,
            }),
            released: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a token, up to the budget's acquire timeout.
    ///
    /// A timeout is reported as [`Error::RateLimited`], which is retryable.
    pub async fn acquire(self: &Arc<Self>) -> Result<RatePermit> {
        let started = Instant::now();
        let deadline = started + self.lock().budget.acquire_timeout;

        loop {
            // Register before checking so a release between the check and
            // the await is not missed.
            let released = self.released.notified();

            let now = Instant::now();
            let window_wait = match self.lock().try_take(now) {
                Ok(()) => {
                    let waited = now.duration_since(started);
                    if !waited.is_zero() {
                        metrics::rate_wait_ms().record(waited.as_secs_f64() * 1_000.0, &[]);
                    }
                    return Ok(RatePermit {
                        limiter: Arc::clone(self),
                    });
                }
                Err(wait) => wait,
            };

            if now >= deadline {
                metrics::rate_timeouts().add(1, &[]);
                return Err(Error::RateLimited {
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }

            let wake_at = window_wait
                .map(|w| (now + w).min(deadline))
                .unwrap_or(deadline);
            tokio::select! {
                _ = released => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Take a token only if one is free right now.
    #[cfg(test)]
    fn try_acquire(self: &Arc<Self>) -> Option<RatePermit> {
        self.lock().try_take(Instant::now()).ok()?;
        Some(RatePermit {
            limiter: Arc::clone(self),
        })
    }

    /// Replace the budget. Held permits stay valid; a lower budget only delays
    /// new acquisitions until enough permits are returned.
    pub fn set_budget(&self, budget: RateBudget) {
        {
            let mut inner = self.lock();
            if inner.budget == budget {
                return;
            }
            debug!(
                max_concurrent = budget.max_concurrent,
                in_flight = inner.in_flight,
                "rate budget updated"
            );
            inner.budget = budget;
        }
        self.released.notify_waiters();
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let mut inner = self.lock();
        inner.prune(Instant::now());
        RateSnapshot {
            in_flight: inner.in_flight,
            max_concurrent: inner.budget.max_concurrent,
            window_used: inner.recent.len(),
            window_limit: inner.budget.window.map(|(n, _)| n),
            peak_in_flight: inner.peak_in_flight,
            granted: inner.granted,
        }
    }

    fn release(&self) {
        {
            let mut inner = self.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
        self.released.notify_waiters();
    }
}

/// One rate token. Returned to the limiter on drop.
#[must_use = "dropping the permit releases the token immediately"]
pub struct RatePermit {
    limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for RatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatePermit").finish_non_exhaustive()
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
