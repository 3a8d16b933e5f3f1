//! Token bucket.
//!
//! Tokens are bytes. The bucket starts full and refills at `rate` bytes per
//! second up to `burst`. A reservation always succeeds and may drive the
//! balance negative; the caller sleeps for the returned delay, so long-run
//! throughput converges to `rate` while up to `burst` bytes pass at once.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ThrottleError;

/// Rate and burst for one direction, in bytes.
///
/// A rate of `0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limit {
    /// Bytes per second.
    pub rate: i64,
    /// Largest chunk admitted at once.
    pub burst: i64,
}

impl Limit {
    pub fn new(rate: i64, burst: i64) -> Self {
        Self { rate, burst }
    }

    pub fn unlimited() -> Self {
        Self { rate: 0, burst: 0 }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate <= 0
    }

    /// Rejects negative rates and bursts.
    pub fn validate(&self) -> Result<(), ThrottleError> {
        if self.rate < 0 || self.burst < 0 {
            return Err(ThrottleError::InvalidLimit {
                rate: self.rate,
                burst: self.burst,
            });
        }
        Ok(())
    }
}

impl Default for Limit {
    fn default() -> Self {
        Self::unlimited()
    }
}

struct State {
    tokens: f64,
    last: Instant,
}

pub(crate) struct Bucket {
    limit: Limit,
    state: Mutex<State>,
}

impl Bucket {
    /// Callers guarantee `limit.rate > 0` and `limit.burst > 0`.
    pub(crate) fn new(limit: Limit) -> Self {
        Self {
            limit,
            state: Mutex::new(State {
                tokens: limit.burst as f64,
                last: Instant::now(),
            }),
        }
    }

    pub(crate) fn limit(&self) -> Limit {
        self.limit
    }

    /// Largest single reservation; reads and writes are chunked to this.
    pub(crate) fn burst(&self) -> usize {
        self.limit.burst as usize
    }

    /// Takes `n` tokens and returns how long to wait before using them.
    pub(crate) fn reserve(&self, n: usize) -> Duration {
        let rate = self.limit.rate as f64;
        let burst = self.limit.burst as f64;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate).min(burst);
        state.last = now;

        state.tokens -= n as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / rate)
        }
    }
}
