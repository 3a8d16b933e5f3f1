//! Byte-rate throttling for logical connections.
//!
//! [`Throttler`] wraps any tokio stream with independent read and write
//! token buckets. Limits live behind a [`ThrottleHandle`] so they can be
//! changed while the stream is in use.

mod bucket;
mod throttler;

pub use bucket::Limit;
pub use throttler::{ThrottleHandle, Throttler};

/// Errors produced when configuring limits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    #[error("invalid limit: rate {rate} B/s, burst {burst} B (must not be negative)")]
    InvalidLimit { rate: i64, burst: i64 },

    #[error("burst must be positive when a rate is set")]
    ZeroBurst,
}
