//! Retry backoff for director queries
//!
//! Kept as a pure function so the sleep schedule is testable without a
//! clock: `backoff(attempt) = (3 * attempt + 3)s`, to which callers add
//! up to one second of jitter.

use std::time::Duration;

/// Base sleep before retry number `attempt` (zero-indexed)
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(3 * attempt + 3))
}

/// `backoff` plus a caller-supplied jitter fraction in `[0, 1)`
pub fn backoff_with_jitter(attempt: u32, jitter: f64) -> Duration {
    backoff(attempt) + Duration::from_millis((jitter.clamp(0.0, 1.0) * 1000.0) as u64)
}
