//! # Token Bucket
//!
//! Pure admission-control algorithm: decide whether a unit of work may
//! proceed given a refill rate and a burst capacity.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  stored tokens                                              │
//! │  capacity ──────────────────────────────                    │
//! │       │   ╲ consume        ╱ refill at `rate`/sec           │
//! │       │    ╲______________╱                                 │
//! │       0 ────────────────────────────────▶ time              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Properties
//!
//! | Property       | Description                                   |
//! |----------------|-----------------------------------------------|
//! | **Capacity**   | Maximum stored tokens (burst size)            |
//! | **Rate**       | Tokens added per second, may be fractional    |
//! | **Invariant**  | `0 <= stored <= capacity` after every call    |
//! | **Granularity**| Refill is computed on whole elapsed millis    |
//!
//! ## Edge Case Handling
//!
//! - Negative elapsed time (clock skew across nodes) is clamped to zero
//! - Refill accrues per whole millisecond, so a burst can never push
//!   `stored` above `capacity`
//! - Fractional rates accumulate in `f64` without drift at this scale
//!
//! The bucket itself is not synchronized. Every consume is a multi-step
//! read-modify-write, so concurrent callers serialize on a per-bucket
//! mutex owned by the rate limiter frontend.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Token bucket state with time-based refill.
///
/// # Example
///
/// ```rust
/// use gatekeeper::token_bucket::TokenBucket;
///
/// // 100 tokens of burst, refilled at 10 per second
/// let mut bucket = TokenBucket::new(100, 10.0);
///
/// assert!(bucket.allow());        // 99 remaining
/// assert!(bucket.allow_n(99));    // 0 remaining
/// assert!(!bucket.allow());       // empty until refill
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucket {
    /// Maximum number of tokens the bucket can hold
    pub capacity: u64,
    /// Current token count (fractional so sub-second refill is not lost)
    pub stored: f64,
    /// Refill rate in tokens per second
    pub rate: f64,
    /// Timestamp of the last refill observation (ms since UNIX epoch)
    pub last_refill: u64,
}

impl TokenBucket {
    /// Creates a bucket starting at full capacity.
    pub fn new(capacity: u64, rate: f64) -> Self {
        Self {
            capacity,
            stored: capacity as f64,
            rate,
            last_refill: now_ms(),
        }
    }

    /// Consumes one token if available.
    pub fn allow(&mut self) -> bool {
        self.allow_n(1)
    }

    /// Consumes `n` tokens if available.
    ///
    /// Advances the bucket to the current instant either way, so a failed
    /// call still observes the refill that happened since the last one.
    pub fn allow_n(&mut self, n: u64) -> bool {
        let delta = self.advance(now_ms());
        let needed = n as f64;
        if delta >= needed {
            self.stored = delta - needed;
            true
        } else {
            self.stored = delta;
            false
        }
    }

    /// Consumes `n` tokens if available, otherwise reports how long the
    /// caller would have to wait for them.
    ///
    /// The failure path does not reserve anything; the returned duration is
    /// a hint computed from the current fill level and rate.
    pub fn reserve(&mut self, n: u64) -> (bool, Duration) {
        if self.allow_n(n) {
            return (true, Duration::ZERO);
        }
        if n > self.capacity || self.rate <= 0.0 {
            // Can never be satisfied
            return (false, Duration::from_secs(u64::MAX));
        }
        let missing = n as f64 - self.stored;
        let secs = (missing / self.rate).min(86_400.0);
        (false, Duration::from_secs_f64(secs))
    }

    /// Number of whole tokens currently available, after refill.
    pub fn available(&mut self) -> u64 {
        let delta = self.advance(now_ms());
        self.stored = delta;
        self.stored.floor() as u64
    }

    /// Refills up to `now` and returns the advanced token count without
    /// committing it. `last_refill` moves to `now` unconditionally.
    fn advance(&mut self, now: u64) -> f64 {
        // saturating_sub clamps negative elapsed time from skewed clocks
        let elapsed_ms = now.saturating_sub(self.last_refill);
        self.last_refill = now;

        let generated = elapsed_ms as f64 * self.rate / 1000.0;
        if generated.is_finite() && generated > 0.0 {
            (self.stored + generated).min(self.capacity as f64)
        } else {
            self.stored
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
