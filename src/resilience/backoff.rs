//! # Retry backoff
//!
//! [`BackoffPolicy`] computes the delay before retry attempt `n` as
//! `first × factor^n`, clamped to `max`, with optional full jitter. The base delay is
//! derived from the attempt number alone, so jitter never feeds back into later delays.
//!
//! ```rust
//! use std::time::Duration;
//! use jobtree_core::resilience::BackoffPolicy;
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(10),
//!     max: Duration::from_millis(50),
//!     factor: 2.0,
//!     jitter: false,
//! };
//! assert_eq!(backoff.next(0), Duration::from_millis(10));
//! assert_eq!(backoff.next(2), Duration::from_millis(40));
//! assert_eq!(backoff.next(8), Duration::from_millis(50));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential retry backoff
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    #[serde(with = "duration_ms", rename = "first_ms")]
    pub first: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_ms", rename = "max_ms")]
    pub max: Duration,
    /// Multiplicative growth factor
    pub factor: f64,
    /// Spread each delay uniformly over `[0, base]`
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(5),
            max: Duration::from_millis(200),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given 0-indexed attempt
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped)
        };

        if self.jitter && !base.is_zero() {
            let nanos = base.as_nanos().min(u64::MAX as u128) as u64;
            Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
        } else {
            base
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(first_ms: u64, max_ms: u64, factor: f64) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(first_ms),
            max: Duration::from_millis(max_ms),
            factor,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let policy = fixed(100, 30_000, 2.0);
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(3), Duration::from_millis(800));
    }

    #[test]
    fn test_capped_at_max() {
        let policy = fixed(100, 1_000, 10.0);
        assert_eq!(policy.next(5), Duration::from_millis(1_000));
        assert_eq!(policy.next(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_base() {
        let policy = BackoffPolicy {
            jitter: true,
            ..fixed(100, 1_000, 2.0)
        };
        for attempt in 0..8 {
            let base = fixed(100, 1_000, 2.0).next(attempt);
            assert!(policy.next(attempt) <= base);
        }
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let json = serde_json::to_value(fixed(5, 200, 2.0)).unwrap();
        assert_eq!(json["first_ms"], 5);
        assert_eq!(json["max_ms"], 200);
        let back: BackoffPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, fixed(5, 200, 2.0));
    }
}
