//! Backoff policy: decides how long a failed message waits before its next
//! attempt.

use std::time::Duration;

use rand::Rng;

/// Exponential base-2 backoff, capped, plus uniform jitter.
///
/// `delay = min(2^next_attempt s, max_backoff) + U[0, jitter]` (jitter in whole
/// milliseconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Cap for the exponential part.
    pub max_backoff: Duration,

    /// Upper bound of the random addend. Spreads retries of messages that
    /// failed together across workers.
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(max_backoff: Duration, jitter: Duration) -> Self {
        Self { max_backoff, jitter }
    }

    /// Deterministic part of the delay.
    ///
    /// # Example
    /// With max_backoff = 10min:
    /// - next_attempt 1: 2s
    /// - next_attempt 2: 4s
    /// - next_attempt 9: 512s
    /// - next_attempt 10: 600s (capped)
    pub fn base_delay(&self, next_attempt: u32) -> Duration {
        let exp_ms = 2u64
            .checked_pow(next_attempt)
            .and_then(|secs| secs.checked_mul(1000))
            .unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(exp_ms.min(cap_ms))
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&self, next_attempt: u32, rng: &mut R) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            0
        } else {
            rng.gen_range(0..=jitter_ms)
        };
        self.base_delay(next_attempt) + Duration::from_millis(extra)
    }

    pub fn next_delay(&self, next_attempt: u32) -> Duration {
        self.next_delay_with(next_attempt, &mut rand::thread_rng())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_backoff: Duration::from_secs(600),
            jitter: Duration::from_millis(500),
        }
    }
}
