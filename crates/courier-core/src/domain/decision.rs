//! Decision - handler が失敗したメッセージの次の状態
//!
//! - Decider は純粋関数: claim 時点のメッセージと失敗テキストから次の状態を返す
//! - 反映（ガード付き書き戻し）は processor の責務

use std::time::Duration;

use super::backoff::BackoffPolicy;
use super::errors::truncate_error;
use super::message::OutboxMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Back to Pending after `delay`.
    Retry {
        attempt: u32,
        delay: Duration,
        error: String,
    },

    /// Give up.
    MarkDead { attempt: u32, error: String },
}

impl Decision {
    pub fn attempt(&self) -> u32 {
        match self {
            Decision::Retry { attempt, .. } | Decision::MarkDead { attempt, .. } => *attempt,
        }
    }
}

pub trait Decider: Send + Sync {
    /// Decide the next state of a message after a handler failure.
    ///
    /// # Arguments
    /// * `message` - The message as it was claimed (attempt not yet incremented)
    /// * `error` - Rendered failure text (untruncated)
    fn decide(&self, message: &OutboxMessage, error: &str) -> Decision;
}

/// Attempt-count based decider:
/// - `next = attempt + 1`
/// - Mark dead if `next >= max_attempts`
/// - Retry otherwise, delay from `BackoffPolicy`
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    backoff: BackoffPolicy,
}

impl DefaultDecider {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, message: &OutboxMessage, error: &str) -> Decision {
        let attempt = message.attempt.saturating_add(1);
        let error = truncate_error(error);
        if attempt >= message.max_attempts {
            Decision::MarkDead { attempt, error }
        } else {
            Decision::Retry {
                attempt,
                delay: self.backoff.next_delay(attempt),
                error,
            }
        }
    }
}
