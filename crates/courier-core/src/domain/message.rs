//! OutboxMessage - outbox の 1 行と状態遷移

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{MessageId, WorkerId};
use super::task_type::TaskType;

/// Message state.
///
/// State transitions:
/// - Pending -> Processing -> Succeeded
/// - Pending -> Processing -> Pending (retry scheduled, loop until max_attempts)
/// - Pending -> Processing -> Dead (max_attempts reached, or no handler)
/// - Processing -> Processing (lease expired, re-claimed by another worker)
///
/// Persisted as the integer code, so the discriminants are part of the table
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending = 0,
    Processing = 1,
    Succeeded = 2,
    Dead = 3,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 4] = [
        MessageStatus::Pending,
        MessageStatus::Processing,
        MessageStatus::Succeeded,
        MessageStatus::Dead,
    ];

    pub const fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Terminal states are never claimed or mutated again.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Succeeded | MessageStatus::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Succeeded => "succeeded",
            MessageStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown message status: {s}"))
    }
}

/// One row of the outbox table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub task_type: TaskType,

    /// Advisory only; nothing in this crate rejects duplicates.
    pub dedup_key: Option<String>,

    /// Opaque to the queue (JSON by convention).
    pub payload: String,

    pub status: MessageStatus,

    /// Failed processing attempts so far.
    pub attempt: u32,
    pub max_attempts: u32,

    /// Not claimable before this instant (backoff).
    pub next_attempt_at: DateTime<Utc>,

    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,

    /// Most recent failure, at most `MAX_LAST_ERROR_CHARS` characters.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// Someone holds a lease that has not expired yet.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until >= now)
    }

    /// The claim predicate. Store implementations must evaluate exactly this,
    /// atomically, when claiming.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            MessageStatus::Pending | MessageStatus::Processing
        ) && self.next_attempt_at <= now
            && !self.has_live_lease(now)
    }

    pub fn is_locked_by(&self, worker_id: &WorkerId) -> bool {
        self.locked_by.as_deref() == Some(worker_id.as_str())
    }

    /// Apply a claim in place (used by the in-memory store).
    pub(crate) fn claim(
        &mut self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) {
        self.status = MessageStatus::Processing;
        self.locked_by = Some(worker_id.as_str().to_string());
        self.locked_until = Some(lease_until);
        self.updated_at = now;
    }

    /// Apply a resolution in place (used by the in-memory store). Always
    /// clears the lease.
    pub(crate) fn resolve(&mut self, resolution: &Resolution, now: DateTime<Utc>) {
        match resolution {
            Resolution::Succeeded => {
                self.status = MessageStatus::Succeeded;
            }
            Resolution::Dead { attempt, error } => {
                self.status = MessageStatus::Dead;
                self.attempt = *attempt;
                self.last_error = Some(error.clone());
            }
            Resolution::Retry {
                attempt,
                next_attempt_at,
                error,
            } => {
                self.status = MessageStatus::Pending;
                self.attempt = *attempt;
                self.next_attempt_at = *next_attempt_at;
                self.last_error = Some(error.clone());
            }
        }
        self.locked_by = None;
        self.locked_until = None;
        self.updated_at = now;
    }
}

/// NewMessage は挿入する行の内容（id は store が採番）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub task_type: TaskType,
    pub dedup_key: Option<String>,
    pub payload: String,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    /// The row as it looks right after insertion.
    pub fn into_message(self, id: MessageId) -> OutboxMessage {
        OutboxMessage {
            id,
            task_type: self.task_type,
            dedup_key: self.dedup_key,
            payload: self.payload,
            status: MessageStatus::Pending,
            attempt: 0,
            max_attempts: self.max_attempts,
            next_attempt_at: self.next_attempt_at,
            locked_until: None,
            locked_by: None,
            last_error: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// Outcome write-back for a claimed message.
///
/// Every variant clears the lease. Stores apply it only while the row is still
/// locked by the resolving worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    Dead {
        attempt: u32,
        error: String,
    },
    Retry {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
}

impl Resolution {
    pub fn status(&self) -> MessageStatus {
        match self {
            Resolution::Succeeded => MessageStatus::Succeeded,
            Resolution::Dead { .. } => MessageStatus::Dead,
            Resolution::Retry { .. } => MessageStatus::Pending,
        }
    }
}
