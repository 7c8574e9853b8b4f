//! Status - outbox テーブルの状態確認（処理とは独立）

use serde::Serialize;

use crate::domain::{MessageStatus, OutboxError, OutboxMessage, StatusCounts};
use crate::ports::MessageStore;

/// Snapshot for operators: how many rows sit in each state, and which
/// messages were dead-lettered (with their last error).
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub counts: StatusCounts,
    pub dead: Vec<OutboxMessage>,
}

impl StatusReport {
    pub async fn collect(
        store: &dyn MessageStore,
        dead_limit: usize,
    ) -> Result<Self, OutboxError> {
        let counts = store.counts_by_status().await?;
        let dead = if counts.dead == 0 || dead_limit == 0 {
            Vec::new()
        } else {
            store.list_by_status(MessageStatus::Dead, dead_limit).await?
        };
        Ok(Self { counts, dead })
    }

    /// Anything dead-lettered needs a human.
    pub fn needs_attention(&self) -> bool {
        self.counts.dead > 0
    }
}
