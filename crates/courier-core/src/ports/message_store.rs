//! MessageStore port - 永続化された outbox テーブル
//!
//! ワーカー間の協調はすべてここで行う。
//! - `try_claim` / `resolve` はアトミックな条件付き更新であること
//! - 戻り値の `bool` は行がガード条件に一致したかどうか
//! - processor が信用するのはこの `bool` だけ

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    MessageId, MessageStatus, NewMessage, OutboxError, OutboxMessage, Resolution, StatusCounts,
    WorkerId,
};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a Pending row with attempt 0 and return its id.
    async fn insert(&self, message: NewMessage) -> Result<MessageId, OutboxError>;

    /// Up to `limit` claimable rows (see `OutboxMessage::is_claimable`),
    /// ascending by id. Read only; nothing is locked.
    async fn select_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, OutboxError>;

    /// Take the lease on `id` if the row is still claimable at `now`.
    ///
    /// Sets `status = Processing`, `locked_by`, `locked_until = lease_until`
    /// and `updated_at = now`. Returns `false` when another worker won.
    async fn try_claim(
        &self,
        id: MessageId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, OutboxError>;

    /// Current state of the given rows, ascending by id. Missing ids are
    /// skipped.
    async fn fetch_many(&self, ids: &[MessageId]) -> Result<Vec<OutboxMessage>, OutboxError>;

    /// Write the outcome of a claimed message and clear its lease.
    ///
    /// Guarded by `locked_by = worker_id`; returns `false` when the lease was
    /// lost to another worker (nothing written).
    async fn resolve(
        &self,
        id: MessageId,
        worker_id: &WorkerId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxError>;

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxError>;

    /// Rows in `status`, ascending by id.
    async fn list_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, OutboxError>;

    async fn counts_by_status(&self) -> Result<StatusCounts, OutboxError>;
}
