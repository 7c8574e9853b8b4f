//! InMemoryMessageStore - プロセス内の message store
//!
//! - すべての操作が単一の mutex を取るので、条件付き更新は自明にアトミック
//! - ロック取得以外の `.await` をまたいでロックを保持しない

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    MessageId, MessageStatus, NewMessage, OutboxError, OutboxMessage, Resolution, StatusCounts,
    WorkerId,
};
use crate::ports::MessageStore;

struct InMemoryState {
    /// All rows, keyed (and therefore ordered) by id.
    records: BTreeMap<MessageId, OutboxMessage>,

    /// Next id to assign.
    next_id: i64,

    /// Successful mutations (insert, claim, resolve).
    writes: u64,

    /// Simulated outage: every call fails with `StoreUnavailable`.
    unavailable: bool,
}

impl InMemoryState {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
            writes: 0,
            unavailable: false,
        }
    }

    fn allocate_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn check_available(&self) -> Result<(), OutboxError> {
        if self.unavailable {
            return Err(OutboxError::StoreUnavailable(
                "in-memory store is marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-local store for development and tests. Clones share the same
/// table.
#[derive(Clone)]
pub struct InMemoryMessageStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::new())),
        }
    }

    /// Number of successful mutations so far.
    pub async fn write_count(&self) -> u64 {
        self.state.lock().await.writes
    }

    /// Make every subsequent call fail (or succeed again).
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, message: NewMessage) -> Result<MessageId, OutboxError> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let id = state.allocate_id();
        state.records.insert(id, message.into_message(id));
        state.writes += 1;
        Ok(id)
    }

    async fn select_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let state = self.state.lock().await;
        state.check_available()?;

        Ok(state
            .records
            .values()
            .filter(|m| m.is_claimable(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn try_claim(
        &self,
        id: MessageId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let claimed = match state.records.get_mut(&id) {
            Some(record) if record.is_claimable(now) => {
                record.claim(worker_id, now, lease_until);
                true
            }
            _ => false,
        };
        if claimed {
            state.writes += 1;
        }
        Ok(claimed)
    }

    async fn fetch_many(&self, ids: &[MessageId]) -> Result<Vec<OutboxMessage>, OutboxError> {
        let state = self.state.lock().await;
        state.check_available()?;

        let mut found: Vec<OutboxMessage> = ids
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect();
        found.sort_by_key(|m| m.id);
        found.dedup_by_key(|m| m.id);
        Ok(found)
    }

    async fn resolve(
        &self,
        id: MessageId,
        worker_id: &WorkerId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let applied = match state.records.get_mut(&id) {
            Some(record) if record.is_locked_by(worker_id) => {
                record.resolve(&resolution, now);
                true
            }
            _ => false,
        };
        if applied {
            state.writes += 1;
        }
        Ok(applied)
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.records.get(&id).cloned())
    }

    async fn list_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let state = self.state.lock().await;
        state.check_available()?;

        Ok(state
            .records
            .values()
            .filter(|m| m.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, OutboxError> {
        let state = self.state.lock().await;
        state.check_available()?;

        let mut counts = StatusCounts::default();
        for record in state.records.values() {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }
}
