//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::{HandlerError, MessageId, NewMessage, OutboxMessage, TaskType};
use crate::ports::OutboxHandler;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn new_message(task_type: &str, next_attempt_at: DateTime<Utc>) -> NewMessage {
    NewMessage {
        task_type: TaskType::new(task_type),
        dedup_key: None,
        payload: "{}".to_string(),
        max_attempts: 5,
        next_attempt_at,
        created_at: t0(),
    }
}

pub fn stored_message(
    id: i64,
    task_type: &str,
    payload: &str,
    at: DateTime<Utc>,
) -> OutboxMessage {
    let mut new = new_message(task_type, at);
    new.payload = payload.to_string();
    new.into_message(MessageId::new(id))
}

/// Records the id of every message it sees and succeeds. Can be slowed down.
pub struct RecordingHandler {
    task_type: String,
    delay: Duration,
    seen: Mutex<Vec<MessageId>>,
}

impl RecordingHandler {
    pub fn new(task_type: &str) -> Arc<Self> {
        Self::with_delay(task_type, Duration::ZERO)
    }

    pub fn with_delay(task_type: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            task_type: task_type.to_string(),
            delay,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub async fn seen(&self) -> Vec<MessageId> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl OutboxHandler for RecordingHandler {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn handle(
        &self,
        message: &OutboxMessage,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().await.push(message.id);
        Ok(())
    }
}

/// Fails the first `failures` calls with `error`, then succeeds.
pub struct FlakyHandler {
    task_type: String,
    failures: usize,
    error: String,
    calls: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(task_type: &str, failures: usize, error: &str) -> Arc<Self> {
        Arc::new(Self {
            task_type: task_type.to_string(),
            failures,
            error: error.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    /// Never succeeds.
    pub fn always(task_type: &str, error: &str) -> Arc<Self> {
        Self::new(task_type, usize::MAX, error)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboxHandler for FlakyHandler {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn handle(
        &self,
        _message: &OutboxMessage,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::failed(self.error.clone()))
        } else {
            Ok(())
        }
    }
}

/// Panics on every call.
pub struct PanickingHandler;

#[async_trait]
impl OutboxHandler for PanickingHandler {
    fn task_type(&self) -> &str {
        "panics"
    }

    async fn handle(
        &self,
        _message: &OutboxMessage,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        panic!("handler exploded");
    }
}

/// Cancels `token` on its first call, then never finishes on its own.
pub struct CancellingHandler {
    token: CancellationToken,
    calls: AtomicUsize,
}

impl CancellingHandler {
    pub fn new(token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            token,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboxHandler for CancellingHandler {
    fn task_type(&self) -> &str {
        "cancels"
    }

    async fn handle(
        &self,
        _message: &OutboxMessage,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        std::future::pending::<()>().await;
        Ok(())
    }
}
