//! OutboxBuilder - store / registry / options / clock のワイヤリング
//!
//! # Fail-fast
//! - 同じ task_type の二重登録は `register` の時点でエラー
//! - `expect_tasks()` で handler 必須の task_type を宣言し、`build()` が不足分を報告
//! - `build()` で options を検証（範囲外の duration もここで弾く）

use std::sync::Arc;

use thiserror::Error;

use super::processor::OutboxProcessor;
use super::registry::{HandlerRegistry, RegistryError};
use super::service::OutboxService;
use super::status::StatusReport;
use super::worker_loop::{WorkerGroup, WorkerLoop};
use crate::config::{ConfigError, OutboxOptions};
use crate::domain::{
    Decider, MessageId, MessageStatus, OutboxError, OutboxMessage, StatusCounts, TaskType,
    WorkerId,
};
use crate::ports::{Clock, MessageStore, OutboxHandler, SystemClock};
use crate::typed::{Handler, Task};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing handlers for task types: {0:?}")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    InvalidOptions(#[from] ConfigError),
}

/// # Example
/// ```ignore
/// let outbox = OutboxBuilder::new(Arc::new(store))
///     .options(options)
///     .register_typed::<EmailSend, _>(EmailSendHandler::new(LogEmailSender))?
///     .expect_tasks(&[EmailSend::TYPE])
///     .build()?;
/// ```
pub struct OutboxBuilder {
    store: Arc<dyn MessageStore>,
    registry: HandlerRegistry,
    options: OutboxOptions,
    clock: Arc<dyn Clock>,
    decider: Option<Arc<dyn Decider>>,
    expected_tasks: Vec<String>,
}

impl OutboxBuilder {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            registry: HandlerRegistry::new(),
            options: OutboxOptions::default(),
            clock: Arc::new(SystemClock),
            decider: None,
            expected_tasks: Vec::new(),
        }
    }

    pub fn options(mut self, options: OutboxOptions) -> Self {
        self.options = options;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default decider (built from the options' backoff policy).
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn register(mut self, handler: Arc<dyn OutboxHandler>) -> Result<Self, RegistryError> {
        self.registry.register(handler)?;
        Ok(self)
    }

    pub fn register_typed<T, H>(mut self, handler: H) -> Result<Self, RegistryError>
    where
        T: Task,
        H: Handler<T> + 'static,
    {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks
            .extend(task_types.iter().map(|t| t.to_string()));
        self
    }

    pub fn build(self) -> Result<Outbox, BuildError> {
        self.options.validate()?;

        let missing: Vec<String> = self
            .expected_tasks
            .iter()
            .filter(|t| !self.registry.contains(&TaskType::new(t.as_str())))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingTaskTypes(missing));
        }

        let decider: Arc<dyn Decider> = match self.decider {
            Some(decider) => decider,
            None => Arc::new(self.options.decider()),
        };
        let service = OutboxService::new(
            Arc::clone(&self.store),
            self.options.clone(),
            Arc::clone(&self.clock),
        );
        let processor = Arc::new(OutboxProcessor::new(
            Arc::clone(&self.store),
            Arc::new(self.registry),
            decider,
            self.options,
            self.clock,
        ));

        Ok(Outbox {
            store: self.store,
            service,
            processor,
        })
    }
}

/// Outbox はワイヤリング済みの一式
/// - enqueue は `service()`
/// - 処理は `processor()` またはワーカーループ
/// - 状態確認は `get` / `list_by_status` / `counts` / `status_report`
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn MessageStore>,
    service: OutboxService,
    processor: Arc<OutboxProcessor>,
}

impl Outbox {
    pub fn service(&self) -> &OutboxService {
        &self.service
    }

    pub fn processor(&self) -> Arc<OutboxProcessor> {
        Arc::clone(&self.processor)
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        Arc::clone(&self.store)
    }

    pub fn worker(&self, worker_id: WorkerId) -> WorkerLoop {
        WorkerLoop::new(self.processor(), worker_id)
    }

    pub fn spawn_workers(&self, n: usize, base_worker_id: &WorkerId) -> WorkerGroup {
        WorkerGroup::spawn(n, self.processor(), base_worker_id)
    }

    pub async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxError> {
        self.store.get(id).await
    }

    pub async fn list_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        self.store.list_by_status(status, limit).await
    }

    pub async fn counts(&self) -> Result<StatusCounts, OutboxError> {
        self.store.counts_by_status().await
    }

    /// Counts plus the first `dead_limit` dead-lettered messages.
    pub async fn status_report(&self, dead_limit: usize) -> Result<StatusReport, OutboxError> {
        StatusReport::collect(self.store.as_ref(), dead_limit).await
    }
}
