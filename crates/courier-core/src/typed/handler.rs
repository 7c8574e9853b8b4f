//! Handler<T> - 型付き handler と `OutboxHandler` への型消去

use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::task::Task;
use crate::domain::{HandlerError, OutboxMessage};
use crate::ports::OutboxHandler;

/// What a typed handler gets besides the decoded task.
#[derive(Clone, Copy)]
pub struct TaskContext<'a> {
    /// The claimed row (id, attempt, dedup_key, ...).
    pub message: &'a OutboxMessage,
    pub cancel: &'a CancellationToken,
}

/// Handles one `Task` type.
///
/// # Example
/// ```ignore
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl Handler<ResizeImage> for ResizeHandler {
///     async fn handle(&self, task: ResizeImage, _ctx: TaskContext<'_>) -> Result<(), HandlerError> {
///         resize(&task.path).await.map_err(|e| HandlerError::failed(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: TaskContext<'_>) -> Result<(), HandlerError>;
}

/// TypedHandler は `Handler<T>` を `OutboxHandler` に変換
/// - JSON payload をデコードしてから委譲
/// - デコード失敗は通常の失敗扱い（retry される）
pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }

    pub fn inner(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> OutboxHandler for TypedHandler<T, H> {
    fn task_type(&self) -> &str {
        T::TYPE
    }

    async fn handle(
        &self,
        message: &OutboxMessage,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let task = T::from_payload(&message.payload)?;
        self.handler
            .handle(task, TaskContext { message, cancel })
            .await
    }
}
