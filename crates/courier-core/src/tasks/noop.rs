use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{HandlerError, OutboxMessage};
use crate::ports::OutboxHandler;

/// Succeeds immediately. Registered as `noop` unless told otherwise.
#[derive(Debug, Clone)]
pub struct NoopHandler {
    task_type: String,
}

impl NoopHandler {
    pub const TYPE: &'static str = "noop";

    pub fn new() -> Self {
        Self::for_type(Self::TYPE)
    }

    pub fn for_type(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
        }
    }
}

impl Default for NoopHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxHandler for NoopHandler {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn handle(
        &self,
        message: &OutboxMessage,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        debug!(message_id = message.id.get(), "noop");
        Ok(())
    }
}
