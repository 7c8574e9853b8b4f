//! `email.send` タスク - メール送信

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::HandlerError;
use crate::typed::{Handler, Task, TaskContext};

/// An e-mail to deliver. Stored as the JSON payload of the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSend {
    pub subject: String,
    pub html_body: String,
    pub to_name: String,
    pub to_address: String,
}

impl Task for EmailSend {
    const TYPE: &'static str = "email.send";
}

/// EmailSender は送信バックエンド（SMTP クライアント、プロバイダ API など）
/// - 部分的な失敗の後に retry されるので、同じメールが複数回 `send` に届きうる
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &EmailSend) -> Result<(), HandlerError>;
}

#[async_trait]
impl<S: EmailSender + ?Sized> EmailSender for Arc<S> {
    async fn send(&self, email: &EmailSend) -> Result<(), HandlerError> {
        (**self).send(email).await
    }
}

/// Writes the e-mail to the log instead of sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, email: &EmailSend) -> Result<(), HandlerError> {
        info!(
            to_name = %email.to_name,
            to_address = %email.to_address,
            subject = %email.subject,
            body_len = email.html_body.len(),
            "email send (log only)"
        );
        Ok(())
    }
}

pub struct EmailSendHandler<S> {
    sender: S,
}

impl<S: EmailSender> EmailSendHandler<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<S: EmailSender> Handler<EmailSend> for EmailSendHandler<S> {
    async fn handle(&self, task: EmailSend, ctx: TaskContext<'_>) -> Result<(), HandlerError> {
        if task.to_address.trim().is_empty() {
            return Err(HandlerError::failed(format!(
                "email message {} has no recipient address",
                ctx.message.id
            )));
        }
        self.sender.send(&task).await
    }
}
