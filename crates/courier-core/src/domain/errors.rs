//! Error types - エラー型
//!
//! - `OutboxError`: enqueue / process_once / store が返す。`Cancelled` は正常停止で失敗ではない
//! - `HandlerError`: handler が返す。processor の外には出ず、必ず retry か dead-letter になる

use thiserror::Error;

/// Upper bound for the stored `last_error` text, in characters.
pub const MAX_LAST_ERROR_CHARS: usize = 4000;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupt outbox row id={id}: {reason}")]
    CorruptRow { id: i64, reason: String },

    #[error("unknown status code {0} in outbox table")]
    UnknownStatusCode(i64),

    #[error("operation cancelled")]
    Cancelled,
}

impl OutboxError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OutboxError::Cancelled)
    }

    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            OutboxError::Storage(_)
                | OutboxError::StoreUnavailable(_)
                | OutboxError::CorruptRow { .. }
                | OutboxError::UnknownStatusCode(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Render an error and its source chain as one line.
///
/// Sources whose text already appears in the rendered message are skipped,
/// since `thiserror` messages often embed their source.
pub fn describe_error(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": caused by: ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

/// Literal prefix cut to `MAX_LAST_ERROR_CHARS` characters. No ellipsis.
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_LAST_ERROR_CHARS) {
        Some((byte_idx, _)) => error[..byte_idx].to_string(),
        None => error.to_string(),
    }
}
