//! Domain model (ids, messages, retry decisions, errors).
//!
//! - **ids**: `MessageId`（ストア採番）と `WorkerId`（lease の持ち主）
//! - **task_type**: handler へのルーティングキー
//! - **message**: `OutboxMessage` と状態 `MessageStatus`
//! - **backoff / decision**: 失敗時の retry / dead-letter 判定（純粋関数）
//! - **errors**: `OutboxError`, `HandlerError`, error text の切り詰め

pub mod backoff;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod message;
pub mod status;
pub mod task_type;

pub use self::backoff::BackoffPolicy;
pub use self::decision::{Decider, Decision, DefaultDecider};
pub use self::errors::{HandlerError, MAX_LAST_ERROR_CHARS, OutboxError, describe_error, truncate_error};
pub use self::ids::{MessageId, WorkerId};
pub use self::message::{MessageStatus, NewMessage, OutboxMessage, Resolution};
pub use self::status::StatusCounts;
pub use self::task_type::TaskType;
