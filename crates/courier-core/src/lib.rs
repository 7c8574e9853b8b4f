//! courier-core
//!
//! Reliable outbox task queue: durable, at-least-once dispatch of deferred
//! side effects, with leases taken by conditional updates, exponential
//! backoff with jitter, and dead-lettering.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_type, message, backoff, decision, errors）
//! - **ports**: 抽象化レイヤー（MessageStore, OutboxHandler, Clock）
//! - **impls**: MessageStore の実装（SQLite, in-memory）
//! - **app**: アプリケーションロジック（builder, service, processor, worker_loop, status）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedHandler）
//! - **tasks**: 組み込み task（email.send, noop）
//! - **config**: OutboxOptions（defaults → TOML → 環境変数）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod tasks;
pub mod typed;

#[cfg(test)]
mod test_support;

pub use crate::app::{
    BuildError, EnqueueOptions, EnqueueRequest, HandlerRegistry, Outbox, OutboxBuilder,
    OutboxProcessor, OutboxService, RegistryError, StatusReport, WorkerGroup, WorkerLoop,
    WorkerReport,
};
pub use crate::config::{ConfigError, OutboxOptions};
pub use crate::domain::{
    HandlerError, MessageId, MessageStatus, OutboxError, OutboxMessage, StatusCounts, TaskType,
    WorkerId,
};
pub use crate::impls::{InMemoryMessageStore, SqliteMessageStore};
pub use crate::ports::{Clock, MessageStore, OutboxHandler, SystemClock};
pub use tokio_util::sync::CancellationToken;
