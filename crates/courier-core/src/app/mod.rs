//! App - アプリケーション層
//!
//! ports を組み合わせて outbox の振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **OutboxBuilder / Outbox**: ワイヤリングと起動時検証
//! - **OutboxService**: enqueue
//! - **OutboxProcessor**: claim → dispatch → resolve（1 パス）
//! - **WorkerLoop / WorkerGroup**: processor を繰り返し駆動（キャンセル可能）
//! - **HandlerRegistry**: task_type → handler
//! - **StatusReport**: 状態ごとの件数と dead-letter 一覧

pub mod builder;
pub mod processor;
pub mod registry;
pub mod service;
pub mod status;
pub mod worker_loop;

pub use self::builder::{BuildError, Outbox, OutboxBuilder};
pub use self::processor::OutboxProcessor;
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::service::{EnqueueOptions, EnqueueRequest, OutboxService};
pub use self::status::StatusReport;
pub use self::worker_loop::{WorkerGroup, WorkerLoop, WorkerReport};
