//! Typed task API.
//!
//! - **task**: `Task` trait（`const TYPE` で task_type と型を対応付け）
//! - **handler**: `Handler<T>` と、`OutboxHandler` への型消去 `TypedHandler<T, H>`

pub mod handler;
pub mod task;

pub use self::handler::{Handler, TaskContext, TypedHandler};
pub use self::task::Task;
