//! Implementations of the `MessageStore` port.
//!
//! - `SqliteMessageStore`: sqlx + SQLite, the durable store
//! - `InMemoryMessageStore`: 開発・テスト用（同じ条件付き更新のセマンティクス）

pub mod memory_store;
pub mod sqlite_store;

pub use self::memory_store::InMemoryMessageStore;
pub use self::sqlite_store::SqliteMessageStore;
