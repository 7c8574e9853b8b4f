//! Ports.
//!
//! Traits at the boundary between the queue logic and the outside world:
//! - `MessageStore`: the durable table (SQLite, in-memory)
//! - `OutboxHandler`: the per-type side effect
//! - `Clock`: the source of `now`

pub mod clock;
pub mod handler;
pub mod message_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::handler::OutboxHandler;
pub use self::message_store::MessageStore;
