//! Built-in tasks.
//!
//! - **email**: `email.send`（メール送信、送信手段は `EmailSender` で差し替え）
//! - **noop**: does nothing; used by the smoke test

pub mod email;
pub mod noop;

pub use self::email::{EmailSend, EmailSendHandler, EmailSender, LogEmailSender};
pub use self::noop::NoopHandler;
