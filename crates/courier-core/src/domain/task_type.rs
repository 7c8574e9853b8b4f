use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing key of a message. Exactly one handler is registered per type.
///
/// 命名規約: `{domain}.{action}`（例: `email.send`）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace-only types cannot be enqueued.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for TaskType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TaskType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
