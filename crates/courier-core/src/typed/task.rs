//! Task trait - binds a payload type to its task_type.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{HandlerError, TaskType};

/// A payload type with a fixed task_type.
///
/// # Example
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ResizeImage {
///     path: String,
/// }
///
/// impl Task for ResizeImage {
///     const TYPE: &'static str = "image.resize";
/// }
/// ```
///
/// # Trait bounds
/// - `Serialize`: written as the message payload on enqueue
/// - `DeserializeOwned`: decoded back from the payload on dispatch
/// - `Send + Sync + 'static`: handlers live in `Arc`s shared across workers
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 命名規約: `{domain}.{action}`（例: `email.send`）
    const TYPE: &'static str;

    fn task_type() -> TaskType {
        TaskType::new(Self::TYPE)
    }

    fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn from_payload(payload: &str) -> Result<Self, HandlerError> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Resize {
        path: String,
        width: u32,
    }

    impl Task for Resize {
        const TYPE: &'static str = "image.resize";
    }

    #[test]
    fn payload_encodes_as_json() {
        let task = Resize {
            path: "a.png".into(),
            width: 64,
        };
        let payload = task.to_payload().unwrap();
        assert_eq!(payload, r#"{"path":"a.png","width":64}"#);
        assert_eq!(Resize::task_type(), "image.resize");
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let err = Resize::from_payload(r#"{"path":"a.png"}"#).unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }
}
