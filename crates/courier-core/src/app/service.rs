//! OutboxService - enqueue
//!
//! - Pending の行を追加して返るだけ
//! - handler はここでは決して実行しない

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::OutboxOptions;
use crate::domain::{MessageId, NewMessage, OutboxError, TaskType};
use crate::ports::{Clock, MessageStore};
use crate::tasks::EmailSend;
use crate::typed::Task;

/// Optional enqueue parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Advisory; stored but not enforced unique.
    pub dedup_key: Option<String>,
    /// Defaults to `OutboxOptions::default_max_attempts`.
    pub max_attempts: Option<u32>,
    /// Earliest processing time. Defaults to now.
    pub not_before: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

/// One message to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub task_type: TaskType,
    pub payload: String,
    pub options: EnqueueOptions,
}

impl EnqueueRequest {
    pub fn new(task_type: impl Into<TaskType>, payload: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
            options: EnqueueOptions::default(),
        }
    }

    /// Serialize a typed task as the payload.
    pub fn typed<T: Task>(task: &T) -> Result<Self, OutboxError> {
        let payload = task.to_payload().map_err(|e| {
            OutboxError::InvalidArgument(format!("cannot encode {} payload: {e}", T::TYPE))
        })?;
        Ok(Self::new(T::task_type(), payload))
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.options = self.options.dedup_key(key);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.options = self.options.max_attempts(max_attempts);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.options = self.options.not_before(at);
        self
    }
}

#[derive(Clone)]
pub struct OutboxService {
    store: Arc<dyn MessageStore>,
    options: OutboxOptions,
    clock: Arc<dyn Clock>,
}

impl OutboxService {
    pub fn new(store: Arc<dyn MessageStore>, options: OutboxOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            options,
            clock,
        }
    }

    /// Append a Pending message and return its id.
    ///
    /// # Errors
    /// - `InvalidArgument`: blank `task_type` or `payload`, or `max_attempts == Some(0)`
    /// - `Storage` / `StoreUnavailable`: the insert failed
    pub async fn enqueue(
        &self,
        task_type: impl Into<TaskType>,
        payload: impl Into<String>,
        dedup_key: Option<String>,
        max_attempts: Option<u32>,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<MessageId, OutboxError> {
        self.enqueue_request(EnqueueRequest {
            task_type: task_type.into(),
            payload: payload.into(),
            options: EnqueueOptions {
                dedup_key,
                max_attempts,
                not_before,
            },
        })
        .await
    }

    pub async fn enqueue_request(&self, request: EnqueueRequest) -> Result<MessageId, OutboxError> {
        let EnqueueRequest {
            task_type,
            payload,
            options,
        } = request;

        if task_type.is_blank() {
            return Err(OutboxError::InvalidArgument(
                "task_type must not be empty".to_string(),
            ));
        }
        if payload.trim().is_empty() {
            return Err(OutboxError::InvalidArgument(
                "payload must not be empty".to_string(),
            ));
        }
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.options.default_max_attempts);
        if max_attempts == 0 {
            return Err(OutboxError::InvalidArgument(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        let now = self.clock.now();
        let dedup_key = options.dedup_key;
        let id = self
            .store
            .insert(NewMessage {
                task_type: task_type.clone(),
                dedup_key: dedup_key.clone(),
                payload,
                max_attempts,
                next_attempt_at: options.not_before.unwrap_or(now),
                created_at: now,
            })
            .await?;

        info!(
            message_id = id.get(),
            task_type = %task_type,
            dedup_key = dedup_key.as_deref().unwrap_or(""),
            max_attempts,
            "outbox message enqueued"
        );
        Ok(id)
    }

    /// Enqueue a typed task under `T::TYPE`.
    pub async fn enqueue_task<T: Task>(
        &self,
        task: &T,
        options: EnqueueOptions,
    ) -> Result<MessageId, OutboxError> {
        self.enqueue_request(EnqueueRequest::typed(task)?.with_options(options))
            .await
    }

    /// Enqueue an `email.send` message.
    pub async fn enqueue_email(
        &self,
        subject: impl Into<String>,
        html_body: impl Into<String>,
        to_name: impl Into<String>,
        to_address: impl Into<String>,
        options: EnqueueOptions,
    ) -> Result<MessageId, OutboxError> {
        let email = EmailSend {
            subject: subject.into(),
            html_body: html_body.into(),
            to_name: to_name.into(),
            to_address: to_address.into(),
        };
        self.enqueue_task(&email, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageStatus;
    use crate::impls::InMemoryMessageStore;
    use crate::ports::ManualClock;
    use crate::test_support::t0;
    use chrono::TimeDelta;
    use rstest::rstest;

    fn service() -> (OutboxService, InMemoryMessageStore) {
        let store = InMemoryMessageStore::new();
        let service = OutboxService::new(
            Arc::new(store.clone()),
            OutboxOptions::default(),
            Arc::new(ManualClock::new(t0())),
        );
        (service, store)
    }

    #[tokio::test]
    async fn enqueue_inserts_pending_row_with_defaults() {
        let (service, store) = service();
        let id = service
            .enqueue("email.send", r#"{"to":"a"}"#, None, None, None)
            .await
            .unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Pending);
        assert_eq!(row.attempt, 0);
        assert_eq!(row.max_attempts, 5);
        assert_eq!(row.next_attempt_at, t0());
        assert_eq!(row.created_at, t0());
        assert_eq!(row.updated_at, t0());
        assert!(row.dedup_key.is_none());
    }

    #[tokio::test]
    async fn enqueue_honours_explicit_options() {
        let (service, store) = service();
        let later = t0() + TimeDelta::minutes(5);
        let id = service
            .enqueue_request(
                EnqueueRequest::new("report.build", "{}")
                    .dedup_key("report:7")
                    .max_attempts(2)
                    .not_before(later),
            )
            .await
            .unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.dedup_key.as_deref(), Some("report:7"));
        assert_eq!(row.max_attempts, 2);
        assert_eq!(row.next_attempt_at, later);
    }

    #[tokio::test]
    async fn dedup_key_is_not_enforced() {
        let (service, _store) = service();
        let a = service
            .enqueue("t", "{}", Some("same".into()), None, None)
            .await
            .unwrap();
        let b = service
            .enqueue("t", "{}", Some("same".into()), None, None)
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[rstest]
    #[case::blank_type("  ", "{}", None)]
    #[case::empty_type("", "{}", None)]
    #[case::blank_payload("t", " \n", None)]
    #[case::zero_attempts("t", "{}", Some(0))]
    #[tokio::test]
    async fn invalid_arguments_are_rejected(
        #[case] task_type: &str,
        #[case] payload: &str,
        #[case] max_attempts: Option<u32>,
    ) {
        let (service, store) = service();
        let err = service
            .enqueue(task_type, payload, None, max_attempts, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::InvalidArgument(_)));
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn store_failure_is_propagated() {
        let (service, store) = service();
        store.set_unavailable(true).await;
        let err = service.enqueue("t", "{}", None, None, None).await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn enqueue_email_stores_typed_payload() {
        let (service, store) = service();
        let id = service
            .enqueue_email(
                "Welcome",
                "<p>hi</p>",
                "Ann",
                "ann@example.com",
                EnqueueOptions::default().dedup_key("welcome:ann"),
            )
            .await
            .unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.task_type, EmailSend::TYPE);
        let email: EmailSend = serde_json::from_str(&row.payload).unwrap();
        assert_eq!(email.to_address, "ann@example.com");
        assert_eq!(row.dedup_key.as_deref(), Some("welcome:ann"));
    }
}
