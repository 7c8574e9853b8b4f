//! Processor - outbox に対する 1 パス（claim → dispatch → resolve）
//!
//! # 処理の流れ
//! 1. `select_candidates`: 期限が来た行を id 昇順で最大 `batch_size` 件
//! 2. 各行を `try_claim`（条件付き UPDATE）。負けた行はスキップ
//! 3. claim できた行を再取得し、1 件ずつ dispatch
//! 4. 結果を反映: Succeeded / backoff 付き retry / Dead
//!
//! 書き戻しはすべて `locked_by = worker_id` でガードする。
//! lease を失ったワーカーが新しい所有者の進捗を上書きすることはない。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::HandlerRegistry;
use crate::config::OutboxOptions;
use crate::domain::{
    Decider, Decision, HandlerError, OutboxError, OutboxMessage, Resolution, WorkerId,
    describe_error, truncate_error,
};
use crate::ports::{Clock, MessageStore};

pub struct OutboxProcessor {
    store: Arc<dyn MessageStore>,
    registry: Arc<HandlerRegistry>,
    decider: Arc<dyn Decider>,
    options: OutboxOptions,
    clock: Arc<dyn Clock>,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<HandlerRegistry>,
        decider: Arc<dyn Decider>,
        options: OutboxOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            decider,
            options,
            clock,
        }
    }

    pub fn options(&self) -> &OutboxOptions {
        &self.options
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run one pass and return how many messages reached Succeeded.
    ///
    /// Cancellation is checked before every claim and before every dispatch,
    /// and raced against the running handler. On cancellation the remaining
    /// claims are left as they are; their leases expire on their own.
    ///
    /// # Errors
    /// - `Cancelled`: `cancel` fired
    /// - `Storage` / `StoreUnavailable` / `CorruptRow`: a store call failed
    pub async fn process_once(
        &self,
        worker_id: &WorkerId,
        cancel: &CancellationToken,
    ) -> Result<usize, OutboxError> {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }

        let now = self.clock.now();
        let candidates = self
            .store
            .select_candidates(now, self.options.batch_size)
            .await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let lease_until = add_duration(now, self.options.lease_duration())?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            if cancel.is_cancelled() {
                return Err(OutboxError::Cancelled);
            }
            if self
                .store
                .try_claim(candidate.id, worker_id, now, lease_until)
                .await?
            {
                claimed.push(candidate.id);
            }
        }

        debug!(
            worker_id = %worker_id,
            candidates = candidates.len(),
            claimed = claimed.len(),
            "outbox claim pass"
        );
        if claimed.is_empty() {
            return Ok(0);
        }

        let messages = self.store.fetch_many(&claimed).await?;
        let mut succeeded = 0;
        for message in &messages {
            if cancel.is_cancelled() {
                return Err(OutboxError::Cancelled);
            }
            if !message.is_locked_by(worker_id) {
                warn!(
                    message_id = message.id.get(),
                    worker_id = %worker_id,
                    "claimed message changed owner before dispatch"
                );
                continue;
            }
            if self.process_message(worker_id, message, cancel).await? {
                succeeded += 1;
            }
        }
        Ok(succeeded)
    }

    /// Dispatch one claimed message and write back its outcome. Returns
    /// whether it was recorded as Succeeded.
    async fn process_message(
        &self,
        worker_id: &WorkerId,
        message: &OutboxMessage,
        cancel: &CancellationToken,
    ) -> Result<bool, OutboxError> {
        let Some(handler) = self.registry.get(&message.task_type) else {
            let error = truncate_error(&format!(
                "no handler registered for task type '{}'",
                message.task_type
            ));
            error!(
                message_id = message.id.get(),
                task_type = %message.task_type,
                "outbox message dead-lettered: {error}"
            );
            self.write_back(
                worker_id,
                message,
                Resolution::Dead {
                    attempt: message.attempt,
                    error,
                },
            )
            .await?;
            return Ok(false);
        };

        let call = AssertUnwindSafe(handler.handle(message, cancel)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OutboxError::Cancelled),
            outcome = call => outcome,
        };
        let result = outcome.unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_text(&*panic))));

        match result {
            Ok(()) => {
                let applied = self
                    .write_back(worker_id, message, Resolution::Succeeded)
                    .await?;
                if applied {
                    info!(
                        message_id = message.id.get(),
                        task_type = %message.task_type,
                        "outbox message succeeded"
                    );
                }
                Ok(applied)
            }
            Err(err) => {
                let text = describe_error(&err);
                match self.decider.decide(message, &text) {
                    Decision::Retry {
                        attempt,
                        delay,
                        error,
                    } => {
                        let next_attempt_at = add_duration(self.clock.now(), delay)?;
                        warn!(
                            message_id = message.id.get(),
                            task_type = %message.task_type,
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "outbox message failed, retry scheduled: {text}"
                        );
                        self.write_back(
                            worker_id,
                            message,
                            Resolution::Retry {
                                attempt,
                                next_attempt_at,
                                error,
                            },
                        )
                        .await?;
                    }
                    Decision::MarkDead { attempt, error } => {
                        error!(
                            message_id = message.id.get(),
                            task_type = %message.task_type,
                            attempt,
                            "outbox message failed, giving up: {text}"
                        );
                        self.write_back(worker_id, message, Resolution::Dead { attempt, error })
                            .await?;
                    }
                }
                Ok(false)
            }
        }
    }

    /// ガード付き書き戻し
    /// - 0 行更新 = lease を失った。warn ログのみでエラーにはしない
    async fn write_back(
        &self,
        worker_id: &WorkerId,
        message: &OutboxMessage,
        resolution: Resolution,
    ) -> Result<bool, OutboxError> {
        let status = resolution.status();
        let applied = self
            .store
            .resolve(message.id, worker_id, resolution, self.clock.now())
            .await?;
        if !applied {
            warn!(
                message_id = message.id.get(),
                worker_id = %worker_id,
                status = %status,
                "lease lost before write-back, outcome discarded"
            );
        }
        Ok(applied)
    }
}

fn add_duration(at: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, OutboxError> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| {
            OutboxError::InvalidArgument(format!("duration out of range: {duration:?}"))
        })
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageId, MessageStatus};
    use crate::impls::{InMemoryMessageStore, SqliteMessageStore};
    use crate::ports::{ManualClock, OutboxHandler};
    use crate::tasks::NoopHandler;
    use crate::test_support::{
        CancellingHandler, FlakyHandler, PanickingHandler, RecordingHandler, t0,
    };
    use async_trait::async_trait;

    struct Harness {
        store: InMemoryMessageStore,
        clock: ManualClock,
        processor: OutboxProcessor,
        worker: WorkerId,
    }

    fn options() -> OutboxOptions {
        OutboxOptions {
            backoff_jitter_ms: 0,
            ..OutboxOptions::default()
        }
    }

    fn harness(handlers: Vec<Arc<dyn OutboxHandler>>, options: OutboxOptions) -> Harness {
        let store = InMemoryMessageStore::new();
        let clock = ManualClock::new(t0());
        let mut registry = HandlerRegistry::new();
        for handler in handlers {
            registry.register(handler).unwrap();
        }
        let processor = OutboxProcessor::new(
            Arc::new(store.clone()),
            Arc::new(registry),
            Arc::new(options.decider()),
            options,
            Arc::new(clock.clone()),
        );
        Harness {
            store,
            clock,
            processor,
            worker: WorkerId::new("worker-a"),
        }
    }

    impl Harness {
        async fn enqueue(&self, task_type: &str, max_attempts: u32) -> MessageId {
            let mut new = crate::test_support::new_message(task_type, self.clock.now());
            new.max_attempts = max_attempts;
            self.store.insert(new).await.unwrap()
        }

        async fn run(&self) -> Result<usize, OutboxError> {
            self.processor
                .process_once(&self.worker, &CancellationToken::new())
                .await
        }

        async fn row(&self, id: MessageId) -> OutboxMessage {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn idle_pass_returns_zero_without_writes() {
        let h = harness(vec![Arc::new(NoopHandler::new())], options());
        assert_eq!(h.run().await.unwrap(), 0);
        assert_eq!(h.store.write_count().await, 0);
    }

    #[tokio::test]
    async fn each_message_succeeds_exactly_once() {
        let recorder = RecordingHandler::new("rec");
        let h = harness(vec![recorder.clone()], options());
        let ids = [
            h.enqueue("rec", 5).await,
            h.enqueue("rec", 5).await,
            h.enqueue("rec", 5).await,
        ];

        assert_eq!(h.run().await.unwrap(), 3);
        assert_eq!(h.run().await.unwrap(), 0);

        assert_eq!(recorder.seen().await, ids.to_vec());
        for id in ids {
            let row = h.row(id).await;
            assert_eq!(row.status, MessageStatus::Succeeded);
            assert_eq!(row.attempt, 0);
            assert!(row.locked_by.is_none() && row.locked_until.is_none());
        }
    }

    #[tokio::test]
    async fn batch_size_limits_one_pass() {
        let h = harness(
            vec![Arc::new(NoopHandler::new())],
            OutboxOptions {
                batch_size: 2,
                ..options()
            },
        );
        for _ in 0..5 {
            h.enqueue("noop", 5).await;
        }
        assert_eq!(h.run().await.unwrap(), 2);
        assert_eq!(h.run().await.unwrap(), 2);
        assert_eq!(h.run().await.unwrap(), 1);
        assert_eq!(h.run().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_is_retried_after_backoff_then_succeeds() {
        let flaky = FlakyHandler::new("flaky", 1, "boom");
        let h = harness(vec![flaky.clone()], options());
        let id = h.enqueue("flaky", 5).await;

        assert_eq!(h.run().await.unwrap(), 0);
        let row = h.row(id).await;
        assert_eq!(row.status, MessageStatus::Pending);
        assert_eq!(row.attempt, 1);
        assert_eq!(row.next_attempt_at, t0() + TimeDelta::seconds(2));
        assert_eq!(row.last_error.as_deref(), Some("boom"));
        assert!(row.locked_by.is_none());

        // not due yet
        assert_eq!(h.run().await.unwrap(), 0);
        assert_eq!(flaky.calls(), 1);

        h.clock.advance(TimeDelta::seconds(2));
        assert_eq!(h.run().await.unwrap(), 1);
        let row = h.row(id).await;
        assert_eq!(row.status, MessageStatus::Succeeded);
        assert_eq!(row.attempt, 1);
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_end_in_dead() {
        let failing = FlakyHandler::always("fails", "still broken");
        let h = harness(vec![failing.clone()], options());
        let id = h.enqueue("fails", 2).await;

        h.run().await.unwrap();
        assert_eq!(h.row(id).await.status, MessageStatus::Pending);

        h.clock.advance(TimeDelta::seconds(2));
        h.run().await.unwrap();
        let row = h.row(id).await;
        assert_eq!(row.status, MessageStatus::Dead);
        assert_eq!(row.attempt, 2);
        assert_eq!(row.last_error.as_deref(), Some("still broken"));
        assert!(row.locked_by.is_none());

        h.clock.advance(TimeDelta::hours(1));
        assert_eq!(h.run().await.unwrap(), 0);
        assert_eq!(failing.calls(), 2);
    }

    #[tokio::test]
    async fn unroutable_message_is_dead_immediately() {
        let h = harness(vec![Arc::new(NoopHandler::new())], options());
        let id = h.enqueue("unknown.type", 5).await;

        assert_eq!(h.run().await.unwrap(), 0);
        let row = h.row(id).await;
        assert_eq!(row.status, MessageStatus::Dead);
        assert_eq!(row.attempt, 0);
        assert_eq!(
            row.last_error.as_deref(),
            Some("no handler registered for task type 'unknown.type'")
        );
        assert!(row.locked_by.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_recovered_by_another_worker() {
        let h = harness(
            vec![Arc::new(NoopHandler::new())],
            OutboxOptions {
                lease_duration_ms: 100,
                ..options()
            },
        );
        let id = h.enqueue("noop", 5).await;

        // a worker that claims and then crashes
        let crashed = WorkerId::new("crashed");
        let lease_until = t0() + TimeDelta::milliseconds(100);
        assert!(h.store.try_claim(id, &crashed, t0(), lease_until).await.unwrap());

        assert_eq!(h.run().await.unwrap(), 0);
        h.clock.advance(TimeDelta::milliseconds(100));
        assert_eq!(h.run().await.unwrap(), 0);

        h.clock.advance(TimeDelta::milliseconds(1));
        assert_eq!(h.run().await.unwrap(), 1);
        assert_eq!(h.row(id).await.status, MessageStatus::Succeeded);

        // the crashed worker coming back cannot clobber the result
        let late = h
            .store
            .resolve(
                id,
                &crashed,
                Resolution::Dead {
                    attempt: 9,
                    error: "late".into(),
                },
                h.clock.now(),
            )
            .await
            .unwrap();
        assert!(!late);
        assert_eq!(h.row(id).await.status, MessageStatus::Succeeded);
    }

    #[tokio::test]
    async fn long_error_is_stored_truncated() {
        let long: String = (0..5000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let h = harness(vec![FlakyHandler::always("fails", &long)], options());
        let id = h.enqueue("fails", 5).await;

        h.run().await.unwrap();
        let stored = h.row(id).await.last_error.unwrap();
        assert_eq!(stored.chars().count(), 4000);
        assert_eq!(stored, long[..4000]);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let h = harness(vec![Arc::new(PanickingHandler)], options());
        let id = h.enqueue("panics", 5).await;

        assert_eq!(h.run().await.unwrap(), 0);
        let row = h.row(id).await;
        assert_eq!(row.status, MessageStatus::Pending);
        assert_eq!(row.attempt, 1);
        assert_eq!(
            row.last_error.as_deref(),
            Some("handler panicked: handler exploded")
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_does_nothing() {
        let h = harness(vec![Arc::new(NoopHandler::new())], options());
        h.enqueue("noop", 5).await;
        let writes = h.store.write_count().await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h.processor.process_once(&h.worker, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(h.store.write_count().await, writes);
    }

    #[tokio::test]
    async fn cancellation_mid_batch_leaves_claims_orphaned() {
        let cancel = CancellationToken::new();
        let handler = CancellingHandler::new(cancel.clone());
        let h = harness(vec![handler.clone()], options());
        let first = h.enqueue("cancels", 5).await;
        let second = h.enqueue("cancels", 5).await;

        let err = h.processor.process_once(&h.worker, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(handler.calls(), 1);

        for id in [first, second] {
            let row = h.row(id).await;
            assert_eq!(row.status, MessageStatus::Processing);
            assert!(row.is_locked_by(&h.worker));
            assert_eq!(row.attempt, 0);
        }

        // claimable again once the lease runs out
        h.clock.advance(TimeDelta::seconds(61));
        let candidates = h.store.select_candidates(h.clock.now(), 10).await.unwrap();
        assert_eq!(candidates.len(), 2);
    }

    /// Lets another worker take over the message while it is being handled.
    struct StolenLeaseHandler {
        store: InMemoryMessageStore,
        clock: ManualClock,
    }

    #[async_trait]
    impl OutboxHandler for StolenLeaseHandler {
        fn task_type(&self) -> &str {
            "stolen"
        }

        async fn handle(
            &self,
            message: &OutboxMessage,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            self.clock.advance(TimeDelta::seconds(61));
            let now = self.clock.now();
            let thief = WorkerId::new("thief");
            let took = self
                .store
                .try_claim(message.id, &thief, now, now + TimeDelta::seconds(60))
                .await
                .map_err(|e| HandlerError::failed(e.to_string()))?;
            assert!(took);
            Err(HandlerError::failed("too slow"))
        }
    }

    #[tokio::test]
    async fn lost_lease_write_back_is_discarded() {
        let store = InMemoryMessageStore::new();
        let clock = ManualClock::new(t0());
        let mut registry = HandlerRegistry::new();
        registry
            .register(Arc::new(StolenLeaseHandler {
                store: store.clone(),
                clock: clock.clone(),
            }))
            .unwrap();
        let processor = OutboxProcessor::new(
            Arc::new(store.clone()),
            Arc::new(registry),
            Arc::new(options().decider()),
            options(),
            Arc::new(clock.clone()),
        );
        let id = store
            .insert(crate::test_support::new_message("stolen", t0()))
            .await
            .unwrap();

        let n = processor
            .process_once(&WorkerId::new("slow"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 0);

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Processing);
        assert_eq!(row.locked_by.as_deref(), Some("thief"));
        assert_eq!(row.attempt, 0);
        assert!(row.last_error.is_none());
    }

    #[tokio::test]
    async fn store_failure_is_propagated() {
        let h = harness(vec![Arc::new(NoopHandler::new())], options());
        h.store.set_unavailable(true).await;
        let err = h.run().await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn concurrent_processors_handle_each_message_once() {
        let recorder = RecordingHandler::with_delay("rec", Duration::from_millis(2));
        let store = InMemoryMessageStore::new();
        let clock = ManualClock::new(t0());
        let mut registry = HandlerRegistry::new();
        registry.register(recorder.clone()).unwrap();
        let registry = Arc::new(registry);
        let opts = OutboxOptions {
            batch_size: 4,
            ..options()
        };
        for _ in 0..20 {
            store
                .insert(crate::test_support::new_message("rec", t0()))
                .await
                .unwrap();
        }

        let processors: Vec<_> = (0..3)
            .map(|_| {
                OutboxProcessor::new(
                    Arc::new(store.clone()),
                    Arc::clone(&registry),
                    Arc::new(opts.decider()),
                    opts.clone(),
                    Arc::new(clock.clone()),
                )
            })
            .collect();

        let cancel = CancellationToken::new();
        let (wa, wb, wc) = (WorkerId::new("a"), WorkerId::new("b"), WorkerId::new("c"));
        let mut total = 0;
        loop {
            let (a, b, c) = tokio::join!(
                processors[0].process_once(&wa, &cancel),
                processors[1].process_once(&wb, &cancel),
                processors[2].process_once(&wc, &cancel),
            );
            let round = a.unwrap() + b.unwrap() + c.unwrap();
            if round == 0 {
                break;
            }
            total += round;
        }

        assert_eq!(total, 20);
        let mut seen = recorder.seen().await;
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 20);
        assert_eq!(recorder.seen().await.len(), 20);
    }

    #[tokio::test]
    async fn sqlite_store_end_to_end() {
        let store = Arc::new(SqliteMessageStore::in_memory().await.unwrap());
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler::new())).unwrap();
        let processor = OutboxProcessor::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(options().decider()),
            options(),
            Arc::new(crate::ports::SystemClock),
        );
        let id = store
            .insert(crate::test_support::new_message("noop", t0()))
            .await
            .unwrap();

        let n = processor
            .process_once(&WorkerId::generate(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            MessageStatus::Succeeded
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn processors_sharing_a_file_database_handle_each_message_once() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("outbox.db").display());
        let store: Arc<dyn MessageStore> =
            Arc::new(SqliteMessageStore::connect(&url).await.unwrap());
        for _ in 0..60 {
            store
                .insert(crate::test_support::new_message("rec", t0()))
                .await
                .unwrap();
        }

        let recorder = RecordingHandler::new("rec");
        let mut registry = HandlerRegistry::new();
        registry.register(recorder.clone()).unwrap();
        let registry = Arc::new(registry);
        let opts = OutboxOptions {
            batch_size: 5,
            ..options()
        };

        let mut joins = Vec::new();
        for i in 0..6 {
            let processor = OutboxProcessor::new(
                Arc::clone(&store),
                Arc::clone(&registry),
                Arc::new(opts.decider()),
                opts.clone(),
                Arc::new(crate::ports::SystemClock),
            );
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                let worker = WorkerId::new(format!("w{i}"));
                let cancel = CancellationToken::new();
                let mut handled = 0;
                loop {
                    let n = processor.process_once(&worker, &cancel).await.unwrap();
                    handled += n;
                    if n == 0 {
                        if store.counts_by_status().await.unwrap().is_drained() {
                            return handled;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            }));
        }

        let mut total = 0;
        for join in joins {
            total += tokio::time::timeout(Duration::from_secs(30), join)
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(total, 60);
        let mut seen = recorder.seen().await;
        assert_eq!(seen.len(), 60);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 60);
        assert_eq!(store.counts_by_status().await.unwrap().succeeded, 60);
    }
}
