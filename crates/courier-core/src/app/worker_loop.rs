//! WorkerLoop - キャンセルされるまで processor を回す
//!
//! # 処理の流れ
//! 1. `process_once`
//! 2. 0 件: `poll_interval` だけ sleep
//! 3. 1 件以上: すぐ次のパスへ
//! 4. エラー: ログを出して `error_cooldown` だけ sleep し、続行
//!
//! sleep は常にキャンセルトークンと競争させる。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::processor::OutboxProcessor;
use crate::domain::WorkerId;

/// What a loop did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Messages that reached Succeeded.
    pub processed: usize,
    /// Passes that ended in a (non-cancellation) error.
    pub failed_iterations: usize,
}

impl WorkerReport {
    pub fn merge(&mut self, other: WorkerReport) {
        self.processed += other.processed;
        self.failed_iterations += other.failed_iterations;
    }
}

pub struct WorkerLoop {
    processor: Arc<OutboxProcessor>,
    worker_id: WorkerId,
    poll_interval: Duration,
    error_cooldown: Duration,
}

impl WorkerLoop {
    /// Intervals are taken from the processor's options.
    pub fn new(processor: Arc<OutboxProcessor>, worker_id: WorkerId) -> Self {
        let poll_interval = processor.options().poll_interval();
        let error_cooldown = processor.options().error_cooldown();
        Self {
            processor,
            worker_id,
            poll_interval,
            error_cooldown,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> WorkerReport {
        info!(worker_id = %self.worker_id, "outbox worker started");
        let mut report = WorkerReport::default();

        loop {
            match self.processor.process_once(&self.worker_id, cancel).await {
                Ok(0) => {
                    if !sleep_or_cancel(self.poll_interval, cancel).await {
                        break;
                    }
                }
                Ok(n) => report.processed += n,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    report.failed_iterations += 1;
                    error!(
                        worker_id = %self.worker_id,
                        error = %e,
                        "outbox processing failed, cooling down"
                    );
                    if !sleep_or_cancel(self.error_cooldown, cancel).await {
                        break;
                    }
                }
            }
        }

        info!(
            worker_id = %self.worker_id,
            processed = report.processed,
            failed_iterations = report.failed_iterations,
            "outbox worker stopped"
        );
        report
    }
}

/// `false` if cancelled before `duration` elapsed.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Worker group handle.
/// - 1 つの processor を `n` 本のループで回す（id は `<base>#<i>`）
/// - トークン 1 つで全ループが止まる
/// - `shutdown_and_join()` で全ループの終了を待てる
pub struct WorkerGroup {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<WorkerReport>>,
}

impl WorkerGroup {
    /// Spawn `n` loops on the current runtime.
    pub fn spawn(n: usize, processor: Arc<OutboxProcessor>, base_worker_id: &WorkerId) -> Self {
        Self::spawn_with_token(n, processor, base_worker_id, CancellationToken::new())
    }

    /// Like `spawn`, stopping when `parent` is cancelled too.
    pub fn spawn_with_token(
        n: usize,
        processor: Arc<OutboxProcessor>,
        base_worker_id: &WorkerId,
        parent: CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let joins = (0..n)
            .map(|i| {
                let worker = WorkerLoop::new(Arc::clone(&processor), base_worker_id.with_suffix(i));
                let cancel = cancel.clone();
                tokio::spawn(async move { worker.run(&cancel).await })
            })
            .collect();

        Self { cancel, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request shutdown for all loops. In-flight handlers are abandoned at
    /// their next await; their leases expire on their own.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for every loop to stop (without requesting it).
    pub async fn join(self) -> WorkerReport {
        let mut total = WorkerReport::default();
        for join in self.joins {
            match join.await {
                Ok(report) => total.merge(report),
                Err(e) => error!(error = %e, "outbox worker task failed"),
            }
        }
        total
    }

    /// Shutdown and wait for all loops.
    pub async fn shutdown_and_join(self) -> WorkerReport {
        self.request_shutdown();
        self.join().await
    }
}
