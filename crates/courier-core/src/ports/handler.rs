//! Handler port - メッセージ 1 件に対して実行する副作用

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{HandlerError, OutboxMessage};

/// OutboxHandler は 1 つの task_type の処理を担う
///
/// # 配送保証
/// - at-least-once: クラッシュや lease 切れの後、同じメッセージが再度 `handle` に渡る
/// - 実装は繰り返し呼ばれても問題ないこと
///
/// # キャンセル
/// - `cancel` はワーカー停止時に発火する
/// - 途中で止められる handler は監視すること（processor 側も待つのをやめる）
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    /// The task type this handler is registered under.
    fn task_type(&self) -> &str;

    async fn handle(
        &self,
        message: &OutboxMessage,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}
