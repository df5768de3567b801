use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::SagaPersistenceError;

/// 永続化操作をキャンセルトークンと競合させる。
///
/// トークンが先にキャンセルされた場合、操作の Future は破棄され `Cancelled` を返す。
/// 書き込み済みの行は残るが、どの時点で中断しても後続の試行が Reconcile で回復できる。
pub async fn cancellable<T, F>(
    token: &CancellationToken,
    operation: F,
) -> Result<T, SagaPersistenceError>
where
    F: Future<Output = Result<T, SagaPersistenceError>>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(SagaPersistenceError::Cancelled),
        result = operation => result,
    }
}
