use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ReconcileOutcome;

/// TableStoreError はテーブルストア操作の失敗を表す。
/// 行の不在・挿入競合・バージョン不一致は操作結果の列挙型で表現し、ここには含めない。
#[derive(Debug, Error)]
pub enum TableStoreError {
    #[error("接続エラー: {0}")]
    Connection(String),
    #[error("スロットリングされました: {0}")]
    Throttled(String),
    #[error("アクセスが拒否されました: {0}")]
    Forbidden(String),
    /// キーに使用できない文字が含まれるなど、行の不在と区別できるクライアントエラー
    #[error("無効なキーです: partition_key={partition_key}, row_key={row_key}")]
    InvalidKey {
        partition_key: String,
        row_key: String,
    },
    #[error("シリアライズエラー: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("ストレージエラー: {0}")]
    StorageError(String),
}

impl TableStoreError {
    /// 再試行で回復し得る一時的なエラーかどうか判定する。
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Throttled(_))
    }
}

/// SagaPersistenceError は Saga 永続化ファサードが返すエラーを表す。
#[derive(Debug, Error)]
pub enum SagaPersistenceError {
    /// 相関値が別の Saga に割り当て済み。メッセージ全体を再実行する必要がある。
    #[error(
        "再試行が必要です: saga_type={saga_type}, correlation_key={correlation_key}, outcome={outcome:?}"
    )]
    RetryNeeded {
        saga_type: String,
        correlation_key: String,
        outcome: ReconcileOutcome,
    },
    #[error(
        "同じ相関値を持つ Saga が複数存在します: saga_type={saga_type}, property={property}, saga_ids={saga_ids:?}"
    )]
    DuplicateCorrelation {
        saga_type: String,
        property: String,
        saga_ids: Vec<Uuid>,
    },
    #[error("バージョン競合: saga_type={saga_type}, saga_id={saga_id}")]
    ConcurrencyConflict { saga_type: String, saga_id: Uuid },
    #[error("構成エラー: {0}")]
    Configuration(String),
    #[error("シリアライズエラー: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("操作がキャンセルされました")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] TableStoreError),
}

impl SagaPersistenceError {
    /// ホストのメッセージ再試行機構で再ディスパッチすべきエラーかどうか判定する。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RetryNeeded { .. } | Self::ConcurrencyConflict { .. } => true,
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
