//! 相関値ごとに高々1つの Saga を作成する挿入プロトコル。
//!
//! インデックス行の insert-if-absent で勝者を決め、敗者は自分の候補 ID での作成を中止して
//! `RetryNeeded` を返す。インデックス行と主行をまたぐトランザクションは存在しないため、
//! 勝者がインデックス行だけを書いて停止した場合に備え、インデックス行に初期状態の
//! スナップショットを持たせ、敗者が勝者に代わって主行を補完する。

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::key::PartitionRowKeyTuple;
use crate::saga::{primary_key, properties_snapshot, SECONDARY_INDEX_KEY_PROPERTY};
use crate::table::{DeleteOutcome, InsertOutcome, TableEntity, TableStore};
use crate::{SagaPersistenceError, TableStoreError};

/// インデックス行が指す Saga ID の列名。
pub const SAGA_ID_PROPERTY: &str = "SagaId";
/// インデックス行が保持する主行スナップショットの列名。
pub const INITIAL_SAGA_DATA_PROPERTY: &str = "InitialSagaData";

/// ReconcileOutcome は挿入競合に敗れた後の整合処理の結果。
/// いずれの場合も呼び出し側には `RetryNeeded` が返る。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 勝者の主行が既に存在する
    WinnerPresent,
    /// 勝者の主行が無かったため、スナップショットから補完した
    WinnerRepaired,
    /// 補完を試みたが、別のワーカーが先に主行を作成していた
    RepairRaced,
    /// 競合したインデックス行が読み込み前に削除されていた
    WinnerVanished,
    /// 勝者の主行が無く、スナップショットも無いため補完できなかった
    NoSnapshot,
    /// スナップショットを持たないインデックス行が完了済みの Saga を指していたため削除した
    OrphanRemoved,
    /// インデックス行に有効な Saga ID が無い
    WinnerUnknown,
    /// 補完後にインデックス行が削除または再作成されていたため、補完した主行を取り消した
    RepairRevoked,
}

/// InsertRequest は新しい Saga を作成するための入力。
#[derive(Debug, Clone)]
pub struct InsertRequest<'a> {
    pub table: &'a str,
    pub saga_type: &'a str,
    pub saga_id: Uuid,
    pub index_key: &'a PartitionRowKeyTuple,
    pub primary: TableEntity,
}

pub struct ConcurrentInsertProtocol {
    store: Arc<dyn TableStore>,
}

impl ConcurrentInsertProtocol {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self { store }
    }

    /// インデックス行を挿入し、成功した場合に限り主行を挿入する。
    ///
    /// インデックス行が既に存在する場合は整合処理を行ったうえで `RetryNeeded` を返し、
    /// 自分の候補 ID の主行は書き込まない。
    pub async fn insert(&self, request: InsertRequest<'_>) -> Result<(), SagaPersistenceError> {
        let InsertRequest {
            table,
            saga_type,
            saga_id,
            index_key,
            primary,
        } = request;

        let index_entity = Self::index_entity(index_key, saga_id, &primary)?;
        match self.store.insert_if_absent(table, index_entity).await? {
            InsertOutcome::Inserted { .. } => {
                debug!(
                    saga_type = saga_type,
                    saga_id = %saga_id,
                    index_key = %index_key,
                    "セカンダリインデックス行を作成しました"
                );
            }
            InsertOutcome::Conflict => {
                let outcome = self.reconcile(table, index_key).await?;
                warn!(
                    saga_type = saga_type,
                    candidate_saga_id = %saga_id,
                    index_key = %index_key,
                    outcome = ?outcome,
                    "相関値は別の Saga に割り当て済みです。メッセージの再実行が必要です"
                );
                return Err(SagaPersistenceError::RetryNeeded {
                    saga_type: saga_type.to_string(),
                    correlation_key: index_key.to_string(),
                    outcome,
                });
            }
        }

        match self.store.insert_if_absent(table, primary).await? {
            InsertOutcome::Inserted { .. } => Ok(()),
            InsertOutcome::Conflict => {
                self.confirm_repaired_primary(table, saga_type, saga_id, index_key)
                    .await
            }
        }
    }

    /// 競合したインデックス行の勝者を確認し、必要なら勝者の主行を補完する。
    pub async fn reconcile(
        &self,
        table: &str,
        index_key: &PartitionRowKeyTuple,
    ) -> Result<ReconcileOutcome, TableStoreError> {
        let Some(index_row) = self
            .store
            .point_read(table, index_key.partition_key(), index_key.row_key())
            .await?
        else {
            return Ok(ReconcileOutcome::WinnerVanished);
        };

        let Some(winner_id) = index_row
            .get_str(SAGA_ID_PROPERTY)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return Ok(ReconcileOutcome::WinnerUnknown);
        };

        let winner_key = primary_key(winner_id);
        if self
            .store
            .point_read(table, winner_key.partition_key(), winner_key.row_key())
            .await?
            .is_some()
        {
            return Ok(ReconcileOutcome::WinnerPresent);
        }

        let Some(snapshot) = index_row.get_str(INITIAL_SAGA_DATA_PROPERTY) else {
            return self.remove_orphan_index_row(table, index_key, &index_row).await;
        };
        let properties: Map<String, Value> = serde_json::from_str(snapshot)?;
        let mut repaired = TableEntity::with_properties(String::new(), String::new(), properties);
        winner_key.apply(&mut repaired);

        let repaired_etag = match self.store.insert_if_absent(table, repaired).await? {
            InsertOutcome::Inserted { etag } => etag,
            InsertOutcome::Conflict => return Ok(ReconcileOutcome::RepairRaced),
        };

        // 読み込み後に勝者の Saga が完了していた場合、補完した行は完了済み Saga の復活になる
        if self.index_row_unchanged(table, index_key, &index_row).await? {
            info!(
                table = table,
                winner_saga_id = %winner_id,
                "勝者の Saga 主行をスナップショットから補完しました"
            );
            return Ok(ReconcileOutcome::WinnerRepaired);
        }
        let revoked = self
            .store
            .delete_if_match(
                table,
                winner_key.partition_key(),
                winner_key.row_key(),
                &repaired_etag,
            )
            .await?;
        warn!(
            table = table,
            winner_saga_id = %winner_id,
            delete_outcome = ?revoked,
            "補完中に勝者の Saga が完了したため、補完した主行を取り消しました"
        );
        Ok(ReconcileOutcome::RepairRevoked)
    }

    // スナップショットの無いインデックス行は既存の主行に対してのみ書かれるため、
    // 主行が無ければ完了済みの Saga を指している
    async fn remove_orphan_index_row(
        &self,
        table: &str,
        index_key: &PartitionRowKeyTuple,
        index_row: &TableEntity,
    ) -> Result<ReconcileOutcome, TableStoreError> {
        let Some(etag) = index_row.etag.as_deref() else {
            return Ok(ReconcileOutcome::NoSnapshot);
        };
        let outcome = self
            .store
            .delete_if_match(table, index_key.partition_key(), index_key.row_key(), etag)
            .await?;
        if outcome == DeleteOutcome::Deleted {
            info!(
                table = table,
                index_key = %index_key,
                "完了済みの Saga を指すインデックス行を削除しました"
            );
            return Ok(ReconcileOutcome::OrphanRemoved);
        }
        Ok(ReconcileOutcome::NoSnapshot)
    }

    async fn index_row_unchanged(
        &self,
        table: &str,
        index_key: &PartitionRowKeyTuple,
        observed: &TableEntity,
    ) -> Result<bool, TableStoreError> {
        let current = self
            .store
            .point_read(table, index_key.partition_key(), index_key.row_key())
            .await?;
        Ok(current.is_some_and(|row| row.etag == observed.etag))
    }

    /// 候補 Saga を指すインデックス行を構築する。主行のスナップショットを含める。
    pub fn index_entity(
        index_key: &PartitionRowKeyTuple,
        saga_id: Uuid,
        primary: &TableEntity,
    ) -> Result<TableEntity, serde_json::Error> {
        let snapshot = serde_json::to_string(&properties_snapshot(primary))?;
        let mut entity = TableEntity::new(String::new(), String::new());
        index_key.apply(&mut entity);
        entity.set(SAGA_ID_PROPERTY, saga_id.to_string());
        entity.set(INITIAL_SAGA_DATA_PROPERTY, snapshot);
        Ok(entity)
    }

    // インデックス行の挿入後に主行が競合した場合、別ワーカーがスナップショットから
    // 補完した行であれば作成済みとみなす。
    async fn confirm_repaired_primary(
        &self,
        table: &str,
        saga_type: &str,
        saga_id: Uuid,
        index_key: &PartitionRowKeyTuple,
    ) -> Result<(), SagaPersistenceError> {
        let key = primary_key(saga_id);
        let existing = self
            .store
            .point_read(table, key.partition_key(), key.row_key())
            .await?;
        let expected = index_key.to_string();
        match existing {
            Some(row) if row.get_str(SECONDARY_INDEX_KEY_PROPERTY) == Some(expected.as_str()) => {
                debug!(
                    saga_type = saga_type,
                    saga_id = %saga_id,
                    "Saga 主行は別のワーカーによって補完済みです"
                );
                Ok(())
            }
            _ => Err(SagaPersistenceError::ConcurrencyConflict {
                saga_type: saga_type.to_string(),
                saga_id,
            }),
        }
    }
}
