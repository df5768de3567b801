//! 相関プロパティ値から Saga ID を解決する。
//!
//! キャッシュ → インデックス行の読み込み → (互換モード) 旧形式のインデックス行 →
//! (インデックスの存在を仮定しない場合) 全件走査、の順に試し、最初に見つかった結果を返す。

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::BoundedLookupCache;
use crate::config::IndexLookupMode;
use crate::index_key::{build_key, CorrelationValue, IndexRowKey};
use crate::key::PartitionRowKeyTuple;
use crate::protocol::SAGA_ID_PROPERTY;
use crate::saga::{saga_id_of, SagaMetadata, SECONDARY_INDEX_KEY_PROPERTY};
use crate::table::{InsertOutcome, TableEntity, TableStore};
use crate::{SagaPersistenceError, TableStoreError};

/// ResolverSettings は解決手順の分岐を決める設定。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverSettings {
    pub assume_secondary_indices_exist: bool,
    pub index_lookup: IndexLookupMode,
}

pub struct SecondaryIndexResolver {
    store: Arc<dyn TableStore>,
    cache: Arc<BoundedLookupCache<PartitionRowKeyTuple, Uuid>>,
    settings: ResolverSettings,
}

impl SecondaryIndexResolver {
    pub fn new(
        store: Arc<dyn TableStore>,
        cache: Arc<BoundedLookupCache<PartitionRowKeyTuple, Uuid>>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            store,
            cache,
            settings,
        }
    }

    /// キャッシュのキーでもある、既定規約のインデックスキーを返す。
    pub fn index_key(
        metadata: &SagaMetadata,
        property: &str,
        value: &CorrelationValue,
    ) -> PartitionRowKeyTuple {
        build_key(&metadata.saga_type, property, value, IndexRowKey::Empty)
    }

    /// 相関プロパティ値に対応する Saga ID を解決する。見つからなければ None。
    pub async fn resolve(
        &self,
        table: &str,
        metadata: &SagaMetadata,
        property: &str,
        value: &CorrelationValue,
    ) -> Result<Option<Uuid>, SagaPersistenceError> {
        metadata.ensure_correlates_by(property)?;
        let key = Self::index_key(metadata, property, value);

        if let Some(saga_id) = self.cache.try_get(&key) {
            debug!(index_key = %key, saga_id = %saga_id, "インデックスキャッシュにヒットしました");
            return Ok(Some(saga_id));
        }

        if let Some(saga_id) = self.read_index_row(table, &key).await? {
            return Ok(Some(self.remember(key, saga_id)));
        }

        if self.settings.index_lookup == IndexLookupMode::WithSagaIdRowKeyFallback {
            if let Some(saga_id) = self
                .read_saga_id_row_key_index(table, metadata, property, &key)
                .await?
            {
                return Ok(Some(self.remember(key, saga_id)));
            }
        }

        if self.settings.assume_secondary_indices_exist {
            debug!(index_key = %key, "インデックス行が存在しないため未検出とします");
            return Ok(None);
        }

        let Some(row) = self.scan(table, metadata, property, value).await? else {
            return Ok(None);
        };
        let Some(saga_id) = saga_id_of(&row) else {
            return Ok(None);
        };
        // インデックス列を持たない旧形式の行のみ補完する。列を持つ行は完了処理の途中であり得る
        if row.get(SECONDARY_INDEX_KEY_PROPERTY).is_none() {
            if let Err(e) = self.backfill_index_row(table, &key, saga_id, &row).await {
                warn!(index_key = %key, saga_id = %saga_id, error = %e, "インデックス行の補完に失敗しました");
            }
        }
        Ok(Some(self.remember(key, saga_id)))
    }

    /// 解決済みの結果をキャッシュから除去する。
    pub fn invalidate(&self, key: &PartitionRowKeyTuple) {
        if self.cache.remove(key).is_some() {
            debug!(index_key = %key, "インデックスキャッシュを無効化しました");
        }
    }

    /// 解決結果をキャッシュに記録する。
    pub fn remember(&self, key: PartitionRowKeyTuple, saga_id: Uuid) -> Uuid {
        self.cache.put(key, saga_id);
        saga_id
    }

    async fn read_index_row(
        &self,
        table: &str,
        key: &PartitionRowKeyTuple,
    ) -> Result<Option<Uuid>, SagaPersistenceError> {
        match self
            .store
            .point_read(table, key.partition_key(), key.row_key())
            .await
        {
            Ok(Some(row)) => Ok(index_row_saga_id(&row)),
            Ok(None) => Ok(None),
            // 行の不在と区別できるクライアントエラーは後続の手順で解決を試みる
            Err(TableStoreError::InvalidKey { .. }) => {
                debug!(index_key = %key, "インデックスキーがストアに拒否されました");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_saga_id_row_key_index(
        &self,
        table: &str,
        metadata: &SagaMetadata,
        property: &str,
        key: &PartitionRowKeyTuple,
    ) -> Result<Option<Uuid>, SagaPersistenceError> {
        let rows = match self.store.query_partition(table, key.partition_key()).await {
            Ok(rows) => rows,
            Err(TableStoreError::InvalidKey { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // 旧形式の行は SagaId 列を持たないことがあるため、行キーを先に解釈する
        let mut saga_ids: Vec<Uuid> = rows
            .iter()
            .filter(|row| !row.row_key.is_empty())
            .filter_map(|row| {
                Uuid::parse_str(&row.row_key)
                    .ok()
                    .or_else(|| saga_id_column(row))
            })
            .collect();
        saga_ids.sort_unstable();
        saga_ids.dedup();
        single_match(metadata, property, saga_ids)
    }

    async fn scan(
        &self,
        table: &str,
        metadata: &SagaMetadata,
        property: &str,
        value: &CorrelationValue,
    ) -> Result<Option<TableEntity>, SagaPersistenceError> {
        warn!(
            saga_type = %metadata.saga_type,
            property = property,
            value = %value,
            "セカンダリインデックスが見つからないためテーブル全件を走査します。高コストな操作です"
        );
        let rows = self
            .store
            .scan_by_property(table, property, &value.to_json_value())
            .await?;
        let mut saga_ids: Vec<Uuid> = rows.iter().filter_map(saga_id_of).collect();
        saga_ids.sort_unstable();
        saga_ids.dedup();
        let Some(saga_id) = single_match(metadata, property, saga_ids)? else {
            return Ok(None);
        };
        Ok(rows.into_iter().find(|row| saga_id_of(row) == Some(saga_id)))
    }

    /// 走査で見つかった旧形式の Saga にインデックス行を補完し、次回以降の走査を不要にする。
    ///
    /// 補完した行はスナップショットを持たないため、Reconcile が完了済みの Saga を
    /// 復元することはない。挿入後に主行が消えていた場合は補完を取り消す。
    async fn backfill_index_row(
        &self,
        table: &str,
        key: &PartitionRowKeyTuple,
        saga_id: Uuid,
        primary: &TableEntity,
    ) -> Result<(), TableStoreError> {
        let mut index_row = TableEntity::new(String::new(), String::new());
        key.apply(&mut index_row);
        index_row.set(SAGA_ID_PROPERTY, saga_id.to_string());

        let etag = match self.store.insert_if_absent(table, index_row).await? {
            InsertOutcome::Inserted { etag } => etag,
            InsertOutcome::Conflict => return Ok(()),
        };
        if self
            .store
            .point_read(table, &primary.partition_key, &primary.row_key)
            .await?
            .is_some()
        {
            info!(index_key = %key, saga_id = %saga_id, "旧形式の Saga にインデックス行を補完しました");
            return Ok(());
        }
        self.store
            .delete_if_match(table, key.partition_key(), key.row_key(), &etag)
            .await?;
        debug!(index_key = %key, saga_id = %saga_id, "Saga が完了していたため補完したインデックス行を取り消しました");
        Ok(())
    }
}

fn saga_id_column(row: &TableEntity) -> Option<Uuid> {
    row.get_str(SAGA_ID_PROPERTY)
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn index_row_saga_id(row: &TableEntity) -> Option<Uuid> {
    let saga_id = saga_id_column(row);
    if saga_id.is_none() {
        warn!(
            partition_key = %row.partition_key,
            row_key = %row.row_key,
            "インデックス行に有効な Saga ID がありません"
        );
    }
    saga_id
}

fn single_match(
    metadata: &SagaMetadata,
    property: &str,
    saga_ids: Vec<Uuid>,
) -> Result<Option<Uuid>, SagaPersistenceError> {
    match saga_ids.len() {
        0 | 1 => Ok(saga_ids.first().copied()),
        _ => Err(SagaPersistenceError::DuplicateCorrelation {
            saga_type: metadata.saga_type.clone(),
            property: property.to_string(),
            saga_ids,
        }),
    }
}
