use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::BoundedLookupCache;
use crate::config::SagaPersistenceConfig;
use crate::index_key::CorrelationValue;
use crate::key::PartitionRowKeyTuple;
use crate::protocol::{ConcurrentInsertProtocol, InsertRequest, SAGA_ID_PROPERTY};
use crate::resolver::{ResolverSettings, SecondaryIndexResolver};
use crate::saga::{
    correlation_value_of, primary_key, to_primary_entity, SagaCorrelationProperty, SagaData,
    SagaInstance, SagaMetadata,
};
use crate::table::{table_name_for, DeleteOutcome, InsertOutcome, ReplaceOutcome, TableStore};
use crate::SagaPersistenceError;

/// SagaPersister は Saga の保存・更新・取得・完了を担うファサード。
///
/// インデックス解決キャッシュはこのインスタンスが所有し、寿命も一致する。
pub struct SagaPersister {
    store: Arc<dyn TableStore>,
    resolver: SecondaryIndexResolver,
    protocol: ConcurrentInsertProtocol,
    table_names: HashMap<String, String>,
}

impl SagaPersister {
    pub fn new(store: Arc<dyn TableStore>, config: &SagaPersistenceConfig) -> Self {
        let cache = Arc::new(BoundedLookupCache::new(config.cache_capacity));
        let settings = ResolverSettings {
            assume_secondary_indices_exist: config.assume_secondary_indices_exist,
            index_lookup: config.index_lookup,
        };
        Self {
            resolver: SecondaryIndexResolver::new(store.clone(), cache, settings),
            protocol: ConcurrentInsertProtocol::new(store.clone()),
            store,
            table_names: config.table_names.clone(),
        }
    }

    /// Saga 型を格納するテーブル名を返す。
    pub fn table_for<T: SagaData>(&self) -> String {
        self.table_names
            .get(T::saga_type())
            .cloned()
            .unwrap_or_else(|| table_name_for(T::saga_type()))
    }

    /// 新しい Saga を保存する。
    ///
    /// 相関値が別の Saga に割り当て済みの場合は `RetryNeeded` を返し、何も書き込まない。
    pub async fn save<T: SagaData>(
        &self,
        saga: &T,
        correlation: Option<&SagaCorrelationProperty>,
    ) -> Result<(), SagaPersistenceError> {
        let table = self.table_for::<T>();
        let saga_id = saga.id();

        let Some(correlation) = correlation else {
            let entity = to_primary_entity(saga, None)?;
            return match self.store.insert_if_absent(&table, entity).await? {
                InsertOutcome::Inserted { .. } => Ok(()),
                InsertOutcome::Conflict => Err(SagaPersistenceError::ConcurrencyConflict {
                    saga_type: T::saga_type().to_string(),
                    saga_id,
                }),
            };
        };

        let metadata = SagaMetadata::of::<T>();
        metadata.ensure_correlates_by(&correlation.name)?;
        let index_key =
            SecondaryIndexResolver::index_key(&metadata, &correlation.name, &correlation.value);
        let primary = to_primary_entity(saga, Some(&index_key))?;

        self.protocol
            .insert(InsertRequest {
                table: &table,
                saga_type: T::saga_type(),
                saga_id,
                index_key: &index_key,
                primary,
            })
            .await?;

        debug!(saga_type = T::saga_type(), saga_id = %saga_id, "Saga を保存しました");
        self.resolver.remember(index_key, saga_id);
        Ok(())
    }

    /// 読み込み時の ETag が一致する場合に限り Saga を更新する。
    pub async fn update<T: SagaData>(
        &self,
        instance: &mut SagaInstance<T>,
    ) -> Result<(), SagaPersistenceError> {
        let table = self.table_for::<T>();
        let entity = to_primary_entity(&instance.data, instance.index_key())?;
        let outcome = self
            .store
            .replace_if_match(&table, entity, instance.etag())
            .await?;
        match outcome {
            ReplaceOutcome::Replaced { etag } => {
                instance.set_etag(etag);
                Ok(())
            }
            ReplaceOutcome::VersionMismatch => Err(SagaPersistenceError::ConcurrencyConflict {
                saga_type: T::saga_type().to_string(),
                saga_id: instance.data.id(),
            }),
        }
    }

    pub async fn get_by_id<T: SagaData>(
        &self,
        saga_id: Uuid,
    ) -> Result<Option<SagaInstance<T>>, SagaPersistenceError> {
        let table = self.table_for::<T>();
        let key = primary_key(saga_id);
        self.store
            .point_read(&table, key.partition_key(), key.row_key())
            .await?
            .map(SagaInstance::from_entity)
            .transpose()
    }

    /// 相関プロパティ値で Saga を取得する。
    ///
    /// 解決した Saga が既に削除されていた場合はキャッシュを無効化して None を返す。
    pub async fn get_by_property<T: SagaData>(
        &self,
        property: &str,
        value: impl Into<CorrelationValue>,
    ) -> Result<Option<SagaInstance<T>>, SagaPersistenceError> {
        let table = self.table_for::<T>();
        let metadata = SagaMetadata::of::<T>();
        let value = value.into();

        let Some(saga_id) = self
            .resolver
            .resolve(&table, &metadata, property, &value)
            .await?
        else {
            return Ok(None);
        };

        let instance = self.get_by_id::<T>(saga_id).await?;
        if instance.is_none() {
            debug!(
                saga_type = T::saga_type(),
                saga_id = %saga_id,
                "解決した Saga は存在しません"
            );
            self.resolver
                .invalidate(&SecondaryIndexResolver::index_key(&metadata, property, &value));
        }
        Ok(instance)
    }

    /// Saga を完了し、セカンダリインデックス行と主行をこの順に削除する。
    /// どちらの行も既に存在しない場合も成功とする。
    ///
    /// インデックス行を先に消すことで、Reconcile が完了済み Saga をスナップショットから
    /// 補完する状態（インデックス行あり・主行なし）を作らない。
    pub async fn complete<T: SagaData>(
        &self,
        instance: &SagaInstance<T>,
    ) -> Result<(), SagaPersistenceError> {
        let table = self.table_for::<T>();
        let saga_id = instance.data.id();

        // 走査で見つかった旧形式の Saga は主行に列を持たないまま補完されている場合がある
        let index_key = match instance.index_key() {
            Some(key) => Some(key.clone()),
            None => correlation_value_of(&instance.data)?.and_then(|value| {
                T::correlation_property().map(|property| {
                    SecondaryIndexResolver::index_key(&SagaMetadata::of::<T>(), property, &value)
                })
            }),
        };
        if let Some(index_key) = &index_key {
            self.remove_secondary_index(&table, index_key, saga_id).await?;
        }

        let key = primary_key(saga_id);
        let outcome = self
            .store
            .delete(&table, key.partition_key(), key.row_key())
            .await?;
        if outcome == DeleteOutcome::NotFound {
            debug!(saga_type = T::saga_type(), saga_id = %saga_id, "Saga は既に削除されています");
        }

        info!(saga_type = T::saga_type(), saga_id = %saga_id, "Saga を完了しました");
        Ok(())
    }

    // 完了後に同じ相関値で作成された別の Saga のインデックス行は削除しない。
    // 所有者の確認と削除の間に行が置き換わった場合は ETag 条件で検出する。
    async fn remove_secondary_index(
        &self,
        table: &str,
        index_key: &PartitionRowKeyTuple,
        saga_id: Uuid,
    ) -> Result<(), SagaPersistenceError> {
        self.resolver.invalidate(index_key);
        let Some(index_row) = self
            .store
            .point_read(table, index_key.partition_key(), index_key.row_key())
            .await?
        else {
            return Ok(());
        };
        let owner = saga_id.to_string();
        let (Some(etag), Some(owner_of_row)) = (
            index_row.etag.as_deref(),
            index_row.get_str(SAGA_ID_PROPERTY),
        ) else {
            return Ok(());
        };
        if owner_of_row != owner {
            debug!(
                index_key = %index_key,
                saga_id = %saga_id,
                "インデックス行は別の Saga を指しているため削除しません"
            );
            return Ok(());
        }
        let outcome = self
            .store
            .delete_if_match(table, index_key.partition_key(), index_key.row_key(), etag)
            .await?;
        if outcome == DeleteOutcome::VersionMismatch {
            debug!(
                index_key = %index_key,
                saga_id = %saga_id,
                "インデックス行が別の Saga に置き換わったため削除しません"
            );
        }
        Ok(())
    }
}
