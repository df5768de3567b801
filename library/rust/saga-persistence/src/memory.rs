use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::table::{DeleteOutcome, InsertOutcome, ReplaceOutcome, TableEntity, TableStore};
use crate::TableStoreError;

type Table = BTreeMap<(String, String), TableEntity>;

/// StoreCallCounts は操作ごとの呼び出し回数のスナップショット。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub inserts: u64,
    pub point_reads: u64,
    pub replaces: u64,
    pub deletes: u64,
    pub scans: u64,
    pub partition_queries: u64,
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    point_reads: AtomicU64,
    replaces: AtomicU64,
    deletes: AtomicU64,
    scans: AtomicU64,
    partition_queries: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// InMemoryTableStore はプロセス内で動作するテーブルストア実装。
/// テストとローカル開発用。書き込みのたびに新しい ETag を払い出す。
#[derive(Clone)]
pub struct InMemoryTableStore {
    tables: Arc<RwLock<HashMap<String, Table>>>,
    counters: Arc<Counters>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn call_counts(&self) -> StoreCallCounts {
        let c = &self.counters;
        StoreCallCounts {
            inserts: c.inserts.load(Ordering::Relaxed),
            point_reads: c.point_reads.load(Ordering::Relaxed),
            replaces: c.replaces.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            scans: c.scans.load(Ordering::Relaxed),
            partition_queries: c.partition_queries.load(Ordering::Relaxed),
        }
    }

    /// テーブル内の行数を返す。
    pub async fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.read().await;
        tables.get(table).map_or(0, BTreeMap::len)
    }

    fn new_etag() -> String {
        format!("W/\"{}\"", Uuid::new_v4())
    }
}

impl Default for InMemoryTableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn insert_if_absent(
        &self,
        table: &str,
        mut entity: TableEntity,
    ) -> Result<InsertOutcome, TableStoreError> {
        Counters::bump(&self.counters.inserts);
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        if rows.contains_key(&key) {
            return Ok(InsertOutcome::Conflict);
        }
        let etag = Self::new_etag();
        entity.etag = Some(etag.clone());
        rows.insert(key, entity);
        Ok(InsertOutcome::Inserted { etag })
    }

    async fn point_read(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>, TableStoreError> {
        Counters::bump(&self.counters.point_reads);
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .and_then(|rows| rows.get(&(partition_key.to_string(), row_key.to_string())))
            .cloned())
    }

    async fn replace_if_match(
        &self,
        table: &str,
        mut entity: TableEntity,
        expected_etag: &str,
    ) -> Result<ReplaceOutcome, TableStoreError> {
        Counters::bump(&self.counters.replaces);
        let mut tables = self.tables.write().await;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        let Some(current) = tables.get_mut(table).and_then(|rows| rows.get_mut(&key)) else {
            return Ok(ReplaceOutcome::VersionMismatch);
        };
        if current.etag.as_deref() != Some(expected_etag) {
            return Ok(ReplaceOutcome::VersionMismatch);
        }
        let etag = Self::new_etag();
        entity.etag = Some(etag.clone());
        *current = entity;
        Ok(ReplaceOutcome::Replaced { etag })
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<DeleteOutcome, TableStoreError> {
        Counters::bump(&self.counters.deletes);
        let mut tables = self.tables.write().await;
        let removed = tables
            .get_mut(table)
            .and_then(|rows| rows.remove(&(partition_key.to_string(), row_key.to_string())));
        Ok(match removed {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn delete_if_match(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected_etag: &str,
    ) -> Result<DeleteOutcome, TableStoreError> {
        Counters::bump(&self.counters.deletes);
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(DeleteOutcome::NotFound);
        };
        let key = (partition_key.to_string(), row_key.to_string());
        match rows.get(&key) {
            None => Ok(DeleteOutcome::NotFound),
            Some(current) if current.etag.as_deref() != Some(expected_etag) => {
                Ok(DeleteOutcome::VersionMismatch)
            }
            Some(_) => {
                rows.remove(&key);
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    async fn scan_by_property(
        &self,
        table: &str,
        property: &str,
        value: &Value,
    ) -> Result<Vec<TableEntity>, TableStoreError> {
        Counters::bump(&self.counters.scans);
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|e| e.get(property) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<TableEntity>, TableStoreError> {
        Counters::bump(&self.counters.partition_queries);
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|e| e.partition_key == partition_key)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
