use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::TableStoreError;

/// TableEntity はテーブルストアの1行を表す。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    /// ストアが払い出すバージョントークン（未保存の行は None）
    pub etag: Option<String>,
    pub properties: Map<String, Value>,
}

impl TableEntity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            etag: None,
            properties: Map::new(),
        }
    }

    pub fn with_properties(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
        properties: Map<String, Value>,
    ) -> Self {
        Self {
            properties,
            ..Self::new(partition_key, row_key)
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }
}

/// InsertOutcome は挿入（存在しない場合のみ）の結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { etag: String },
    /// 同じキーの行が既に存在する
    Conflict,
}

/// ReplaceOutcome は条件付き置換の結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced { etag: String },
    /// ETag が一致しない、または行が存在しない
    VersionMismatch,
}

/// DeleteOutcome は削除の結果。呼び出し側は NotFound を成功として扱う。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// 条件付き削除で ETag が一致しなかった（行は残っている）
    VersionMismatch,
}

/// TableStore は Saga 行とセカンダリインデックス行を格納するキーバリューテーブルの抽象。
/// 行単位の原子的な insert-if-absent が唯一の同期プリミティブとなる。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait TableStore: Send + Sync {
    /// 同じ (partition_key, row_key) の行が無い場合に限り挿入する。
    async fn insert_if_absent(
        &self,
        table: &str,
        entity: TableEntity,
    ) -> Result<InsertOutcome, TableStoreError>;

    /// (partition_key, row_key) で1行を読み込む。
    async fn point_read(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>, TableStoreError>;

    /// 現在の ETag が expected_etag と一致する場合に限り行を置換する。
    async fn replace_if_match(
        &self,
        table: &str,
        entity: TableEntity,
        expected_etag: &str,
    ) -> Result<ReplaceOutcome, TableStoreError>;

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<DeleteOutcome, TableStoreError>;

    /// 現在の ETag が expected_etag と一致する場合に限り行を削除する。
    async fn delete_if_match(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected_etag: &str,
    ) -> Result<DeleteOutcome, TableStoreError>;

    /// プロパティ値が一致する全行を返す。テーブル全体を走査するため高コスト。
    async fn scan_by_property(
        &self,
        table: &str,
        property: &str,
        value: &Value,
    ) -> Result<Vec<TableEntity>, TableStoreError>;

    /// 1パーティション内の全行を返す。
    async fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<TableEntity>, TableStoreError>;
}

/// Saga 型名からテーブル名を導出する（英数字以外を除去する）。
pub fn table_name_for(saga_type: &str) -> String {
    saga_type.chars().filter(char::is_ascii_alphanumeric).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_strips_non_alphanumerics() {
        assert_eq!(table_name_for("Acme.Sales.OrderSagaData"), "AcmeSalesOrderSagaData");
        assert_eq!(table_name_for("Outer+Inner_Data"), "OuterInnerData");
    }

    #[test]
    fn test_entity_properties() {
        let mut entity = TableEntity::new("pk", "rk");
        entity.set("OrderId", "ORDER-42");
        entity.set("Total", 10);
        assert_eq!(entity.get_str("OrderId"), Some("ORDER-42"));
        assert_eq!(entity.get("Total"), Some(&Value::from(10)));
        assert!(entity.get_str("Total").is_none());
        assert!(entity.etag.is_none());
    }

    #[tokio::test]
    async fn test_mock_point_read_not_found() {
        let mut mock = MockTableStore::new();
        mock.expect_point_read()
            .withf(|table, pk, rk| table == "Orders" && pk == "a" && rk.is_empty())
            .returning(|_, _, _| Ok(None));

        let result = mock.point_read("Orders", "a", "").await.unwrap();
        assert!(result.is_none());
    }
}
