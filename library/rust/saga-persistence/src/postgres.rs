//! PostgresTableStore: sqlx を使用した TableStore 実装。
//! feature = "postgres" で有効化される。

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::table::{DeleteOutcome, InsertOutcome, ReplaceOutcome, TableEntity, TableStore};
use crate::TableStoreError;

/// PostgresTableStore は全テーブルの行を1つの PostgreSQL テーブルに格納する。
///
/// insert-if-absent は主キー制約と `ON CONFLICT DO NOTHING`、
/// 条件付き置換は `etag` 列を条件にした UPDATE で実現する。
#[derive(Clone)]
pub struct PostgresTableStore {
    pool: PgPool,
}

impl PostgresTableStore {
    /// データベース URL から接続プールを作成する。
    pub async fn new(database_url: &str) -> Result<Self, TableStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 行テーブルとプロパティ検索用インデックスが無ければ作成する。
    pub async fn migrate(&self) -> Result<(), TableStoreError> {
        for statement in [CREATE_ROWS_TABLE, CREATE_PROPERTIES_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }
}

const CREATE_ROWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS saga_table_rows (
    table_name TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    row_key TEXT NOT NULL,
    etag TEXT NOT NULL,
    properties JSONB NOT NULL DEFAULT '{}',
    PRIMARY KEY (table_name, partition_key, row_key)
)
"#;

const CREATE_PROPERTIES_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_saga_table_rows_properties
    ON saga_table_rows USING GIN (properties)
"#;

fn map_sqlx_error(e: sqlx::Error) -> TableStoreError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            TableStoreError::Connection(e.to_string())
        }
        other => TableStoreError::StorageError(other.to_string()),
    }
}

fn new_etag() -> String {
    format!("W/\"{}\"", Uuid::new_v4())
}

fn row_to_entity(row: &PgRow) -> Result<TableEntity, TableStoreError> {
    let properties = match row.try_get::<Value, _>("properties").map_err(map_sqlx_error)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(TableStoreError::StorageError(format!(
                "properties 列がオブジェクトではありません: {other}"
            )))
        }
    };
    Ok(TableEntity {
        partition_key: row.try_get("partition_key").map_err(map_sqlx_error)?,
        row_key: row.try_get("row_key").map_err(map_sqlx_error)?,
        etag: Some(row.try_get("etag").map_err(map_sqlx_error)?),
        properties,
    })
}

#[async_trait]
impl TableStore for PostgresTableStore {
    async fn insert_if_absent(
        &self,
        table: &str,
        entity: TableEntity,
    ) -> Result<InsertOutcome, TableStoreError> {
        let etag = new_etag();
        let result = sqlx::query(
            r#"INSERT INTO saga_table_rows (table_name, partition_key, row_key, etag, properties)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (table_name, partition_key, row_key) DO NOTHING"#,
        )
        .bind(table)
        .bind(&entity.partition_key)
        .bind(&entity.row_key)
        .bind(&etag)
        .bind(Value::Object(entity.properties))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Ok(InsertOutcome::Conflict);
        }
        Ok(InsertOutcome::Inserted { etag })
    }

    async fn point_read(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>, TableStoreError> {
        let row = sqlx::query(
            r#"SELECT partition_key, row_key, etag, properties
               FROM saga_table_rows
               WHERE table_name = $1 AND partition_key = $2 AND row_key = $3"#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(row_to_entity).transpose()
    }

    async fn replace_if_match(
        &self,
        table: &str,
        entity: TableEntity,
        expected_etag: &str,
    ) -> Result<ReplaceOutcome, TableStoreError> {
        let etag = new_etag();
        let result = sqlx::query(
            r#"UPDATE saga_table_rows
               SET etag = $1, properties = $2
               WHERE table_name = $3 AND partition_key = $4 AND row_key = $5 AND etag = $6"#,
        )
        .bind(&etag)
        .bind(Value::Object(entity.properties))
        .bind(table)
        .bind(&entity.partition_key)
        .bind(&entity.row_key)
        .bind(expected_etag)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Ok(ReplaceOutcome::VersionMismatch);
        }
        Ok(ReplaceOutcome::Replaced { etag })
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<DeleteOutcome, TableStoreError> {
        let result = sqlx::query(
            r#"DELETE FROM saga_table_rows
               WHERE table_name = $1 AND partition_key = $2 AND row_key = $3"#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(if result.rows_affected() == 0 {
            DeleteOutcome::NotFound
        } else {
            DeleteOutcome::Deleted
        })
    }

    async fn delete_if_match(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected_etag: &str,
    ) -> Result<DeleteOutcome, TableStoreError> {
        let result = sqlx::query(
            r#"DELETE FROM saga_table_rows
               WHERE table_name = $1 AND partition_key = $2 AND row_key = $3 AND etag = $4"#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(expected_etag)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() > 0 {
            return Ok(DeleteOutcome::Deleted);
        }
        // 不一致と不在を区別するため現在の行を確認する
        let exists: Option<i32> = sqlx::query_scalar(
            r#"SELECT 1 FROM saga_table_rows
               WHERE table_name = $1 AND partition_key = $2 AND row_key = $3"#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(match exists {
            Some(_) => DeleteOutcome::VersionMismatch,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn scan_by_property(
        &self,
        table: &str,
        property: &str,
        value: &Value,
    ) -> Result<Vec<TableEntity>, TableStoreError> {
        let rows = sqlx::query(
            r#"SELECT partition_key, row_key, etag, properties
               FROM saga_table_rows
               WHERE table_name = $1 AND properties -> $2 = $3
               ORDER BY partition_key, row_key"#,
        )
        .bind(table)
        .bind(property)
        .bind(value)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(row_to_entity).collect()
    }

    async fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<TableEntity>, TableStoreError> {
        let rows = sqlx::query(
            r#"SELECT partition_key, row_key, etag, properties
               FROM saga_table_rows
               WHERE table_name = $1 AND partition_key = $2
               ORDER BY row_key"#,
        )
        .bind(table)
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(row_to_entity).collect()
    }
}
