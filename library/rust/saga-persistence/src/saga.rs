use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::index_key::CorrelationValue;
use crate::key::PartitionRowKeyTuple;
use crate::table::TableEntity;
use crate::SagaPersistenceError;

/// Saga 行にセカンダリインデックス行のキーを保持する列名。
pub const SECONDARY_INDEX_KEY_PROPERTY: &str = "NServiceBus_2ndIndexKey";

/// SagaData は永続化対象の Saga 状態が実装するトレイト。
///
/// 相関プロパティは Saga 型ごとに高々1つ。プロパティ名は直列化後の JSON フィールド名と
/// 一致させること（全件走査のフォールバックは列名で検索する）。
pub trait SagaData: Serialize + DeserializeOwned + Send + Sync {
    /// 完全修飾された Saga 型名。インデックスキーとテーブル名の導出に使う。
    fn saga_type() -> &'static str;

    /// 一意な相関プロパティ名。宣言しない Saga 型は None。
    fn correlation_property() -> Option<&'static str> {
        None
    }

    fn id(&self) -> Uuid;
}

/// SagaMetadata は Saga 型から一度だけ導出する型情報。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaMetadata {
    pub saga_type: String,
    pub correlation_property: Option<String>,
}

impl SagaMetadata {
    pub fn of<T: SagaData>() -> Self {
        Self {
            saga_type: T::saga_type().to_string(),
            correlation_property: T::correlation_property().map(str::to_string),
        }
    }

    /// 指定プロパティが宣言済みの相関プロパティであることを検証する。
    pub fn ensure_correlates_by(&self, property: &str) -> Result<(), SagaPersistenceError> {
        match self.correlation_property.as_deref() {
            None => Err(SagaPersistenceError::Configuration(format!(
                "Saga 型 {} は相関プロパティを宣言していません",
                self.saga_type
            ))),
            Some(declared) if declared != property => {
                Err(SagaPersistenceError::Configuration(format!(
                    "Saga 型 {} の相関プロパティは {} ですが {} で検索されました",
                    self.saga_type, declared, property
                )))
            }
            Some(_) => Ok(()),
        }
    }
}

/// SagaCorrelationProperty は保存時に渡す相関プロパティの名前と値。
#[derive(Debug, Clone, PartialEq)]
pub struct SagaCorrelationProperty {
    pub name: String,
    pub value: CorrelationValue,
}

impl SagaCorrelationProperty {
    pub fn new(name: impl Into<String>, value: impl Into<CorrelationValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// SagaInstance は読み込んだ Saga 状態と、更新・完了に必要な行情報を保持する。
#[derive(Debug, Clone)]
pub struct SagaInstance<T> {
    pub data: T,
    etag: String,
    index_key: Option<PartitionRowKeyTuple>,
}

impl<T: SagaData> SagaInstance<T> {
    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn index_key(&self) -> Option<&PartitionRowKeyTuple> {
        self.index_key.as_ref()
    }

    pub(crate) fn set_etag(&mut self, etag: String) {
        self.etag = etag;
    }

    pub(crate) fn from_entity(entity: TableEntity) -> Result<Self, SagaPersistenceError> {
        let mut properties = entity.properties;
        let index_key = properties
            .remove(SECONDARY_INDEX_KEY_PROPERTY)
            .and_then(|v| v.as_str().and_then(|s| PartitionRowKeyTuple::parse(Some(s))));
        let data = serde_json::from_value(Value::Object(properties))?;
        Ok(Self {
            data,
            etag: entity.etag.unwrap_or_default(),
            index_key,
        })
    }
}

/// Saga の主行のキー。パーティションキーと行キーの両方に Saga ID を使う。
pub fn primary_key(saga_id: Uuid) -> PartitionRowKeyTuple {
    let id = saga_id.to_string();
    PartitionRowKeyTuple::new(id.clone(), id)
}

/// Saga 状態を主行に変換する。
pub fn to_primary_entity<T: SagaData>(
    saga: &T,
    index_key: Option<&PartitionRowKeyTuple>,
) -> Result<TableEntity, SagaPersistenceError> {
    let Value::Object(mut properties) = serde_json::to_value(saga)? else {
        return Err(SagaPersistenceError::Configuration(format!(
            "Saga 型 {} は JSON オブジェクトとして直列化される必要があります",
            T::saga_type()
        )));
    };
    if let Some(key) = index_key {
        properties.insert(
            SECONDARY_INDEX_KEY_PROPERTY.to_string(),
            Value::String(key.to_string()),
        );
    }
    let mut entity = TableEntity::with_properties(String::new(), String::new(), properties);
    primary_key(saga.id()).apply(&mut entity);
    Ok(entity)
}

/// Saga 状態から宣言済みの相関プロパティの値を取り出す。
pub(crate) fn correlation_value_of<T: SagaData>(
    saga: &T,
) -> Result<Option<CorrelationValue>, SagaPersistenceError> {
    let Some(property) = T::correlation_property() else {
        return Ok(None);
    };
    let value = serde_json::to_value(saga)?;
    Ok(value.get(property).and_then(CorrelationValue::from_json_value))
}

/// 主行のパーティションキーから Saga ID を取り出す。
pub(crate) fn saga_id_of(entity: &TableEntity) -> Option<Uuid> {
    Uuid::parse_str(&entity.partition_key).ok()
}

pub(crate) fn properties_snapshot(entity: &TableEntity) -> Map<String, Value> {
    entity.properties.clone()
}
