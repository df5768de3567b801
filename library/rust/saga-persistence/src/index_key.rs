use std::fmt;

use serde_json::Value;
use uuid::Uuid;

use crate::key::PartitionRowKeyTuple;

/// セカンダリインデックス行のパーティションキー接頭辞。
pub const INDEX_KEY_PREFIX: &str = "Index";

/// CorrelationValue は相関プロパティのスカラー値を表す。
///
/// インデックスキーに埋め込む文字列は JSON スカラー表現に固定する。
/// 文字列と GUID は引用符付き、数値は引用符なしで、ロケールに依存しない。
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationValue {
    String(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Guid(Uuid),
}

impl CorrelationValue {
    /// テーブル列と比較するための JSON 値に変換する。
    pub fn to_json_value(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Int(n) => Value::from(*n),
            Self::UInt(n) => Value::from(*n),
            // NaN と無限大は JSON で表現できないため null になる
            Self::Float(n) => Value::from(*n),
            Self::Bool(b) => Value::Bool(*b),
            Self::Guid(id) => Value::String(id.hyphenated().to_string()),
        }
    }

    /// 直列化済みの Saga 状態から取り出した列値を相関値に戻す。スカラー以外は None。
    ///
    /// GUID は文字列として戻るが、インデックスキー上の表現は同じになる。
    pub fn from_json_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_u64().map(Self::UInt))
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// インデックスキー用の正規化された直列化表現。
    pub fn serialize(&self) -> String {
        self.to_json_value().to_string()
    }
}

impl fmt::Display for CorrelationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl From<&str> for CorrelationValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for CorrelationValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for CorrelationValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for CorrelationValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for CorrelationValue {
    fn from(value: u32) -> Self {
        Self::UInt(u64::from(value))
    }
}

impl From<u64> for CorrelationValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<f64> for CorrelationValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for CorrelationValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Uuid> for CorrelationValue {
    fn from(value: Uuid) -> Self {
        Self::Guid(value)
    }
}

/// IndexRowKey はセカンダリインデックス行の行キー規約。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRowKey {
    /// 既定の規約。行キーは空文字列で、相関値ごとに行が1つに定まる。
    Empty,
    /// 互換規約。行キーに Saga ID を書き込んだ旧形式。
    SagaId(Uuid),
}

impl IndexRowKey {
    pub fn as_row_key(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::SagaId(id) => id.to_string(),
        }
    }
}

/// (Saga 型, 相関プロパティ名, 相関値) からセカンダリインデックスのキーを導出する。
///
/// 同じ引数からは常にバイト単位で同一のキーが得られる。
pub fn build_key(
    saga_type: &str,
    property: &str,
    value: &CorrelationValue,
    row_key: IndexRowKey,
) -> PartitionRowKeyTuple {
    let partition_key = format!(
        "{INDEX_KEY_PREFIX}_{saga_type}_{property}_{}",
        value.serialize()
    );
    PartitionRowKeyTuple::new(partition_key, row_key.as_row_key())
}
