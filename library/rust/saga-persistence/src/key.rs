use std::fmt;

use crate::table::TableEntity;

/// 文字列表現でパーティションキーと行キーを区切る文字。
pub const KEY_SEPARATOR: char = '#';

/// PartitionRowKeyTuple はテーブル行のアドレス (partition_key, row_key) を表す。
/// 等価性とハッシュは両成分の大文字小文字を区別した比較による。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionRowKeyTuple {
    partition_key: String,
    row_key: String,
}

impl PartitionRowKeyTuple {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    /// 行にキーを書き込む。
    pub fn apply(&self, entity: &mut TableEntity) {
        entity.partition_key.clone_from(&self.partition_key);
        entity.row_key.clone_from(&self.row_key);
    }

    /// `"{partition_key}#{row_key}"` 形式の文字列を解析する。
    ///
    /// 行キーは空文字列か Saga ID であり区切り文字を含まないため、最後の `#` で分割する。
    /// 相関値由来の `#` がパーティションキーに含まれていても復元できる。
    pub fn parse(value: Option<&str>) -> Option<Self> {
        let value = value?;
        if value.trim().is_empty() {
            return None;
        }
        let (partition_key, row_key) = value.rsplit_once(KEY_SEPARATOR)?;
        Some(Self::new(partition_key, row_key))
    }
}

impl fmt::Display for PartitionRowKeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.partition_key, KEY_SEPARATOR, self.row_key)
    }
}
