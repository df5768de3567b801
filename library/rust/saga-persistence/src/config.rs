use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::DEFAULT_CACHE_CAPACITY;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// IndexLookupMode はセカンダリインデックス行の読み込み規約。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexLookupMode {
    /// 行キーが空文字列のインデックス行のみを参照する
    #[default]
    PrimaryOnly,
    /// 行キーに Saga ID を書き込んだ旧形式のインデックス行も参照する
    WithSagaIdRowKeyFallback,
}

/// SagaPersistenceConfig は Saga 永続化の設定。
#[derive(Debug, Clone, Deserialize)]
pub struct SagaPersistenceConfig {
    /// セカンダリインデックス解決キャッシュの最大エントリ数
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// true の場合、インデックス行が見つからなければ全件走査せずに未検出とする
    #[serde(default)]
    pub assume_secondary_indices_exist: bool,
    #[serde(default)]
    pub index_lookup: IndexLookupMode,
    /// Saga 型名 -> テーブル名 の上書き
    #[serde(default)]
    pub table_names: HashMap<String, String>,
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

impl Default for SagaPersistenceConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            assume_secondary_indices_exist: false,
            index_lookup: IndexLookupMode::default(),
            table_names: HashMap::new(),
        }
    }
}

impl SagaPersistenceConfig {
    /// YAML ファイルから設定を読み込み、検証する。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// 設定値のバリデーション。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity == 0 {
            return Err(ConfigError::Validation(
                "cache_capacity must be > 0".into(),
            ));
        }
        for (saga_type, table) in &self.table_names {
            if !is_valid_table_name(table) {
                return Err(ConfigError::Validation(format!(
                    "table_names.{saga_type}: '{table}' must be 3-63 alphanumeric characters starting with a letter"
                )));
            }
        }
        Ok(())
    }
}

fn is_valid_table_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric())
}
