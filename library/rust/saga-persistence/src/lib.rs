//! k1s0-saga-persistence: キーバリューテーブル上の Saga 永続化。
//!
//! 相関プロパティ値から Saga を引き当てるセカンダリインデックスと、
//! insert-if-absent のみを同期プリミティブとする並行安全な保存プロトコルを提供する。

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod index_key;
pub mod key;
pub mod memory;
pub mod persister;
pub mod protocol;
pub mod resolver;
pub mod saga;
pub mod table;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use cache::{BoundedLookupCache, DEFAULT_CACHE_CAPACITY};
pub use cancel::cancellable;
pub use config::{ConfigError, IndexLookupMode, SagaPersistenceConfig};
pub use error::{SagaPersistenceError, TableStoreError};
pub use index_key::{build_key, CorrelationValue, IndexRowKey};
pub use key::PartitionRowKeyTuple;
pub use memory::{InMemoryTableStore, StoreCallCounts};
pub use persister::SagaPersister;
pub use protocol::{ConcurrentInsertProtocol, InsertRequest, ReconcileOutcome};
pub use resolver::{ResolverSettings, SecondaryIndexResolver};
pub use saga::{SagaCorrelationProperty, SagaData, SagaInstance, SagaMetadata};
pub use table::{
    table_name_for, DeleteOutcome, InsertOutcome, ReplaceOutcome, TableEntity, TableStore,
};

#[cfg(feature = "mock")]
pub use table::MockTableStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresTableStore;
