use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k1s0_saga_persistence::saga::to_primary_entity;
use k1s0_saga_persistence::{
    cancellable, ConcurrentInsertProtocol, CorrelationValue, DeleteOutcome, InMemoryTableStore,
    InsertOutcome, ReconcileOutcome, ReplaceOutcome, SagaCorrelationProperty, SagaData,
    SagaMetadata, SagaPersistenceConfig, SagaPersistenceError, SagaPersister,
    SecondaryIndexResolver, TableEntity, TableStore, TableStoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BillingSagaData {
    id: Uuid,
    invoice_no: u64,
}

impl SagaData for BillingSagaData {
    fn saga_type() -> &'static str {
        "Acme.Billing.BillingSagaData"
    }

    fn correlation_property() -> Option<&'static str> {
        Some("InvoiceNo")
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

/// 有効化後最初の point_read でトークンをキャンセルし、そのまま応答を返さないストア。
struct StallingStore {
    inner: InMemoryTableStore,
    token: CancellationToken,
    armed: AtomicBool,
}

#[async_trait]
impl TableStore for StallingStore {
    async fn insert_if_absent(
        &self,
        table: &str,
        entity: TableEntity,
    ) -> Result<InsertOutcome, TableStoreError> {
        self.inner.insert_if_absent(table, entity).await
    }

    async fn point_read(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>, TableStoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.token.cancel();
            std::future::pending::<()>().await;
        }
        self.inner.point_read(table, partition_key, row_key).await
    }

    async fn replace_if_match(
        &self,
        table: &str,
        entity: TableEntity,
        expected_etag: &str,
    ) -> Result<ReplaceOutcome, TableStoreError> {
        self.inner.replace_if_match(table, entity, expected_etag).await
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<DeleteOutcome, TableStoreError> {
        self.inner.delete(table, partition_key, row_key).await
    }

    async fn delete_if_match(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected_etag: &str,
    ) -> Result<DeleteOutcome, TableStoreError> {
        self.inner
            .delete_if_match(table, partition_key, row_key, expected_etag)
            .await
    }

    async fn scan_by_property(
        &self,
        table: &str,
        property: &str,
        value: &Value,
    ) -> Result<Vec<TableEntity>, TableStoreError> {
        self.inner.scan_by_property(table, property, value).await
    }

    async fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<TableEntity>, TableStoreError> {
        self.inner.query_partition(table, partition_key).await
    }
}

// 勝者がインデックス行だけを書いて停止した状態を作る
async fn write_orphan_index_row(
    store: &InMemoryTableStore,
    table: &str,
    winner: &BillingSagaData,
) {
    let value = CorrelationValue::from(winner.invoice_no);
    let key =
        SecondaryIndexResolver::index_key(&SagaMetadata::of::<BillingSagaData>(), "InvoiceNo", &value);
    let primary = to_primary_entity(winner, Some(&key)).unwrap();
    let index_row = ConcurrentInsertProtocol::index_entity(&key, winner.id, &primary).unwrap();
    store.insert_if_absent(table, index_row).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_reconcile_recovers_on_retry() {
    let inner = InMemoryTableStore::new();
    let first_attempt = CancellationToken::new();
    let store = Arc::new(StallingStore {
        inner: inner.clone(),
        token: first_attempt.clone(),
        armed: AtomicBool::new(false),
    });
    let persister = SagaPersister::new(store.clone(), &SagaPersistenceConfig::default());
    let table = persister.table_for::<BillingSagaData>();

    let winner = BillingSagaData {
        id: Uuid::new_v4(),
        invoice_no: 9001,
    };
    write_orphan_index_row(&inner, &table, &winner).await;

    let loser = BillingSagaData {
        id: Uuid::new_v4(),
        invoice_no: 9001,
    };
    let correlation = SagaCorrelationProperty::new("InvoiceNo", 9001_u64);

    // Reconcile 中のインデックス行読み込みで中断させる
    store.armed.store(true, Ordering::SeqCst);
    let err = cancellable(&first_attempt, persister.save(&loser, Some(&correlation)))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaPersistenceError::Cancelled));
    assert!(inner
        .point_read(&table, &winner.id.to_string(), &winner.id.to_string())
        .await
        .unwrap()
        .is_none());

    let retry = CancellationToken::new();
    let err = cancellable(&retry, persister.save(&loser, Some(&correlation)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SagaPersistenceError::RetryNeeded {
            outcome: ReconcileOutcome::WinnerRepaired,
            ..
        }
    ));

    let found = persister
        .get_by_property::<BillingSagaData>("InvoiceNo", 9001_u64)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.data, winner);
    assert!(found.index_key().is_some());
    assert!(persister
        .get_by_id::<BillingSagaData>(loser.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_cancel_before_start_writes_nothing() {
    let store = Arc::new(InMemoryTableStore::new());
    let persister = SagaPersister::new(store.clone(), &SagaPersistenceConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    let saga = BillingSagaData {
        id: Uuid::new_v4(),
        invoice_no: 1,
    };
    let correlation = SagaCorrelationProperty::new("InvoiceNo", 1_u64);
    let err = cancellable(&token, persister.save(&saga, Some(&correlation)))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaPersistenceError::Cancelled));
    assert_eq!(store.call_counts().inserts, 0);
}
