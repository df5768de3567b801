use std::io::Write;
use std::sync::Arc;

use k1s0_saga_persistence::saga::to_primary_entity;
use k1s0_saga_persistence::{
    InMemoryTableStore, ReconcileOutcome, SagaCorrelationProperty, SagaData, SagaPersistenceConfig,
    SagaPersistenceError, SagaPersister, TableStore,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShippingSagaData {
    id: Uuid,
    order_id: String,
    shipped: bool,
}

impl ShippingSagaData {
    fn new(order_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order_id.to_string(),
            shipped: false,
        }
    }
}

impl SagaData for ShippingSagaData {
    fn saga_type() -> &'static str {
        "Acme.Shipping.ShippingSagaData"
    }

    fn correlation_property() -> Option<&'static str> {
        Some("OrderId")
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

fn order_id(value: &str) -> SagaCorrelationProperty {
    SagaCorrelationProperty::new("OrderId", value)
}

fn endpoint(store: &Arc<InMemoryTableStore>) -> SagaPersister {
    SagaPersister::new(store.clone(), &SagaPersistenceConfig::default())
}

#[tokio::test]
async fn test_two_endpoints_race_for_same_order() {
    let store = Arc::new(InMemoryTableStore::new());
    let endpoint_a = endpoint(&store);
    let endpoint_b = endpoint(&store);

    let saga_a = ShippingSagaData::new("ORDER-42");
    let saga_b = ShippingSagaData::new("ORDER-42");

    endpoint_a.save(&saga_a, Some(&order_id("ORDER-42"))).await.unwrap();
    let err = endpoint_b
        .save(&saga_b, Some(&order_id("ORDER-42")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SagaPersistenceError::RetryNeeded {
            outcome: ReconcileOutcome::WinnerPresent,
            ..
        }
    ));
    assert!(err.is_retryable());

    // 敗者の主行は書き込まれない
    assert!(endpoint_b
        .get_by_id::<ShippingSagaData>(saga_b.id)
        .await
        .unwrap()
        .is_none());
    let table = endpoint_a.table_for::<ShippingSagaData>();
    assert_eq!(store.row_count(&table).await, 2);

    // 再実行したメッセージは勝者の Saga を引き当てる
    for endpoint in [&endpoint_a, &endpoint_b] {
        let found = endpoint
            .get_by_property::<ShippingSagaData>("OrderId", "ORDER-42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.data.id, saga_a.id);
    }
}

#[tokio::test]
async fn test_concurrent_saves_have_single_stable_winner() {
    let store = Arc::new(InMemoryTableStore::new());
    let endpoints: Vec<Arc<SagaPersister>> =
        (0..8).map(|_| Arc::new(endpoint(&store))).collect();

    let handles: Vec<_> = endpoints
        .iter()
        .map(|endpoint| {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let saga = ShippingSagaData::new("ORDER-7");
                let result = endpoint.save(&saga, Some(&order_id("ORDER-7"))).await;
                (saga.id, result)
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        let (saga_id, result) = handle.await.unwrap();
        match result {
            Ok(()) => winners.push(saga_id),
            Err(err) => assert!(
                matches!(err, SagaPersistenceError::RetryNeeded { .. }),
                "unexpected error: {err}"
            ),
        }
    }
    assert_eq!(winners.len(), 1);

    let table = endpoints[0].table_for::<ShippingSagaData>();
    assert_eq!(store.row_count(&table).await, 2);

    for _ in 0..3 {
        for endpoint in &endpoints {
            let found = endpoint
                .get_by_property::<ShippingSagaData>("OrderId", "ORDER-7")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(found.data.id, winners[0]);
        }
    }
}

#[tokio::test]
async fn test_update_then_complete_lifecycle() {
    let store = Arc::new(InMemoryTableStore::new());
    let persister = endpoint(&store);
    let saga = ShippingSagaData::new("ORDER-100");
    persister.save(&saga, Some(&order_id("ORDER-100"))).await.unwrap();

    let mut instance = persister
        .get_by_property::<ShippingSagaData>("OrderId", "ORDER-100")
        .await
        .unwrap()
        .unwrap();
    instance.data.shipped = true;
    persister.update(&mut instance).await.unwrap();

    let reloaded = persister
        .get_by_id::<ShippingSagaData>(saga.id)
        .await
        .unwrap()
        .unwrap();
    assert!(reloaded.data.shipped);

    persister.complete(&reloaded).await.unwrap();
    persister.complete(&reloaded).await.unwrap();

    let table = persister.table_for::<ShippingSagaData>();
    assert_eq!(store.row_count(&table).await, 0);
    assert!(persister
        .get_by_property::<ShippingSagaData>("OrderId", "ORDER-100")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_lookup_through_index_never_scans() {
    let store = Arc::new(InMemoryTableStore::new());
    endpoint(&store)
        .save(&ShippingSagaData::new("ORDER-1"), Some(&order_id("ORDER-1")))
        .await
        .unwrap();

    // キャッシュを持たない別インスタンスからの検索
    let cold = endpoint(&store);
    let found = cold
        .get_by_property::<ShippingSagaData>("OrderId", "ORDER-1")
        .await
        .unwrap();
    assert!(found.is_some());
    assert_eq!(store.call_counts().scans, 0);
}

#[tokio::test]
async fn test_missing_index_scans_only_when_not_assumed() {
    let store = Arc::new(InMemoryTableStore::new());

    let config = SagaPersistenceConfig {
        assume_secondary_indices_exist: true,
        ..SagaPersistenceConfig::default()
    };
    let assuming = SagaPersister::new(store.clone(), &config);
    let found = assuming
        .get_by_property::<ShippingSagaData>("OrderId", "ORDER-404")
        .await
        .unwrap();
    assert!(found.is_none());
    assert_eq!(store.call_counts().scans, 0);

    let scanning = endpoint(&store);
    let found = scanning
        .get_by_property::<ShippingSagaData>("OrderId", "ORDER-404")
        .await
        .unwrap();
    assert!(found.is_none());
    assert_eq!(store.call_counts().scans, 1);
}

#[tokio::test]
async fn test_legacy_rows_without_index_are_found_by_scan() {
    let store = Arc::new(InMemoryTableStore::new());
    let persister = endpoint(&store);
    let table = persister.table_for::<ShippingSagaData>();

    let legacy = ShippingSagaData::new("ORDER-55");
    store
        .insert_if_absent(&table, to_primary_entity(&legacy, None).unwrap())
        .await
        .unwrap();

    let found = persister
        .get_by_property::<ShippingSagaData>("OrderId", "ORDER-55")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.data.id, legacy.id);
    assert!(found.index_key().is_none());

    // 2回目はキャッシュから、別インスタンスからは補完されたインデックス行から解決される
    persister
        .get_by_property::<ShippingSagaData>("OrderId", "ORDER-55")
        .await
        .unwrap();
    let cold = endpoint(&store)
        .get_by_property::<ShippingSagaData>("OrderId", "ORDER-55")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cold.data.id, legacy.id);
    assert_eq!(store.call_counts().scans, 1);
    assert_eq!(store.row_count(&table).await, 2);

    persister.complete(&found).await.unwrap();
    assert_eq!(store.row_count(&table).await, 0);
}

#[tokio::test]
async fn test_duplicate_legacy_rows_are_reported() {
    let store = Arc::new(InMemoryTableStore::new());
    let persister = endpoint(&store);
    let table = persister.table_for::<ShippingSagaData>();

    let first = ShippingSagaData::new("ORDER-66");
    let second = ShippingSagaData::new("ORDER-66");
    for saga in [&first, &second] {
        store
            .insert_if_absent(&table, to_primary_entity(saga, None).unwrap())
            .await
            .unwrap();
    }

    let err = persister
        .get_by_property::<ShippingSagaData>("OrderId", "ORDER-66")
        .await
        .unwrap_err();
    let SagaPersistenceError::DuplicateCorrelation { saga_ids, property, .. } = err else {
        panic!("expected duplicate correlation error");
    };
    assert_eq!(property, "OrderId");
    assert_eq!(saga_ids.len(), 2);
    assert!(saga_ids.contains(&first.id));
    assert!(saga_ids.contains(&second.id));
}

#[tokio::test]
async fn test_config_loaded_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "cache_capacity: 16\nassume_secondary_indices_exist: true\ntable_names:\n  Acme.Shipping.ShippingSagaData: Shipments"
    )
    .unwrap();

    let config = SagaPersistenceConfig::load(file.path()).unwrap();
    assert_eq!(config.cache_capacity, 16);
    assert!(config.assume_secondary_indices_exist);

    let store = Arc::new(InMemoryTableStore::new());
    let persister = SagaPersister::new(store.clone(), &config);
    assert_eq!(persister.table_for::<ShippingSagaData>(), "Shipments");

    persister
        .save(&ShippingSagaData::new("ORDER-9"), Some(&order_id("ORDER-9")))
        .await
        .unwrap();
    assert_eq!(store.row_count("Shipments").await, 2);
}
