mod common;

use analysis_persistence::blob_store::{put_bytes, BlobStore};
use analysis_persistence::catalog::{ModelType, StorageType, TrainingMetadata, WorkspaceState};
use analysis_persistence::document::DocumentAdapter;
use analysis_persistence::error::PersistenceError;
use analysis_persistence::storage::ObjectBlobStore;
use common::{
    engine_over, init_test_logging, memory_document_adapter, payload, sample_dataset,
    small_settings, FaultyAdapter,
};
use object_store::memory::InMemory;
use object_store::ObjectStore;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    init_test_logging();

    // Given: a dataset behind a backend that drops the next two calls
    let backing = memory_document_adapter(small_settings());
    let id = backing
        .save_dataset(&sample_dataset("retried", 64))
        .await
        .unwrap();
    let flaky = Arc::new(
        FaultyAdapter::new(backing).failing(2, PersistenceError::connection("pool exhausted")),
    );
    let engine = engine_over(flaky.clone()).await;

    // When: fetching it
    let fetched = engine.fetch_dataset(&id).await.unwrap();

    // Then: the third attempt succeeded
    assert_eq!(fetched.unwrap().data, payload(64));
    assert_eq!(flaky.calls(), 3);
}

#[tokio::test]
async fn retries_stop_after_the_configured_attempts() {
    init_test_logging();

    let down = Arc::new(
        FaultyAdapter::new(memory_document_adapter(small_settings()))
            .failing(100, PersistenceError::connection("backend down")),
    );
    let engine = engine_over(down.clone()).await;

    let err = engine.list_datasets(10).await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(down.calls(), 3);
}

#[tokio::test]
async fn caller_errors_are_not_retried() {
    init_test_logging();

    let strict = Arc::new(
        FaultyAdapter::new(memory_document_adapter(small_settings()))
            .failing(5, PersistenceError::validation("bad input")),
    );
    let engine = engine_over(strict.clone()).await;

    let err = engine.delete_dataset("ds_any").await.unwrap_err();

    assert!(matches!(err, PersistenceError::Validation { .. }));
    assert_eq!(strict.calls(), 1);
}

#[tokio::test]
async fn slow_calls_hit_the_deadline_as_connection_errors() {
    init_test_logging();

    // Given: a backend slower than the operation timeout
    let slow = Arc::new(
        FaultyAdapter::new(memory_document_adapter(small_settings()))
            .delayed(Duration::from_millis(500)),
    );
    let engine = engine_over(slow.clone())
        .await
        .with_timeout(Duration::from_millis(30));

    // When: reading
    let err = engine.fetch_dataset("ds_any").await.unwrap_err();

    // Then: every attempt timed out and the caller sees a Connection error
    assert!(err.is_transient());
    assert!(err.to_string().contains("timed out"));
    assert_eq!(slow.calls(), 3);
}

#[tokio::test]
async fn create_dataset_retry_does_not_duplicate_records() {
    init_test_logging();

    let flaky = Arc::new(
        FaultyAdapter::new(memory_document_adapter(small_settings()))
            .failing(1, PersistenceError::connection("reset by peer")),
    );
    let engine = engine_over(flaky.clone()).await;

    let id = engine
        .create_dataset(&sample_dataset("once", 32))
        .await
        .unwrap();

    let listed = engine.list_datasets(100).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
}

#[tokio::test]
async fn training_and_workspace_operations_round_trip_through_the_engine() {
    init_test_logging();

    let engine = engine_over(memory_document_adapter(small_settings())).await;
    let dataset_id = engine
        .create_dataset(&sample_dataset("engine", 64))
        .await
        .unwrap();

    // Training metadata
    let mut linear =
        TrainingMetadata::new(&dataset_id, "linear", ModelType::Regression, "fare_amount")
            .in_workspace("q1");
    linear.metrics.insert("rmse".to_string(), 2.4);
    let linear_id = engine.save_training_metadata(&linear).await.unwrap();
    assert!(linear_id.starts_with("tm_"));
    let forest_id = engine
        .save_training_metadata(
            &TrainingMetadata::new(&dataset_id, "forest", ModelType::Regression, "fare_amount")
                .in_workspace("q1"),
        )
        .await
        .unwrap();

    engine.mark_best_model(&dataset_id, &forest_id).await.unwrap();
    let runs = engine
        .fetch_training_metadata(&dataset_id, Some("q1"))
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|m| m.is_best == (m.id == forest_id)));

    // Workspace state
    let mut state = WorkspaceState::new("q1", &dataset_id);
    state.predictive_analysis = Some(serde_json::json!({ "selected_model": forest_id }));
    let state_id = engine.save_workspace_state(&state).await.unwrap();
    let fetched = engine
        .fetch_workspace_state("q1", &dataset_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.predictive_analysis, state.predictive_analysis);
    assert_eq!(fetched.storage_type, StorageType::Inline);
    assert_eq!(engine.list_workspaces(&dataset_id).await.unwrap().len(), 1);

    assert_eq!(
        engine
            .delete_training_metadata(&dataset_id, Some("q1"))
            .await
            .unwrap(),
        2
    );
    assert!(engine.delete_workspace_state(&state_id).await.unwrap());
    assert!(engine.list_workspaces(&dataset_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn garbage_collection_only_removes_old_unreferenced_blobs() {
    init_test_logging();

    // Given: an offloaded dataset and a blob nothing references
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let settings = small_settings();
    let adapter = Arc::new(DocumentAdapter::new(store.clone(), settings));
    let engine = engine_over(adapter).await;

    let id = engine
        .create_dataset(&sample_dataset("referenced", 4_096))
        .await
        .unwrap();
    let blobs = ObjectBlobStore::new(store, settings.part_size);
    put_bytes(&blobs, payload(2_048), settings.part_size)
        .await
        .unwrap();
    assert_eq!(blobs.list().await.unwrap().len(), 2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // When: collecting with a grace period longer than the blobs' age
    let kept = engine
        .collect_garbage(Duration::from_secs(3600))
        .await
        .unwrap();

    // Then: nothing is touched
    assert_eq!(kept, 0);
    assert_eq!(blobs.list().await.unwrap().len(), 2);

    // When: collecting with no grace period
    let removed = engine.collect_garbage(Duration::ZERO).await.unwrap();

    // Then: only the orphan is gone and the dataset still reads back
    assert_eq!(removed, 1);
    assert_eq!(blobs.list().await.unwrap().len(), 1);
    let fetched = engine.fetch_dataset(&id).await.unwrap().unwrap();
    assert_eq!(fetched.storage_type, StorageType::Offloaded);
    assert_eq!(fetched.data, payload(4_096));
}
