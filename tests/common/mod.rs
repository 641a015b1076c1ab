#![allow(dead_code)]

use analysis_persistence::adapter::{BackendKind, StorageAdapter};
use analysis_persistence::catalog::{
    Dataset, DatasetSummary, TrainingMetadata, WorkspaceState, WorkspaceSummary,
};
use analysis_persistence::codec::OffloadPolicy;
use analysis_persistence::config::{
    AdapterSettings, BackendConfig, PersistenceConfig, RelationalConfig, RetrySettings,
};
use analysis_persistence::database::RelationalAdapter;
use analysis_persistence::document::DocumentAdapter;
use analysis_persistence::engine::PersistenceEngine;
use analysis_persistence::error::{PersistenceError, PersistenceResult};
use analysis_persistence::selector::AdapterSelector;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Offloads anything over 1 KiB and uploads in 256 byte parts, so multipart
/// paths run on small payloads.
pub fn small_settings() -> AdapterSettings {
    AdapterSettings {
        offload: OffloadPolicy::new(1024),
        part_size: 256,
        connect_timeout: Duration::from_secs(2),
    }
}

/// Engine settings with millisecond backoff so retry tests stay fast.
pub fn fast_config() -> PersistenceConfig {
    let mut config = PersistenceConfig::new(BackendConfig::document("memory://"));
    config.adapter = small_settings();
    config.batch_max_parallelism = 4;
    config.operation_timeout = Duration::from_secs(2);
    config.retry = RetrySettings {
        max_attempts: 3,
        base_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
    };
    config
}

/// An engine whose selector starts out on `adapter`.
pub async fn engine_over(adapter: Arc<dyn StorageAdapter>) -> PersistenceEngine {
    let config = fast_config();
    let selector = Arc::new(AdapterSelector::new(config.adapter));
    selector
        .initialize_with(adapter)
        .await
        .expect("Failed to install adapter");
    PersistenceEngine::new(selector, &config).expect("Failed to build engine")
}

/// Deterministic, non-repeating-looking content of `len` bytes.
pub fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

pub fn sample_dataset(name: &str, len: usize) -> Dataset {
    Dataset::new(name, payload(len))
        .with_columns(vec![
            ("trip_distance".to_string(), "float64".to_string()),
            ("fare_amount".to_string(), "float64".to_string()),
        ])
        .with_rows(
            2,
            vec![
                serde_json::json!({"trip_distance": 1.2, "fare_amount": 7.5}),
                serde_json::json!({"trip_distance": 3.4, "fare_amount": 14.0}),
            ],
        )
}

pub fn memory_document_adapter(settings: AdapterSettings) -> Arc<dyn StorageAdapter> {
    Arc::new(DocumentAdapter::new(Arc::new(InMemory::new()), settings))
}

/// Connects to the database named by `TEST_DATABASE_URL`, or returns `None`
/// so relational tests are skipped when no database is available.
pub async fn relational_adapter(settings: AdapterSettings) -> Option<RelationalAdapter> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let config = RelationalConfig {
        database_url,
        max_connections: 4,
    };
    let adapter = RelationalAdapter::connect(&config, &settings)
        .await
        .expect("Failed to connect to TEST_DATABASE_URL");
    Some(adapter)
}

/// Wraps an adapter and injects failures and latency in front of every call.
#[derive(Debug)]
pub struct FaultyAdapter {
    inner: Arc<dyn StorageAdapter>,
    failures_left: AtomicUsize,
    failure: PersistenceError,
    delay: Duration,
    calls: AtomicUsize,
    closed: AtomicUsize,
}

impl FaultyAdapter {
    pub fn new(inner: Arc<dyn StorageAdapter>) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(0),
            failure: PersistenceError::connection("injected outage"),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    /// The next `count` calls fail with `failure` before reaching the backend.
    pub fn failing(self, count: usize, failure: PersistenceError) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        Self { failure, ..self }
    }

    pub fn delayed(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> PersistenceResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            Err(self.failure.clone())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageAdapter for FaultyAdapter {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn health_check(&self) -> PersistenceResult<()> {
        self.inner.health_check().await
    }

    async fn save_dataset(&self, dataset: &Dataset) -> PersistenceResult<String> {
        self.enter().await?;
        self.inner.save_dataset(dataset).await
    }

    async fn get_dataset(&self, id: &str) -> PersistenceResult<Option<Dataset>> {
        self.enter().await?;
        self.inner.get_dataset(id).await
    }

    async fn list_datasets(&self, limit: usize) -> PersistenceResult<Vec<DatasetSummary>> {
        self.enter().await?;
        self.inner.list_datasets(limit).await
    }

    async fn delete_dataset(&self, id: &str) -> PersistenceResult<bool> {
        self.enter().await?;
        self.inner.delete_dataset(id).await
    }

    async fn save_training_metadata(&self, metadata: &TrainingMetadata) -> PersistenceResult<String> {
        self.enter().await?;
        self.inner.save_training_metadata(metadata).await
    }

    async fn get_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<Vec<TrainingMetadata>> {
        self.enter().await?;
        self.inner.get_training_metadata(dataset_id, workspace_name).await
    }

    async fn delete_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<usize> {
        self.enter().await?;
        self.inner.delete_training_metadata(dataset_id, workspace_name).await
    }

    async fn mark_best_model(&self, dataset_id: &str, metadata_id: &str) -> PersistenceResult<()> {
        self.enter().await?;
        self.inner.mark_best_model(dataset_id, metadata_id).await
    }

    async fn save_workspace_state(&self, state: &WorkspaceState) -> PersistenceResult<String> {
        self.enter().await?;
        self.inner.save_workspace_state(state).await
    }

    async fn get_workspace_state(
        &self,
        workspace_name: &str,
        dataset_id: &str,
    ) -> PersistenceResult<Option<WorkspaceState>> {
        self.enter().await?;
        self.inner.get_workspace_state(workspace_name, dataset_id).await
    }

    async fn list_workspaces(&self, dataset_id: &str) -> PersistenceResult<Vec<WorkspaceSummary>> {
        self.enter().await?;
        self.inner.list_workspaces(dataset_id).await
    }

    async fn delete_workspace_state(&self, id: &str) -> PersistenceResult<bool> {
        self.enter().await?;
        self.inner.delete_workspace_state(id).await
    }

    async fn collect_garbage(&self, grace: Duration) -> PersistenceResult<usize> {
        self.enter().await?;
        self.inner.collect_garbage(grace).await
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}
