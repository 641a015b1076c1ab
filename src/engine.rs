use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{info, warn};

use crate::adapter::{ensure_dataset_id, BackendKind, StorageAdapter};
use crate::batch::{BatchExecutor, BatchSummary};
use crate::catalog::{
    new_training_id, Dataset, DatasetSummary, TrainingMetadata, WorkspaceState, WorkspaceSummary,
};
use crate::config::{BackendConfig, PersistenceConfig, RetrySettings};
use crate::deadline::DeadlineAdapter;
use crate::error::{PersistenceError, PersistenceResult};
use crate::selector::AdapterSelector;

/// Caller-facing entry point. An operation stays on the adapter that was
/// active when it started, including its retries.
pub struct PersistenceEngine {
    selector: Arc<AdapterSelector>,
    executor: BatchExecutor,
    retry: RetrySettings,
    timeout: Duration,
}

impl PersistenceEngine {
    pub fn new(selector: Arc<AdapterSelector>, config: &PersistenceConfig) -> PersistenceResult<Self> {
        Ok(Self {
            selector,
            executor: BatchExecutor::new(config.batch_max_parallelism)?,
            retry: config.retry,
            timeout: config.operation_timeout,
        })
    }

    /// Builds a selector for `config`, connects its backend and wraps it.
    pub async fn start(config: &PersistenceConfig) -> PersistenceResult<Self> {
        info!("Initializing persistence engine");

        let selector = Arc::new(AdapterSelector::new(config.adapter));
        selector.initialize(&config.backend).await?;

        info!("Persistence engine initialized successfully");
        Self::new(selector, config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_settings(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn selector(&self) -> &Arc<AdapterSelector> {
        &self.selector
    }

    fn adapter(&self) -> PersistenceResult<DeadlineAdapter> {
        Ok(DeadlineAdapter::new(self.selector.get_active()?, self.timeout))
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut action: F) -> PersistenceResult<T>
    where
        F: FnMut(DeadlineAdapter) -> Fut,
        Fut: Future<Output = PersistenceResult<T>>,
    {
        let factor = (self.retry.base_delay.as_millis() as u64 / 2).max(1);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.retry.max_delay)
            .map(jitter)
            .take(self.retry.max_attempts.saturating_sub(1));

        let adapter = self.adapter()?;
        RetryIf::start(
            strategy,
            || action(adapter.clone()),
            |e: &PersistenceError| {
                let transient = e.is_transient();
                if transient {
                    warn!("{} failed, retrying: {}", operation, e);
                }
                transient
            },
        )
        .await
    }

    pub async fn create_dataset(&self, dataset: &Dataset) -> PersistenceResult<String> {
        // The id is fixed before the first attempt so a retry after a lost
        // reply replaces the record instead of creating a second one.
        let mut dataset = dataset.clone();
        ensure_dataset_id(&mut dataset);
        let dataset = &dataset;
        self.with_retry("create_dataset", |adapter| async move {
            adapter.save_dataset(dataset).await
        })
        .await
    }

    pub async fn fetch_dataset(&self, id: &str) -> PersistenceResult<Option<Dataset>> {
        self.with_retry("fetch_dataset", |adapter| async move {
            adapter.get_dataset(id).await
        })
        .await
    }

    pub async fn list_datasets(&self, limit: usize) -> PersistenceResult<Vec<DatasetSummary>> {
        self.with_retry("list_datasets", |adapter| async move {
            adapter.list_datasets(limit).await
        })
        .await
    }

    pub async fn delete_dataset(&self, id: &str) -> PersistenceResult<bool> {
        self.with_retry("delete_dataset", |adapter| async move {
            adapter.delete_dataset(id).await
        })
        .await
    }

    /// Deletes every id independently. An id that does not exist is reported
    /// as a `NotFound` failure; deletions that succeeded are never undone.
    pub async fn bulk_delete_datasets(&self, ids: Vec<String>) -> PersistenceResult<BatchSummary> {
        self.selector.get_active()?;
        info!("Bulk deleting {} datasets", ids.len());

        let items = ids.into_iter().map(|id| (id, ())).collect();
        let summary = self
            .executor
            .run(items, |id, _| async move {
                if self.delete_dataset(&id).await? {
                    Ok(())
                } else {
                    Err(PersistenceError::not_found("dataset", id))
                }
            })
            .await;

        info!("Bulk delete finished: {}", summary);
        Ok(summary)
    }

    pub async fn bulk_save_datasets(&self, datasets: Vec<Dataset>) -> PersistenceResult<BatchSummary> {
        self.selector.get_active()?;
        info!("Bulk saving {} datasets", datasets.len());

        let items = datasets
            .into_iter()
            .map(|mut dataset| {
                let id = ensure_dataset_id(&mut dataset).to_string();
                (id, dataset)
            })
            .collect();
        let summary = self
            .executor
            .run(items, |_, dataset| async move {
                self.create_dataset(&dataset).await.map(|_| ())
            })
            .await;

        info!("Bulk save finished: {}", summary);
        Ok(summary)
    }

    pub async fn save_training_metadata(&self, metadata: &TrainingMetadata) -> PersistenceResult<String> {
        let mut metadata = metadata.clone();
        if metadata.id.is_empty() {
            metadata.id = new_training_id();
        }
        let metadata = &metadata;
        self.with_retry("save_training_metadata", |adapter| async move {
            adapter.save_training_metadata(metadata).await
        })
        .await
    }

    pub async fn fetch_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<Vec<TrainingMetadata>> {
        self.with_retry("fetch_training_metadata", |adapter| async move {
            adapter.get_training_metadata(dataset_id, workspace_name).await
        })
        .await
    }

    pub async fn delete_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<usize> {
        self.with_retry("delete_training_metadata", |adapter| async move {
            adapter
                .delete_training_metadata(dataset_id, workspace_name)
                .await
        })
        .await
    }

    pub async fn mark_best_model(&self, dataset_id: &str, metadata_id: &str) -> PersistenceResult<()> {
        self.with_retry("mark_best_model", |adapter| async move {
            adapter.mark_best_model(dataset_id, metadata_id).await
        })
        .await
    }

    pub async fn save_workspace_state(&self, state: &WorkspaceState) -> PersistenceResult<String> {
        self.with_retry("save_workspace_state", |adapter| async move {
            adapter.save_workspace_state(state).await
        })
        .await
    }

    pub async fn fetch_workspace_state(
        &self,
        workspace_name: &str,
        dataset_id: &str,
    ) -> PersistenceResult<Option<WorkspaceState>> {
        self.with_retry("fetch_workspace_state", |adapter| async move {
            adapter.get_workspace_state(workspace_name, dataset_id).await
        })
        .await
    }

    pub async fn list_workspaces(&self, dataset_id: &str) -> PersistenceResult<Vec<WorkspaceSummary>> {
        self.with_retry("list_workspaces", |adapter| async move {
            adapter.list_workspaces(dataset_id).await
        })
        .await
    }

    pub async fn delete_workspace_state(&self, id: &str) -> PersistenceResult<bool> {
        self.with_retry("delete_workspace_state", |adapter| async move {
            adapter.delete_workspace_state(id).await
        })
        .await
    }

    /// Saves each state independently; items are named
    /// `{dataset_id}/{workspace_name}` in the summary.
    pub async fn bulk_save_workspace_states(
        &self,
        states: Vec<WorkspaceState>,
    ) -> PersistenceResult<BatchSummary> {
        self.selector.get_active()?;
        info!("Bulk saving {} workspace states", states.len());

        let items = states
            .into_iter()
            .map(|state| (format!("{}/{}", state.dataset_id, state.workspace_name), state))
            .collect();
        let summary = self
            .executor
            .run(items, |_, state| async move {
                self.save_workspace_state(&state).await.map(|_| ())
            })
            .await;

        info!("Bulk workspace save finished: {}", summary);
        Ok(summary)
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.selector.active_backend()
    }

    pub async fn switch_backend(&self, config: &BackendConfig) -> PersistenceResult<BackendKind> {
        self.selector.switch(config).await
    }

    pub async fn health_check(&self) -> PersistenceResult<()> {
        self.adapter()?.health_check().await
    }

    pub async fn collect_garbage(&self, grace: Duration) -> PersistenceResult<usize> {
        self.with_retry("collect_garbage", |adapter| async move {
            adapter.collect_garbage(grace).await
        })
        .await
    }
}
