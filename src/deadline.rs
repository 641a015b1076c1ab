use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::adapter::{BackendKind, StorageAdapter};
use crate::catalog::{Dataset, DatasetSummary, TrainingMetadata, WorkspaceState, WorkspaceSummary};
use crate::error::{PersistenceError, PersistenceResult};

/// Bounds `future` by `timeout`. Expiry drops the future and reports a
/// `Connection` error; a blob upload it had started is left for garbage
/// collection.
pub async fn with_deadline<T, F>(timeout: Duration, operation: &str, future: F) -> PersistenceResult<T>
where
    F: Future<Output = PersistenceResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} exceeded its deadline of {:?}", operation, timeout);
            Err(PersistenceError::connection(format!(
                "{} timed out after {:?}",
                operation, timeout
            )))
        }
    }
}

/// Applies one deadline to every call on the wrapped adapter.
#[derive(Debug, Clone)]
pub struct DeadlineAdapter {
    inner: Arc<dyn StorageAdapter>,
    timeout: Duration,
}

impl DeadlineAdapter {
    pub fn new(inner: Arc<dyn StorageAdapter>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl StorageAdapter for DeadlineAdapter {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn health_check(&self) -> PersistenceResult<()> {
        with_deadline(self.timeout, "health_check", self.inner.health_check()).await
    }

    async fn save_dataset(&self, dataset: &Dataset) -> PersistenceResult<String> {
        with_deadline(self.timeout, "save_dataset", self.inner.save_dataset(dataset)).await
    }

    async fn get_dataset(&self, id: &str) -> PersistenceResult<Option<Dataset>> {
        with_deadline(self.timeout, "get_dataset", self.inner.get_dataset(id)).await
    }

    async fn list_datasets(&self, limit: usize) -> PersistenceResult<Vec<DatasetSummary>> {
        with_deadline(self.timeout, "list_datasets", self.inner.list_datasets(limit)).await
    }

    async fn delete_dataset(&self, id: &str) -> PersistenceResult<bool> {
        with_deadline(self.timeout, "delete_dataset", self.inner.delete_dataset(id)).await
    }

    async fn save_training_metadata(&self, metadata: &TrainingMetadata) -> PersistenceResult<String> {
        with_deadline(
            self.timeout,
            "save_training_metadata",
            self.inner.save_training_metadata(metadata),
        )
        .await
    }

    async fn get_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<Vec<TrainingMetadata>> {
        with_deadline(
            self.timeout,
            "get_training_metadata",
            self.inner.get_training_metadata(dataset_id, workspace_name),
        )
        .await
    }

    async fn delete_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<usize> {
        with_deadline(
            self.timeout,
            "delete_training_metadata",
            self.inner.delete_training_metadata(dataset_id, workspace_name),
        )
        .await
    }

    async fn mark_best_model(&self, dataset_id: &str, metadata_id: &str) -> PersistenceResult<()> {
        with_deadline(
            self.timeout,
            "mark_best_model",
            self.inner.mark_best_model(dataset_id, metadata_id),
        )
        .await
    }

    async fn save_workspace_state(&self, state: &WorkspaceState) -> PersistenceResult<String> {
        with_deadline(
            self.timeout,
            "save_workspace_state",
            self.inner.save_workspace_state(state),
        )
        .await
    }

    async fn get_workspace_state(
        &self,
        workspace_name: &str,
        dataset_id: &str,
    ) -> PersistenceResult<Option<WorkspaceState>> {
        with_deadline(
            self.timeout,
            "get_workspace_state",
            self.inner.get_workspace_state(workspace_name, dataset_id),
        )
        .await
    }

    async fn list_workspaces(&self, dataset_id: &str) -> PersistenceResult<Vec<WorkspaceSummary>> {
        with_deadline(
            self.timeout,
            "list_workspaces",
            self.inner.list_workspaces(dataset_id),
        )
        .await
    }

    async fn delete_workspace_state(&self, id: &str) -> PersistenceResult<bool> {
        with_deadline(
            self.timeout,
            "delete_workspace_state",
            self.inner.delete_workspace_state(id),
        )
        .await
    }

    async fn collect_garbage(&self, grace: Duration) -> PersistenceResult<usize> {
        with_deadline(
            self.timeout,
            "collect_garbage",
            self.inner.collect_garbage(grace),
        )
        .await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
