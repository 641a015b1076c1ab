//! The storage contract shared by every backend. `tests/adapter_contract.rs`
//! runs the same checks against each implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{Dataset, DatasetSummary, TrainingMetadata, WorkspaceState, WorkspaceSummary};
use crate::config::{AdapterSettings, BackendConfig};
use crate::database::RelationalAdapter;
use crate::deadline::with_deadline;
use crate::document::DocumentAdapter;
use crate::error::{PersistenceError, PersistenceResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BackendKind {
    #[serde(rename = "document")]
    Document,
    #[serde(rename = "relational")]
    Relational,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Document => "document",
            BackendKind::Relational => "relational",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = PersistenceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "document" | "mongodb" => Ok(BackendKind::Document),
            "relational" | "postgres" | "postgresql" => Ok(BackendKind::Relational),
            other => Err(PersistenceError::config(format!(
                "Unknown storage backend: {}",
                other
            ))),
        }
    }
}

#[async_trait]
pub trait StorageAdapter: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> BackendKind;

    async fn health_check(&self) -> PersistenceResult<()>;

    /// Re-saving an existing id replaces the record and keeps its `created_at`.
    async fn save_dataset(&self, dataset: &Dataset) -> PersistenceResult<String>;

    async fn get_dataset(&self, id: &str) -> PersistenceResult<Option<Dataset>>;

    /// Newest first by `created_at`.
    async fn list_datasets(&self, limit: usize) -> PersistenceResult<Vec<DatasetSummary>>;

    /// Removes training metadata, workspace states and blobs owned by the
    /// dataset, then the dataset. Returns false if it did not exist.
    async fn delete_dataset(&self, id: &str) -> PersistenceResult<bool>;

    /// Insert only: an existing id is a `Conflict`. Saving a record with
    /// `is_best` clears the flag on the rest of its group.
    async fn save_training_metadata(&self, metadata: &TrainingMetadata) -> PersistenceResult<String>;

    /// Newest first; restricted to one workspace when `workspace_name` is given.
    async fn get_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<Vec<TrainingMetadata>>;

    async fn delete_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<usize>;

    async fn mark_best_model(&self, dataset_id: &str, metadata_id: &str) -> PersistenceResult<()>;

    /// Upserts on `(workspace_name, dataset_id)`; the whole record is replaced.
    async fn save_workspace_state(&self, state: &WorkspaceState) -> PersistenceResult<String>;

    async fn get_workspace_state(
        &self,
        workspace_name: &str,
        dataset_id: &str,
    ) -> PersistenceResult<Option<WorkspaceState>>;

    /// Newest first by `updated_at`.
    async fn list_workspaces(&self, dataset_id: &str) -> PersistenceResult<Vec<WorkspaceSummary>>;

    async fn delete_workspace_state(&self, id: &str) -> PersistenceResult<bool>;

    /// Deletes blobs older than `grace` that no committed record references.
    async fn collect_garbage(&self, grace: Duration) -> PersistenceResult<usize>;

    /// Releases backend resources once calls already in flight have finished.
    async fn close(&self);
}

/// Connects the adapter described by `config` and verifies it is reachable
/// within `settings.connect_timeout`.
pub async fn connect(
    config: &BackendConfig,
    settings: &AdapterSettings,
) -> PersistenceResult<Arc<dyn StorageAdapter>> {
    with_deadline(settings.connect_timeout, "connect", async {
        let adapter: Arc<dyn StorageAdapter> = match config {
            BackendConfig::Document(document) => {
                Arc::new(DocumentAdapter::connect(document, settings).await?)
            }
            BackendConfig::Relational(relational) => {
                Arc::new(RelationalAdapter::connect(relational, settings).await?)
            }
        };

        adapter.health_check().await?;
        Ok(adapter)
    })
    .await
}

/// Assigns an id to `dataset` if it has none.
pub fn ensure_dataset_id(dataset: &mut Dataset) -> &str {
    if dataset.id.is_empty() {
        dataset.id = crate::catalog::new_dataset_id();
    }
    &dataset.id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!("document".parse::<BackendKind>().unwrap(), BackendKind::Document);
        assert_eq!("MongoDB".parse::<BackendKind>().unwrap(), BackendKind::Document);
        assert_eq!("postgres".parse::<BackendKind>().unwrap(), BackendKind::Relational);
        assert!("sqlite".parse::<BackendKind>().is_err());
    }

    #[test]
    fn ensure_dataset_id_keeps_existing_ids() {
        let mut fresh = Dataset::new("a", bytes::Bytes::new());
        let id = ensure_dataset_id(&mut fresh).to_string();
        assert!(id.starts_with("ds_"));

        let mut named = Dataset::new("b", bytes::Bytes::new());
        named.id = "ds_fixed".into();
        assert_eq!(ensure_dataset_id(&mut named), "ds_fixed");
    }
}
