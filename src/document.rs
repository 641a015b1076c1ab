//! Document backend: one JSON document per record in an object store.
//!
//! ```text
//! datasets/{dataset_id}.json
//! training/{dataset_id}/{metadata_id}.json
//! workspaces/{dataset_id}/{workspace_name}.json
//! summaries/datasets/{dataset_id}.json
//! summaries/workspaces/{dataset_id}/{workspace_name}.json
//! workspace_ids/{workspace_id}.json
//! blobs/{blob_ref}
//! ```
//!
//! Listings read only the small summary objects. Writers in this process are
//! serialized per record through [`KeyedLocks`]; writers in other processes
//! are detected with conditional puts where the store supports them.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use object_store::{
    path::Path as ObjectPath, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};

use crate::adapter::{BackendKind, StorageAdapter};
use crate::blob_store::{collect_orphans, release, BlobRef};
use crate::catalog::{
    new_dataset_id, new_training_id, new_workspace_id, timestamp_now, Dataset, DatasetSummary,
    TrainingMetadata, WorkspaceState, WorkspaceSummary,
};
use crate::codec::{load_payload, store_payload, PayloadSlot, WorkspacePayload};
use crate::config::{redact_url, AdapterSettings, DocumentConfig};
use crate::error::{PersistenceError, PersistenceResult};
use crate::storage::ObjectBlobStore;
use crate::store_client::create_object_store;

const DATASETS: &str = "datasets";
const TRAINING: &str = "training";
const WORKSPACES: &str = "workspaces";
const SUMMARIES: &str = "summaries";
const WORKSPACE_IDS: &str = "workspace_ids";
const HEALTH_CHECK_PATH: &str = "_health";

const LISTING_CONCURRENCY: usize = 16;
const MAX_ATTEMPTS: usize = 3;

fn dataset_path(id: &str) -> ObjectPath {
    ObjectPath::from(DATASETS).child(format!("{}.json", id))
}

fn training_prefix(dataset_id: &str) -> ObjectPath {
    ObjectPath::from(TRAINING).child(dataset_id)
}

fn training_path(dataset_id: &str, id: &str) -> ObjectPath {
    training_prefix(dataset_id).child(format!("{}.json", id))
}

fn workspace_prefix(dataset_id: &str) -> ObjectPath {
    ObjectPath::from(WORKSPACES).child(dataset_id)
}

fn workspace_path(dataset_id: &str, workspace_name: &str) -> ObjectPath {
    workspace_prefix(dataset_id).child(format!("{}.json", workspace_name))
}

fn dataset_summary_prefix() -> ObjectPath {
    ObjectPath::from(SUMMARIES).child(DATASETS)
}

fn dataset_summary_path(id: &str) -> ObjectPath {
    dataset_summary_prefix().child(format!("{}.json", id))
}

fn workspace_summary_prefix(dataset_id: &str) -> ObjectPath {
    ObjectPath::from(SUMMARIES).child(WORKSPACES).child(dataset_id)
}

fn workspace_summary_path(dataset_id: &str, workspace_name: &str) -> ObjectPath {
    workspace_summary_prefix(dataset_id).child(format!("{}.json", workspace_name))
}

fn workspace_id_path(id: &str) -> ObjectPath {
    ObjectPath::from(WORKSPACE_IDS).child(format!("{}.json", id))
}

fn dataset_key(id: &str) -> String {
    format!("dataset/{}", id)
}

fn training_key(dataset_id: &str, workspace_name: Option<&str>) -> String {
    format!("training/{}/{}", dataset_id, workspace_name.unwrap_or(""))
}

fn workspace_key(dataset_id: &str, workspace_name: &str) -> String {
    format!("workspace/{}/{}", dataset_id, workspace_name)
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetDocument {
    id: String,
    name: String,
    row_count: i64,
    column_count: i64,
    columns: Vec<String>,
    dtypes: HashMap<String, String>,
    data_preview: Vec<serde_json::Value>,
    source_type: String,
    source_config: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(flatten)]
    content: PayloadSlot,
}

impl DatasetDocument {
    fn new(
        id: &str,
        dataset: &Dataset,
        content: PayloadSlot,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: dataset.name.clone(),
            row_count: dataset.row_count,
            column_count: dataset.column_count,
            columns: dataset.columns.clone(),
            dtypes: dataset.dtypes.clone(),
            data_preview: dataset.data_preview.clone(),
            source_type: dataset.source_type.clone(),
            source_config: dataset.source_config.clone(),
            created_at,
            updated_at,
            content,
        }
    }

    fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            row_count: self.row_count,
            column_count: self.column_count,
            columns: self.columns.clone(),
            storage_type: self.content.storage_type(),
            source_type: self.source_type.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn into_dataset(self, data: Bytes) -> Dataset {
        Dataset {
            id: self.id,
            name: self.name,
            row_count: self.row_count,
            column_count: self.column_count,
            columns: self.columns,
            dtypes: self.dtypes,
            data_preview: self.data_preview,
            storage_type: self.content.storage_type(),
            data,
            source_type: self.source_type,
            source_config: self.source_config,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkspaceDocument {
    id: String,
    workspace_name: String,
    dataset_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(flatten)]
    payload: PayloadSlot,
}

impl WorkspaceDocument {
    fn summary(&self) -> WorkspaceSummary {
        WorkspaceSummary {
            id: self.id.clone(),
            workspace_name: self.workspace_name.clone(),
            dataset_id: self.dataset_id.clone(),
            storage_type: self.payload.storage_type(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn into_state(self, payload: WorkspacePayload) -> WorkspaceState {
        let mut state = WorkspaceState {
            id: self.id,
            workspace_name: self.workspace_name,
            dataset_id: self.dataset_id,
            predictive_analysis: None,
            visualization: None,
            variable_selection: None,
            storage_type: self.payload.storage_type(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        payload.apply_to(&mut state);
        state
    }
}

/// Where the workspace with a given id lives.
#[derive(Debug, Serialize, Deserialize)]
struct WorkspaceLocation {
    dataset_id: String,
    workspace_name: String,
}

struct Versioned<T> {
    doc: T,
    version: UpdateVersion,
}

enum WriteMode {
    Create,
    Replace(UpdateVersion),
    Overwrite,
}

/// Per-record async locks, created on demand and dropped with their last guard.
#[derive(Debug, Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Weak<RwLock<()>>>>,
}

impl KeyedLocks {
    fn entry(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(RwLock::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    async fn shared(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.entry(key).read_owned().await
    }

    async fn exclusive(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.entry(key).write_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.values().filter(|lock| lock.strong_count() > 0).count()
    }
}

#[derive(Debug)]
pub struct DocumentAdapter {
    store: Arc<dyn ObjectStore>,
    blobs: ObjectBlobStore,
    settings: AdapterSettings,
    locks: KeyedLocks,
}

impl DocumentAdapter {
    pub async fn connect(
        config: &DocumentConfig,
        settings: &AdapterSettings,
    ) -> PersistenceResult<Self> {
        let store = create_object_store(&config.object_store_url)?;
        info!(
            "Document adapter using {} (offload threshold {} bytes)",
            redact_url(&config.object_store_url),
            settings.offload.threshold_bytes()
        );
        Ok(Self::new(store, *settings))
    }

    pub fn new(store: Arc<dyn ObjectStore>, settings: AdapterSettings) -> Self {
        Self {
            blobs: ObjectBlobStore::new(store.clone(), settings.part_size),
            store,
            settings,
            locks: KeyedLocks::default(),
        }
    }

    pub fn blob_store(&self) -> ObjectBlobStore {
        self.blobs.clone()
    }

    async fn store_content(&self, payload: Bytes) -> PersistenceResult<PayloadSlot> {
        store_payload(
            &self.settings.offload,
            &self.blobs,
            self.settings.part_size,
            payload,
        )
        .await
    }

    async fn read_document<T: DeserializeOwned>(
        &self,
        path: &ObjectPath,
    ) -> PersistenceResult<Option<Versioned<T>>> {
        let result = match self.store.get(path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let version = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let bytes = match result.bytes().await {
            Ok(bytes) => bytes,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let doc = serde_json::from_slice(&bytes).map_err(|e| {
            PersistenceError::corrupt(format!("Document {} cannot be decoded: {}", path, e))
        })?;
        Ok(Some(Versioned { doc, version }))
    }

    async fn write_document<T: Serialize + Sync>(
        &self,
        path: &ObjectPath,
        doc: &T,
        mode: WriteMode,
    ) -> PersistenceResult<()> {
        let payload = PutPayload::from(serde_json::to_vec(doc).map_err(|e| {
            PersistenceError::validation(format!("Document {} is not serializable: {}", path, e))
        })?);

        let put_mode = match mode {
            WriteMode::Create => PutMode::Create,
            WriteMode::Replace(version) => PutMode::Update(version),
            WriteMode::Overwrite => PutMode::Overwrite,
        };

        match self
            .store
            .put_opts(path, payload.clone(), PutOptions::from(put_mode))
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::NotImplemented { .. }) => {
                debug!("Conditional put unsupported, overwriting {}", path);
                self.store.put(path, payload).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &ObjectPath) -> PersistenceResult<bool> {
        match self.store.head(path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, path: &ObjectPath) -> PersistenceResult<bool> {
        if !self.exists(path).await? {
            return Ok(false);
        }
        match self.store.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads every document under `prefix`. Documents deleted between the
    /// listing and the read are skipped.
    async fn list_documents<T: DeserializeOwned + Send>(
        &self,
        prefix: &ObjectPath,
    ) -> PersistenceResult<Vec<T>> {
        let paths: Vec<ObjectPath> = self
            .store
            .list(Some(prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;

        let docs: Vec<Option<Versioned<T>>> = stream::iter(paths)
            .map(|path| async move { self.read_document::<T>(&path).await })
            .buffered(LISTING_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(docs.into_iter().flatten().map(|v| v.doc).collect())
    }

    async fn delete_prefix(&self, prefix: &ObjectPath) -> PersistenceResult<usize> {
        let paths: Vec<ObjectPath> = self
            .store
            .list(Some(prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;
        let mut removed = 0;
        for path in paths {
            if self.delete_object(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn require_dataset(&self, dataset_id: &str) -> PersistenceResult<()> {
        if self.exists(&dataset_path(dataset_id)).await? {
            Ok(())
        } else {
            Err(PersistenceError::not_found("dataset", dataset_id))
        }
    }

    /// Writes the dataset document, retrying when another writer replaced it
    /// between our read and write. Returns the written document and the blob
    /// the old version used.
    async fn write_dataset(
        &self,
        id: &str,
        dataset: &Dataset,
        content: &PayloadSlot,
    ) -> PersistenceResult<(DatasetDocument, Option<BlobRef>)> {
        let path = dataset_path(id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = timestamp_now();
            let (created_at, mode, previous) =
                match self.read_document::<DatasetDocument>(&path).await? {
                    Some(Versioned { doc, version }) => (
                        doc.created_at,
                        WriteMode::Replace(version),
                        doc.content.offload_ref().cloned(),
                    ),
                    None => (now, WriteMode::Create, None),
                };

            let document = DatasetDocument::new(id, dataset, content.clone(), created_at, now);
            match self.write_document(&path, &document, mode).await {
                Ok(()) => return Ok((document, previous)),
                Err(PersistenceError::Conflict { .. }) if attempt < MAX_ATTEMPTS => {
                    debug!("Dataset {} changed concurrently, retrying write", id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_workspace(
        &self,
        state: &WorkspaceState,
        payload: &PayloadSlot,
    ) -> PersistenceResult<(WorkspaceDocument, Option<BlobRef>)> {
        let path = workspace_path(&state.dataset_id, &state.workspace_name);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = timestamp_now();
            let (id, created_at, mode, previous) =
                match self.read_document::<WorkspaceDocument>(&path).await? {
                    Some(Versioned { doc, version }) => (
                        doc.id,
                        doc.created_at,
                        WriteMode::Replace(version),
                        doc.payload.offload_ref().cloned(),
                    ),
                    None => {
                        let id = if state.id.is_empty() {
                            new_workspace_id()
                        } else {
                            state.id.clone()
                        };
                        (id, now, WriteMode::Create, None)
                    }
                };

            if matches!(mode, WriteMode::Create) {
                let location = WorkspaceLocation {
                    dataset_id: state.dataset_id.clone(),
                    workspace_name: state.workspace_name.clone(),
                };
                self.write_document(&workspace_id_path(&id), &location, WriteMode::Overwrite)
                    .await?;
            }

            let document = WorkspaceDocument {
                id,
                workspace_name: state.workspace_name.clone(),
                dataset_id: state.dataset_id.clone(),
                created_at,
                updated_at: now,
                payload: payload.clone(),
            };
            match self.write_document(&path, &document, mode).await {
                Ok(()) => return Ok((document, previous)),
                Err(PersistenceError::Conflict { .. }) if attempt < MAX_ATTEMPTS => {
                    debug!(
                        "Workspace {} of dataset {} changed concurrently, retrying write",
                        state.workspace_name, state.dataset_id
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn training_records(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<Vec<TrainingMetadata>> {
        let records: Vec<TrainingMetadata> =
            self.list_documents(&training_prefix(dataset_id)).await?;
        Ok(records
            .into_iter()
            .filter(|r| workspace_name.map_or(true, |ws| r.workspace_name.as_deref() == Some(ws)))
            .collect())
    }

    /// Clears `is_best` on every member of the group except `keep_id`.
    async fn clear_best(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
        keep_id: &str,
    ) -> PersistenceResult<usize> {
        let records: Vec<TrainingMetadata> =
            self.list_documents(&training_prefix(dataset_id)).await?;
        let mut cleared = 0;
        for mut record in records {
            if record.is_best
                && record.id != keep_id
                && record.workspace_name.as_deref() == workspace_name
            {
                record.is_best = false;
                self.write_document(
                    &training_path(dataset_id, &record.id),
                    &record,
                    WriteMode::Overwrite,
                )
                .await?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn delete_training_documents(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<usize> {
        let mut removed = 0;
        for record in self.training_records(dataset_id, workspace_name).await? {
            if self
                .delete_object(&training_path(dataset_id, &record.id))
                .await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_children(&self, dataset_id: &str) -> PersistenceResult<(usize, usize)> {
        let training = self.delete_training_documents(dataset_id, None).await?;

        let documents: Vec<WorkspaceDocument> =
            self.list_documents(&workspace_prefix(dataset_id)).await?;
        let mut workspaces = 0;
        for doc in documents {
            self.delete_object(&workspace_summary_path(dataset_id, &doc.workspace_name))
                .await?;
            if self
                .delete_object(&workspace_path(dataset_id, &doc.workspace_name))
                .await?
            {
                release(&self.blobs, doc.payload.offload_ref()).await;
                workspaces += 1;
            }
            self.delete_object(&workspace_id_path(&doc.id)).await?;
        }
        self.delete_prefix(&workspace_summary_prefix(dataset_id))
            .await?;

        Ok((training, workspaces))
    }
}

#[async_trait]
impl StorageAdapter for DocumentAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn health_check(&self) -> PersistenceResult<()> {
        match self.store.head(&ObjectPath::from(HEALTH_CHECK_PATH)).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(PersistenceError::connection(format!(
                "Object store is unreachable: {}",
                e
            ))),
        }
    }

    async fn save_dataset(&self, dataset: &Dataset) -> PersistenceResult<String> {
        dataset.validate()?;
        let id = if dataset.id.is_empty() {
            new_dataset_id()
        } else {
            dataset.id.clone()
        };
        let _dataset = self.locks.exclusive(&dataset_key(&id)).await;

        let content = self.store_content(dataset.data.clone()).await?;
        match self.write_dataset(&id, dataset, &content).await {
            Ok((document, previous)) => {
                if previous.as_ref() != content.offload_ref() {
                    release(&self.blobs, previous.as_ref()).await;
                }
                self.write_document(
                    &dataset_summary_path(&id),
                    &document.summary(),
                    WriteMode::Overwrite,
                )
                .await?;
                info!(
                    "Saved dataset {} '{}' ({} bytes, {})",
                    id,
                    dataset.name,
                    dataset.data.len(),
                    content.storage_type()
                );
                Ok(id)
            }
            Err(e) => {
                release(&self.blobs, content.offload_ref()).await;
                Err(e)
            }
        }
    }

    async fn get_dataset(&self, id: &str) -> PersistenceResult<Option<Dataset>> {
        let path = dataset_path(id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(Versioned { doc, .. }) = self.read_document::<DatasetDocument>(&path).await?
            else {
                return Ok(None);
            };

            match load_payload(&self.blobs, &doc.content).await {
                Ok(data) => return Ok(Some(doc.into_dataset(data))),
                // A concurrent replace or delete may have released the blob;
                // the record is read again before reporting corruption.
                Err(PersistenceError::CorruptPayload { message }) if attempt < MAX_ATTEMPTS => {
                    debug!("Re-reading dataset {}: {}", id, message);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn list_datasets(&self, limit: usize) -> PersistenceResult<Vec<DatasetSummary>> {
        let mut summaries: Vec<DatasetSummary> =
            self.list_documents(&dataset_summary_prefix()).await?;
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn delete_dataset(&self, id: &str) -> PersistenceResult<bool> {
        let path = dataset_path(id);
        let _dataset = self.locks.exclusive(&dataset_key(id)).await;
        let Some(Versioned { doc, .. }) = self.read_document::<DatasetDocument>(&path).await?
        else {
            return Ok(false);
        };

        self.delete_object(&dataset_summary_path(id)).await?;
        let (training, workspaces) = self.delete_children(id).await?;
        self.delete_object(&path).await?;
        // Children written by another process while the first sweep ran.
        let (late_training, late_workspaces) = self.delete_children(id).await?;
        release(&self.blobs, doc.content.offload_ref()).await;

        info!(
            "Deleted dataset {} with {} training records and {} workspace states",
            id,
            training + late_training,
            workspaces + late_workspaces
        );
        Ok(true)
    }

    async fn save_training_metadata(&self, metadata: &TrainingMetadata) -> PersistenceResult<String> {
        metadata.validate()?;
        let mut record = metadata.clone();
        if record.id.is_empty() {
            record.id = new_training_id();
        }

        let _dataset = self.locks.shared(&dataset_key(&record.dataset_id)).await;
        let _group = self
            .locks
            .exclusive(&training_key(&record.dataset_id, record.workspace_name.as_deref()))
            .await;
        self.require_dataset(&record.dataset_id).await?;

        let path = training_path(&record.dataset_id, &record.id);
        if self.exists(&path).await? {
            return Err(PersistenceError::conflict(format!(
                "Training metadata {} already exists",
                record.id
            )));
        }

        if record.is_best {
            self.clear_best(&record.dataset_id, record.workspace_name.as_deref(), &record.id)
                .await?;
        }
        self.write_document(&path, &record, WriteMode::Create)
            .await?;

        info!(
            "Saved training metadata {} for dataset {} (model {}, best: {})",
            record.id, record.dataset_id, record.model_name, record.is_best
        );
        Ok(record.id)
    }

    async fn get_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<Vec<TrainingMetadata>> {
        let mut records = self.training_records(dataset_id, workspace_name).await?;
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(records)
    }

    async fn delete_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<usize> {
        let _dataset = self.locks.shared(&dataset_key(dataset_id)).await;
        let removed = self
            .delete_training_documents(dataset_id, workspace_name)
            .await?;
        info!(
            "Deleted {} training records for dataset {}",
            removed, dataset_id
        );
        Ok(removed)
    }

    async fn mark_best_model(&self, dataset_id: &str, metadata_id: &str) -> PersistenceResult<()> {
        let path = training_path(dataset_id, metadata_id);
        let Some(Versioned { doc: target, .. }) =
            self.read_document::<TrainingMetadata>(&path).await?
        else {
            return Err(PersistenceError::not_found("training_metadata", metadata_id));
        };

        let _dataset = self.locks.shared(&dataset_key(dataset_id)).await;
        let _group = self
            .locks
            .exclusive(&training_key(dataset_id, target.workspace_name.as_deref()))
            .await;

        let Some(Versioned { doc: mut target, .. }) =
            self.read_document::<TrainingMetadata>(&path).await?
        else {
            return Err(PersistenceError::not_found("training_metadata", metadata_id));
        };

        let cleared = self
            .clear_best(dataset_id, target.workspace_name.as_deref(), metadata_id)
            .await?;
        if !target.is_best {
            target.is_best = true;
            self.write_document(&path, &target, WriteMode::Overwrite)
                .await?;
        }

        info!(
            "Marked {} as best model for dataset {} ({} cleared)",
            metadata_id, dataset_id, cleared
        );
        Ok(())
    }

    async fn save_workspace_state(&self, state: &WorkspaceState) -> PersistenceResult<String> {
        state.validate()?;
        let _dataset = self.locks.shared(&dataset_key(&state.dataset_id)).await;
        let _workspace = self
            .locks
            .exclusive(&workspace_key(&state.dataset_id, &state.workspace_name))
            .await;
        self.require_dataset(&state.dataset_id).await?;

        let encoded = WorkspacePayload::from_state(state).encode()?;
        let encoded_len = encoded.len();
        let payload = self.store_content(encoded).await?;

        match self.write_workspace(state, &payload).await {
            Ok((document, previous)) => {
                if previous.as_ref() != payload.offload_ref() {
                    release(&self.blobs, previous.as_ref()).await;
                }
                self.write_document(
                    &workspace_summary_path(&state.dataset_id, &state.workspace_name),
                    &document.summary(),
                    WriteMode::Overwrite,
                )
                .await?;
                info!(
                    "Saved workspace '{}' for dataset {} ({} bytes, {})",
                    state.workspace_name,
                    state.dataset_id,
                    encoded_len,
                    payload.storage_type()
                );
                Ok(document.id)
            }
            Err(e) => {
                release(&self.blobs, payload.offload_ref()).await;
                Err(e)
            }
        }
    }

    async fn get_workspace_state(
        &self,
        workspace_name: &str,
        dataset_id: &str,
    ) -> PersistenceResult<Option<WorkspaceState>> {
        let path = workspace_path(dataset_id, workspace_name);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(Versioned { doc, .. }) =
                self.read_document::<WorkspaceDocument>(&path).await?
            else {
                return Ok(None);
            };

            match load_payload(&self.blobs, &doc.payload).await {
                Ok(bytes) => {
                    let payload = WorkspacePayload::decode(&bytes)?;
                    return Ok(Some(doc.into_state(payload)));
                }
                Err(PersistenceError::CorruptPayload { message }) if attempt < MAX_ATTEMPTS => {
                    debug!(
                        "Re-reading workspace '{}' of dataset {}: {}",
                        workspace_name, dataset_id, message
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn list_workspaces(&self, dataset_id: &str) -> PersistenceResult<Vec<WorkspaceSummary>> {
        let mut summaries: Vec<WorkspaceSummary> =
            self.list_documents(&workspace_summary_prefix(dataset_id)).await?;
        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(summaries)
    }

    async fn delete_workspace_state(&self, id: &str) -> PersistenceResult<bool> {
        let index = workspace_id_path(id);
        let Some(Versioned { doc: found, .. }) =
            self.read_document::<WorkspaceLocation>(&index).await?
        else {
            return Ok(false);
        };

        let _dataset = self.locks.shared(&dataset_key(&found.dataset_id)).await;
        let _workspace = self
            .locks
            .exclusive(&workspace_key(&found.dataset_id, &found.workspace_name))
            .await;

        let path = workspace_path(&found.dataset_id, &found.workspace_name);
        let current = self.read_document::<WorkspaceDocument>(&path).await?;
        let Some(Versioned { doc, .. }) = current.filter(|v| v.doc.id == id) else {
            debug!("Dropping stale index entry for workspace {}", id);
            self.delete_object(&index).await?;
            return Ok(false);
        };

        self.delete_object(&workspace_summary_path(&doc.dataset_id, &doc.workspace_name))
            .await?;
        let removed = self.delete_object(&path).await?;
        self.delete_object(&index).await?;
        if removed {
            release(&self.blobs, doc.payload.offload_ref()).await;
            info!(
                "Deleted workspace '{}' ({}) of dataset {}",
                doc.workspace_name, id, doc.dataset_id
            );
        }
        Ok(removed)
    }

    async fn collect_garbage(&self, grace: Duration) -> PersistenceResult<usize> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| PersistenceError::validation(format!("Invalid grace period: {}", e)))?;
        let cutoff = Utc::now() - grace;

        let mut referenced = HashSet::new();
        let datasets: Vec<DatasetDocument> =
            self.list_documents(&ObjectPath::from(DATASETS)).await?;
        referenced.extend(
            datasets
                .iter()
                .filter_map(|doc| doc.content.offload_ref().cloned()),
        );
        let workspaces: Vec<WorkspaceDocument> =
            self.list_documents(&ObjectPath::from(WORKSPACES)).await?;
        referenced.extend(
            workspaces
                .iter()
                .filter_map(|doc| doc.payload.offload_ref().cloned()),
        );

        let removed = collect_orphans(&self.blobs, &referenced, cutoff).await?;
        info!(
            "Garbage collection removed {} orphaned blobs ({} referenced)",
            removed,
            referenced.len()
        );
        Ok(removed)
    }

    async fn close(&self) {
        info!("Closing document adapter");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StorageType;
    use crate::codec::OffloadPolicy;
    use object_store::memory::InMemory;

    fn adapter(threshold: usize) -> (Arc<InMemory>, DocumentAdapter) {
        let store = Arc::new(InMemory::new());
        let settings = AdapterSettings {
            offload: OffloadPolicy::new(threshold),
            part_size: 64,
            ..AdapterSettings::default()
        };
        (store.clone(), DocumentAdapter::new(store, settings))
    }

    async fn raw_json(store: &InMemory, path: &ObjectPath) -> serde_json::Value {
        let bytes = store.get(path).await.unwrap().bytes().await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn inline_dataset_document_has_no_offload_ref() {
        let (store, adapter) = adapter(1024);
        let id = adapter
            .save_dataset(&Dataset::new("small", Bytes::from_static(b"a,b\n1,2\n")))
            .await
            .unwrap();

        let json = raw_json(&store, &dataset_path(&id)).await;
        assert_eq!(json["storage_type"], "inline");
        assert!(json.get("inline_data").is_some());
        assert!(json.get("offload_ref").is_none());
    }

    #[tokio::test]
    async fn offloaded_dataset_document_only_keeps_the_reference() {
        let (store, adapter) = adapter(16);
        let payload = Bytes::from(vec![7u8; 500]);
        let id = adapter
            .save_dataset(&Dataset::new("large", payload.clone()))
            .await
            .unwrap();

        let json = raw_json(&store, &dataset_path(&id)).await;
        assert_eq!(json["storage_type"], "offloaded");
        assert!(json.get("inline_data").is_none());
        let blob_ref = json["offload_ref"].as_str().unwrap().to_string();

        let loaded = adapter.get_dataset(&id).await.unwrap().unwrap();
        assert_eq!(loaded.data, payload);

        // Replacing with small content releases the old blob.
        let mut replacement = loaded.clone();
        replacement.data = Bytes::from_static(b"tiny");
        adapter.save_dataset(&replacement).await.unwrap();
        let blob_path = ObjectPath::from("blobs").child(blob_ref.as_str());
        assert!(store.head(&blob_path).await.is_err());
    }

    #[tokio::test]
    async fn workspace_names_are_encoded_in_paths() {
        let (_store, adapter) = adapter(1024);
        let dataset_id = adapter
            .save_dataset(&Dataset::new("ds", Bytes::new()))
            .await
            .unwrap();

        let state = WorkspaceState::new("q1/churn", &dataset_id);
        adapter.save_workspace_state(&state).await.unwrap();

        let loaded = adapter
            .get_workspace_state("q1/churn", &dataset_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.workspace_name, "q1/churn");
        assert_eq!(adapter.list_workspaces(&dataset_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listings_read_summaries_instead_of_records() {
        let (store, adapter) = adapter(1 << 20);
        let dataset_id = adapter
            .save_dataset(&Dataset::new("listed", Bytes::from(vec![1u8; 4_096])))
            .await
            .unwrap();
        adapter
            .save_workspace_state(&WorkspaceState::new("q1", &dataset_id))
            .await
            .unwrap();

        // Records that can no longer be decoded do not affect listings.
        let garbage = PutPayload::from_static(b"not json");
        store
            .put(&dataset_path(&dataset_id), garbage.clone())
            .await
            .unwrap();
        store
            .put(&workspace_path(&dataset_id, "q1"), garbage)
            .await
            .unwrap();

        let datasets = adapter.list_datasets(10).await.unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].name, "listed");
        assert_eq!(datasets[0].storage_type, StorageType::Inline);

        let workspaces = adapter.list_workspaces(&dataset_id).await.unwrap();
        assert_eq!(workspaces.len(), 1);
        assert_eq!(workspaces[0].workspace_name, "q1");
    }

    #[tokio::test]
    async fn workspace_delete_by_id_follows_the_index() {
        let (store, adapter) = adapter(1024);
        let dataset_id = adapter
            .save_dataset(&Dataset::new("ds", Bytes::new()))
            .await
            .unwrap();
        let keep = adapter
            .save_workspace_state(&WorkspaceState::new("keep", &dataset_id))
            .await
            .unwrap();
        let dropped = adapter
            .save_workspace_state(&WorkspaceState::new("drop", &dataset_id))
            .await
            .unwrap();
        let location = raw_json(&store, &workspace_id_path(&dropped)).await;
        assert_eq!(location["workspace_name"], "drop");

        assert!(adapter.delete_workspace_state(&dropped).await.unwrap());

        assert!(store.head(&workspace_id_path(&dropped)).await.is_err());
        assert!(store
            .head(&workspace_summary_path(&dataset_id, "drop"))
            .await
            .is_err());
        let remaining = adapter.list_workspaces(&dataset_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, keep);
        assert!(!adapter.delete_workspace_state(&dropped).await.unwrap());
    }

    #[tokio::test]
    async fn stale_index_entries_are_dropped() {
        let (store, adapter) = adapter(1024);
        let dataset_id = adapter
            .save_dataset(&Dataset::new("ds", Bytes::new()))
            .await
            .unwrap();
        let id = adapter
            .save_workspace_state(&WorkspaceState::new("q1", &dataset_id))
            .await
            .unwrap();
        store
            .delete(&workspace_path(&dataset_id, "q1"))
            .await
            .unwrap();

        assert!(!adapter.delete_workspace_state(&id).await.unwrap());
        assert!(store.head(&workspace_id_path(&id)).await.is_err());
    }

    #[tokio::test]
    async fn dataset_delete_removes_summaries_and_index_entries() {
        let (store, adapter) = adapter(1024);
        let dataset_id = adapter
            .save_dataset(&Dataset::new("ds", Bytes::new()))
            .await
            .unwrap();
        let workspace_id = adapter
            .save_workspace_state(&WorkspaceState::new("q1", &dataset_id))
            .await
            .unwrap();

        assert!(adapter.delete_dataset(&dataset_id).await.unwrap());

        assert!(store.head(&dataset_summary_path(&dataset_id)).await.is_err());
        assert!(store
            .head(&workspace_summary_path(&dataset_id, "q1"))
            .await
            .is_err());
        assert!(store.head(&workspace_id_path(&workspace_id)).await.is_err());
        assert!(adapter.list_datasets(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keyed_locks_are_released_with_their_guards() {
        let locks = KeyedLocks::default();
        {
            let _a = locks.exclusive("a").await;
            let _b = locks.shared("b").await;
            let _b2 = locks.shared("b").await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);
    }
}
