//! Relational backend on PostgreSQL through diesel-async. A committed row
//! never points at a deleted blob: blobs a write makes unreachable are
//! released inside the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use deadpool::Runtime;
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    AsyncConnection, AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info};

use crate::adapter::{BackendKind, StorageAdapter};
use crate::blob_store::{collect_orphans, release, BlobRef};
use crate::catalog::{
    new_dataset_id, new_training_id, new_workspace_id, timestamp_now, Dataset, DatasetSummary,
    TrainingMetadata, WorkspaceState, WorkspaceSummary,
};
use crate::codec::{load_payload, store_payload, PayloadSlot, WorkspacePayload};
use crate::config::{redact_url, AdapterSettings, RelationalConfig};
use crate::error::{PersistenceError, PersistenceResult};
use crate::models::*;
use crate::relational_blobs::{delete_blob, RelationalBlobStore};
use crate::schema::*;

const SCHEMA_SQL: &str =
    include_str!("../migrations/2024-06-01-000000_create_persistence_tables/up.sql");

/// Advisory lock held while the schema is created, so concurrent first
/// connections do not race on `CREATE TABLE IF NOT EXISTS`.
const SCHEMA_LOCK_KEY: i64 = 0x616e_616c_7973_6973;

const MAX_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct RelationalAdapter {
    pool: Pool<AsyncPgConnection>,
    blobs: RelationalBlobStore,
    settings: AdapterSettings,
    /// Held shared by every running call; `close` takes it exclusively.
    running: Arc<RwLock<()>>,
}

impl std::fmt::Debug for RelationalAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("RelationalAdapter")
            .field("pool_size", &status.size)
            .field("pool_max_size", &status.max_size)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Runs `attempt` again when it lost a race on a unique key. The loser's
/// transaction rolled back, so the retry sees the winner's row and updates it.
async fn retry_on_conflict<T, F, Fut>(operation: &str, mut attempt: F) -> PersistenceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PersistenceResult<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Err(PersistenceError::Conflict { message }) if attempts < MAX_ATTEMPTS => {
                debug!("{} raced another writer, retrying: {}", operation, message);
            }
            other => return other,
        }
    }
}

/// Takes a share lock on the dataset row so it cannot be deleted while a
/// child row is written for it.
async fn lock_dataset(conn: &mut AsyncPgConnection, dataset_id: &str) -> PersistenceResult<()> {
    let found = datasets::table
        .find(dataset_id)
        .select(datasets::id)
        .for_share()
        .first::<String>(conn)
        .await
        .optional()?;

    found
        .map(|_| ())
        .ok_or_else(|| PersistenceError::not_found("dataset", dataset_id))
}

impl RelationalAdapter {
    pub async fn connect(
        config: &RelationalConfig,
        settings: &AdapterSettings,
    ) -> PersistenceResult<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
        let pool = Pool::builder(manager)
            .max_size(config.max_connections.max(1))
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(settings.connect_timeout))
            .create_timeout(Some(settings.connect_timeout))
            .recycle_timeout(Some(settings.connect_timeout))
            .build()
            .map_err(|e| {
                PersistenceError::config(format!("Failed to create database pool: {}", e))
            })?;

        let adapter = Self::from_pool(pool, *settings);
        adapter.bootstrap_schema().await?;

        info!(
            "Relational adapter connected to {} (max {} connections, offload threshold {} bytes)",
            redact_url(&config.database_url),
            config.max_connections,
            settings.offload.threshold_bytes()
        );
        Ok(adapter)
    }

    /// Wraps an existing pool. No connection is made until the first call.
    pub fn from_pool(pool: Pool<AsyncPgConnection>, settings: AdapterSettings) -> Self {
        Self {
            blobs: RelationalBlobStore::new(pool.clone(), settings.part_size),
            pool,
            settings,
            running: Arc::new(RwLock::new(())),
        }
    }

    pub fn blob_store(&self) -> RelationalBlobStore {
        self.blobs.clone()
    }

    async fn begin(&self) -> OwnedRwLockReadGuard<()> {
        self.running.clone().read_owned().await
    }

    async fn bootstrap_schema(&self) -> PersistenceResult<()> {
        let mut conn = self.pool.get().await?;
        let script = format!(
            "BEGIN;\nSELECT pg_advisory_xact_lock({});\n{}\nCOMMIT;",
            SCHEMA_LOCK_KEY, SCHEMA_SQL
        );
        conn.batch_execute(&script).await?;
        debug!("Schema bootstrap complete");
        Ok(())
    }

    async fn store_content(&self, payload: bytes::Bytes) -> PersistenceResult<PayloadSlot> {
        store_payload(
            &self.settings.offload,
            &self.blobs,
            self.settings.part_size,
            payload,
        )
        .await
    }

    async fn write_dataset(&self, mut row: DatasetRow) -> PersistenceResult<()> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, PersistenceError, _>(|conn| {
            Box::pin(async move {
                let previous = datasets::table
                    .find(&row.id)
                    .select((datasets::created_at, datasets::offload_ref))
                    .for_update()
                    .first::<(DateTime<Utc>, Option<String>)>(conn)
                    .await
                    .optional()?;

                match previous {
                    Some((created_at, old_ref)) => {
                        row.created_at = created_at;
                        diesel::update(datasets::table.find(&row.id))
                            .set(&row)
                            .execute(conn)
                            .await?;
                        if let Some(old_ref) = old_ref.filter(|r| Some(r) != row.offload_ref.as_ref()) {
                            delete_blob(conn, &BlobRef::from(old_ref)).await?;
                        }
                    }
                    None => {
                        diesel::insert_into(datasets::table)
                            .values(&row)
                            .execute(conn)
                            .await?;
                    }
                }

                Ok(())
            })
        })
        .await
    }

    async fn write_training(&self, row: TrainingMetadataRow) -> PersistenceResult<()> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, PersistenceError, _>(|conn| {
            Box::pin(async move {
                lock_dataset(conn, &row.dataset_id).await?;

                if row.is_best {
                    diesel::update(
                        training_metadata::table
                            .filter(training_metadata::dataset_id.eq(&row.dataset_id))
                            .filter(
                                training_metadata::workspace_name
                                    .is_not_distinct_from(row.workspace_name.as_deref()),
                            )
                            .filter(training_metadata::id.ne(&row.id))
                            .filter(training_metadata::is_best.eq(true)),
                    )
                    .set(training_metadata::is_best.eq(false))
                    .execute(conn)
                    .await?;
                }

                diesel::insert_into(training_metadata::table)
                    .values(&row)
                    .execute(conn)
                    .await?;

                Ok(())
            })
        })
        .await
    }

    async fn write_best(&self, dataset_id: &str, metadata_id: &str) -> PersistenceResult<usize> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, PersistenceError, _>(|conn| {
            Box::pin(async move {
                let target = training_metadata::table
                    .find(metadata_id)
                    .filter(training_metadata::dataset_id.eq(dataset_id))
                    .select(training_metadata::workspace_name)
                    .for_update()
                    .first::<Option<String>>(conn)
                    .await
                    .optional()?;

                let Some(workspace_name) = target else {
                    return Err(PersistenceError::not_found("training_metadata", metadata_id));
                };

                let cleared = diesel::update(
                    training_metadata::table
                        .filter(training_metadata::dataset_id.eq(dataset_id))
                        .filter(
                            training_metadata::workspace_name
                                .is_not_distinct_from(workspace_name.as_deref()),
                        )
                        .filter(training_metadata::id.ne(metadata_id))
                        .filter(training_metadata::is_best.eq(true)),
                )
                .set(training_metadata::is_best.eq(false))
                .execute(conn)
                .await?;

                diesel::update(training_metadata::table.find(metadata_id))
                    .set(training_metadata::is_best.eq(true))
                    .execute(conn)
                    .await?;

                Ok(cleared)
            })
        })
        .await
    }

    async fn write_workspace(&self, mut row: WorkspaceStateRow) -> PersistenceResult<String> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, PersistenceError, _>(|conn| {
            Box::pin(async move {
                lock_dataset(conn, &row.dataset_id).await?;

                let existing = workspace_states::table
                    .filter(workspace_states::workspace_name.eq(&row.workspace_name))
                    .filter(workspace_states::dataset_id.eq(&row.dataset_id))
                    .select((
                        workspace_states::id,
                        workspace_states::created_at,
                        workspace_states::offload_ref,
                    ))
                    .for_update()
                    .first::<(String, DateTime<Utc>, Option<String>)>(conn)
                    .await
                    .optional()?;

                match existing {
                    Some((id, created_at, old_ref)) => {
                        row.id = id;
                        row.created_at = created_at;
                        diesel::update(workspace_states::table.find(&row.id))
                            .set(&row)
                            .execute(conn)
                            .await?;
                        if let Some(old_ref) = old_ref.filter(|r| Some(r) != row.offload_ref.as_ref()) {
                            delete_blob(conn, &BlobRef::from(old_ref)).await?;
                        }
                    }
                    None => {
                        diesel::insert_into(workspace_states::table)
                            .values(&row)
                            .execute(conn)
                            .await?;
                    }
                }

                Ok(row.id)
            })
        })
        .await
    }
}

#[async_trait]
impl StorageAdapter for RelationalAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn health_check(&self) -> PersistenceResult<()> {
        let _running = self.begin().await;
        let mut conn = self.pool.get().await?;
        diesel::sql_query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(|e| PersistenceError::connection(format!("Database is unreachable: {}", e)))?;
        Ok(())
    }

    async fn save_dataset(&self, dataset: &Dataset) -> PersistenceResult<String> {
        let _running = self.begin().await;
        dataset.validate()?;
        let content = self.store_content(dataset.data.clone()).await?;
        let storage_type = content.storage_type();

        let now = timestamp_now();
        let mut record = dataset.clone();
        if record.id.is_empty() {
            record.id = new_dataset_id();
        }
        record.created_at = now;
        record.updated_at = now;
        let row = DatasetRow::from_dataset(&record, content.clone())?;

        match retry_on_conflict("save_dataset", move || self.write_dataset(row.clone())).await {
            Ok(()) => {
                info!(
                    "Saved dataset {} '{}' ({} bytes, {})",
                    record.id,
                    record.name,
                    record.data.len(),
                    storage_type
                );
                Ok(record.id)
            }
            Err(e) => {
                release(&self.blobs, content.offload_ref()).await;
                Err(e)
            }
        }
    }

    async fn get_dataset(&self, id: &str) -> PersistenceResult<Option<Dataset>> {
        let _running = self.begin().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let row = {
                let mut conn = self.pool.get().await?;
                datasets::table
                    .find(id)
                    .select(DatasetRow::as_select())
                    .first::<DatasetRow>(&mut conn)
                    .await
                    .optional()?
            };
            let Some(row) = row else {
                return Ok(None);
            };

            let (mut dataset, content) = row.into_dataset()?;
            match load_payload(&self.blobs, &content).await {
                Ok(data) => {
                    dataset.data = data;
                    return Ok(Some(dataset));
                }
                // A concurrent replace or delete may have released the blob;
                // the row is read again before reporting corruption.
                Err(PersistenceError::CorruptPayload { message }) if attempt < MAX_ATTEMPTS => {
                    debug!("Re-reading dataset {}: {}", id, message);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn list_datasets(&self, limit: usize) -> PersistenceResult<Vec<DatasetSummary>> {
        let _running = self.begin().await;
        let mut conn = self.pool.get().await?;
        let rows = datasets::table
            .select(DatasetSummaryRow::as_select())
            .order((datasets::created_at.desc(), datasets::id.desc()))
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .load::<DatasetSummaryRow>(&mut conn)
            .await?;

        rows.into_iter().map(DatasetSummary::try_from).collect()
    }

    async fn delete_dataset(&self, id: &str) -> PersistenceResult<bool> {
        let _running = self.begin().await;
        let mut conn = self.pool.get().await?;
        let outcome = conn
            .transaction::<_, PersistenceError, _>(|conn| {
                Box::pin(async move {
                    let existing = datasets::table
                        .find(id)
                        .select(datasets::offload_ref)
                        .for_update()
                        .first::<Option<String>>(conn)
                        .await
                        .optional()?;
                    let Some(dataset_ref) = existing else {
                        return Ok(None);
                    };

                    let workspace_refs = workspace_states::table
                        .filter(workspace_states::dataset_id.eq(id))
                        .select(workspace_states::offload_ref)
                        .load::<Option<String>>(conn)
                        .await?;

                    let training = diesel::delete(
                        training_metadata::table.filter(training_metadata::dataset_id.eq(id)),
                    )
                    .execute(conn)
                    .await?;
                    let workspaces = diesel::delete(
                        workspace_states::table.filter(workspace_states::dataset_id.eq(id)),
                    )
                    .execute(conn)
                    .await?;
                    diesel::delete(datasets::table.find(id))
                        .execute(conn)
                        .await?;

                    for blob_ref in dataset_ref
                        .into_iter()
                        .chain(workspace_refs.into_iter().flatten())
                    {
                        delete_blob(conn, &BlobRef::from(blob_ref)).await?;
                    }

                    Ok(Some((training, workspaces)))
                })
            })
            .await?;

        match outcome {
            Some((training, workspaces)) => {
                info!(
                    "Deleted dataset {} with {} training records and {} workspace states",
                    id, training, workspaces
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save_training_metadata(&self, metadata: &TrainingMetadata) -> PersistenceResult<String> {
        let _running = self.begin().await;
        metadata.validate()?;
        let mut record = metadata.clone();
        if record.id.is_empty() {
            record.id = new_training_id();
        }
        let row = TrainingMetadataRow::from_metadata(&record)?;

        retry_on_conflict("save_training_metadata", move || {
            self.write_training(row.clone())
        })
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
        let _running = self.begin().await;
        let mut conn = self.pool.get().await?;
        let mut query = training_metadata::table
            .select(TrainingMetadataRow::as_select())
            .filter(training_metadata::dataset_id.eq(dataset_id))
            .into_boxed();
        if let Some(workspace_name) = workspace_name {
            query = query.filter(training_metadata::workspace_name.eq(workspace_name));
        }

        let rows = query
            .order((
                training_metadata::created_at.desc(),
                training_metadata::id.desc(),
            ))
            .load::<TrainingMetadataRow>(&mut conn)
            .await?;

        rows.into_iter().map(TrainingMetadata::try_from).collect()
    }

    async fn delete_training_metadata(
        &self,
        dataset_id: &str,
        workspace_name: Option<&str>,
    ) -> PersistenceResult<usize> {
        let _running = self.begin().await;
        let mut conn = self.pool.get().await?;
        let removed = match workspace_name {
            Some(workspace_name) => {
                diesel::delete(
                    training_metadata::table
                        .filter(training_metadata::dataset_id.eq(dataset_id))
                        .filter(training_metadata::workspace_name.eq(workspace_name)),
                )
                .execute(&mut conn)
                .await?
            }
            None => {
                diesel::delete(
                    training_metadata::table.filter(training_metadata::dataset_id.eq(dataset_id)),
                )
                .execute(&mut conn)
                .await?
            }
        };

        info!(
            "Deleted {} training records for dataset {}",
            removed, dataset_id
        );
        Ok(removed)
    }

    async fn mark_best_model(&self, dataset_id: &str, metadata_id: &str) -> PersistenceResult<()> {
        let _running = self.begin().await;
        let cleared = retry_on_conflict("mark_best_model", move || {
            self.write_best(dataset_id, metadata_id)
        })
        .await?;

        info!(
            "Marked {} as best model for dataset {} ({} cleared)",
            metadata_id, dataset_id, cleared
        );
        Ok(())
    }

    async fn save_workspace_state(&self, state: &WorkspaceState) -> PersistenceResult<String> {
        let _running = self.begin().await;
        state.validate()?;
        let encoded = WorkspacePayload::from_state(state).encode()?;
        let encoded_len = encoded.len();
        let payload = self.store_content(encoded).await?;
        let storage_type = payload.storage_type();

        let now = timestamp_now();
        let (storage_column, inline_data, offload_ref) = payload.clone().into_columns();
        let row = WorkspaceStateRow {
            id: if state.id.is_empty() {
                new_workspace_id()
            } else {
                state.id.clone()
            },
            workspace_name: state.workspace_name.clone(),
            dataset_id: state.dataset_id.clone(),
            storage_type: storage_column.to_string(),
            offload_ref,
            inline_data,
            created_at: now,
            updated_at: now,
        };

        match retry_on_conflict("save_workspace_state", move || {
            self.write_workspace(row.clone())
        })
        .await
        {
            Ok(id) => {
                info!(
                    "Saved workspace '{}' for dataset {} ({} bytes, {})",
                    state.workspace_name, state.dataset_id, encoded_len, storage_type
                );
                Ok(id)
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
        let _running = self.begin().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let row = {
                let mut conn = self.pool.get().await?;
                workspace_states::table
                    .filter(workspace_states::workspace_name.eq(workspace_name))
                    .filter(workspace_states::dataset_id.eq(dataset_id))
                    .select(WorkspaceStateRow::as_select())
                    .first::<WorkspaceStateRow>(&mut conn)
                    .await
                    .optional()?
            };
            let Some(row) = row else {
                return Ok(None);
            };

            let (mut state, payload) = row.into_state()?;
            match load_payload(&self.blobs, &payload).await {
                Ok(bytes) => {
                    WorkspacePayload::decode(&bytes)?.apply_to(&mut state);
                    return Ok(Some(state));
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
        let _running = self.begin().await;
        let mut conn = self.pool.get().await?;
        let rows = workspace_states::table
            .filter(workspace_states::dataset_id.eq(dataset_id))
            .select(WorkspaceSummaryRow::as_select())
            .order((
                workspace_states::updated_at.desc(),
                workspace_states::id.desc(),
            ))
            .load::<WorkspaceSummaryRow>(&mut conn)
            .await?;

        rows.into_iter().map(WorkspaceSummary::try_from).collect()
    }

    async fn delete_workspace_state(&self, id: &str) -> PersistenceResult<bool> {
        let _running = self.begin().await;
        let mut conn = self.pool.get().await?;
        let removed = conn
            .transaction::<_, PersistenceError, _>(|conn| {
                Box::pin(async move {
                    let existing = workspace_states::table
                        .find(id)
                        .select(workspace_states::offload_ref)
                        .for_update()
                        .first::<Option<String>>(conn)
                        .await
                        .optional()?;
                    let Some(offload_ref) = existing else {
                        return Ok(false);
                    };

                    diesel::delete(workspace_states::table.find(id))
                        .execute(conn)
                        .await?;
                    if let Some(offload_ref) = offload_ref {
                        delete_blob(conn, &BlobRef::from(offload_ref)).await?;
                    }
                    Ok(true)
                })
            })
            .await?;

        if removed {
            info!("Deleted workspace state {}", id);
        }
        Ok(removed)
    }

    async fn collect_garbage(&self, grace: Duration) -> PersistenceResult<usize> {
        let _running = self.begin().await;
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| PersistenceError::validation(format!("Invalid grace period: {}", e)))?;
        let cutoff = Utc::now() - grace;

        let referenced: HashSet<BlobRef> = {
            let mut conn = self.pool.get().await?;
            let dataset_refs = datasets::table
                .filter(datasets::offload_ref.is_not_null())
                .select(datasets::offload_ref)
                .load::<Option<String>>(&mut conn)
                .await?;
            let workspace_refs = workspace_states::table
                .filter(workspace_states::offload_ref.is_not_null())
                .select(workspace_states::offload_ref)
                .load::<Option<String>>(&mut conn)
                .await?;

            dataset_refs
                .into_iter()
                .chain(workspace_refs)
                .flatten()
                .map(BlobRef::from)
                .collect()
        };

        let removed = collect_orphans(&self.blobs, &referenced, cutoff).await?;
        info!(
            "Garbage collection removed {} orphaned blobs ({} referenced)",
            removed,
            referenced.len()
        );
        Ok(removed)
    }

    async fn close(&self) {
        let _drained = self.running.write().await;
        self.pool.close();
        info!("Closed relational adapter connection pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_script_creates_every_table() {
        for table in [
            "datasets",
            "training_metadata",
            "workspace_states",
            "blobs",
            "blob_chunks",
        ] {
            assert!(
                SCHEMA_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {} ", table)),
                "missing table {}",
                table
            );
        }
    }

    #[test]
    fn schema_enforces_single_payload_location() {
        assert!(SCHEMA_SQL.contains("datasets_single_payload"));
        assert!(SCHEMA_SQL.contains("workspace_states_single_payload"));
        assert!(SCHEMA_SQL.contains("idx_training_single_best"));
    }

    #[test]
    fn dataset_column_list_reads_the_columns_column() {
        let query = datasets::table.select(DatasetSummaryRow::as_select());
        let sql = diesel::debug_query::<diesel::pg::Pg, _>(&query).to_string();
        assert!(sql.contains(r#""datasets"."columns""#), "{}", sql);
        assert!(!sql.contains("column_names"), "{}", sql);
    }

    #[tokio::test]
    async fn close_waits_for_running_calls() {
        let manager =
            AsyncDieselConnectionManager::<AsyncPgConnection>::new("postgres://localhost/unused");
        let pool = Pool::builder(manager).build().unwrap();
        let adapter = RelationalAdapter::from_pool(pool.clone(), AdapterSettings::default());

        // Given: a call in progress
        let running = adapter.begin().await;

        // When: the adapter is closed
        let closing = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.close().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Then: the pool stays open until the call finishes
        assert!(!closing.is_finished());
        assert!(!pool.is_closed());

        drop(running);
        closing.await.unwrap();
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn conflicts_are_retried_a_bounded_number_of_times() {
        let mut calls = 0;
        let result: PersistenceResult<()> = retry_on_conflict("test", || {
            calls += 1;
            async { Err(PersistenceError::conflict("duplicate key")) }
        })
        .await;

        assert!(matches!(result, Err(PersistenceError::Conflict { .. })));
        assert_eq!(calls, MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result: PersistenceResult<()> = retry_on_conflict("test", || {
            calls += 1;
            async { Err(PersistenceError::validation("bad input")) }
        })
        .await;

        assert!(matches!(result, Err(PersistenceError::Validation { .. })));
        assert_eq!(calls, 1);
    }
}
