use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::collections::HashMap;

use crate::catalog::{
    Dataset, DatasetSummary, ModelType, StorageType, TrainingMetadata, WorkspaceState,
    WorkspaceSummary,
};
use crate::codec::PayloadSlot;
use crate::error::PersistenceResult;
use crate::schema::{blob_chunks, blobs, datasets, training_metadata, workspace_states};

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = datasets)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(treat_none_as_null = true)]
pub struct DatasetRow {
    pub id: String,
    pub name: String,
    pub row_count: i64,
    pub column_count: i64,
    #[diesel(column_name = column_names)]
    pub columns: serde_json::Value,
    pub dtypes: serde_json::Value,
    pub data_preview: serde_json::Value,
    pub storage_type: String,
    pub offload_ref: Option<String>,
    pub inline_data: Option<Vec<u8>>,
    pub source_type: String,
    pub source_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = datasets)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DatasetSummaryRow {
    pub id: String,
    pub name: String,
    pub row_count: i64,
    pub column_count: i64,
    #[diesel(column_name = column_names)]
    pub columns: serde_json::Value,
    pub storage_type: String,
    pub source_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = training_metadata)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(treat_none_as_null = true)]
pub struct TrainingMetadataRow {
    pub id: String,
    pub dataset_id: String,
    pub workspace_name: Option<String>,
    pub model_name: String,
    pub model_type: String,
    pub target_variable: String,
    pub features: serde_json::Value,
    pub metrics: serde_json::Value,
    pub hyperparameters: serde_json::Value,
    pub feature_importance: serde_json::Value,
    pub training_time: f64,
    pub is_best: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = workspace_states)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(treat_none_as_null = true)]
pub struct WorkspaceStateRow {
    pub id: String,
    pub workspace_name: String,
    pub dataset_id: String,
    pub storage_type: String,
    pub offload_ref: Option<String>,
    pub inline_data: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = workspace_states)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct WorkspaceSummaryRow {
    pub id: String,
    pub workspace_name: String,
    pub dataset_id: String,
    pub storage_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = blobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BlobRow {
    pub blob_ref: String,
    pub size_bytes: i64,
    pub chunk_count: i32,
    pub complete: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = blob_chunks)]
pub struct NewBlobChunk<'a> {
    pub blob_ref: &'a str,
    pub seq: i32,
    pub data: &'a [u8],
}

impl DatasetRow {
    /// Builds the row for `dataset`, whose content lives in `slot`.
    pub fn from_dataset(dataset: &Dataset, slot: PayloadSlot) -> PersistenceResult<Self> {
        let (storage_type, inline_data, offload_ref) = slot.into_columns();
        Ok(Self {
            id: dataset.id.clone(),
            name: dataset.name.clone(),
            row_count: dataset.row_count,
            column_count: dataset.column_count,
            columns: serde_json::to_value(&dataset.columns)?,
            dtypes: serde_json::to_value(&dataset.dtypes)?,
            data_preview: serde_json::Value::Array(dataset.data_preview.clone()),
            storage_type: storage_type.to_string(),
            offload_ref,
            inline_data,
            source_type: dataset.source_type.clone(),
            source_config: dataset.source_config.clone(),
            created_at: dataset.created_at,
            updated_at: dataset.updated_at,
        })
    }

    /// Splits the row into the dataset (content still empty) and its slot.
    pub fn into_dataset(self) -> PersistenceResult<(Dataset, PayloadSlot)> {
        let slot = PayloadSlot::from_columns(&self.storage_type, self.inline_data, self.offload_ref)?;
        let columns: Vec<String> = serde_json::from_value(self.columns)?;
        let dtypes: HashMap<String, String> = serde_json::from_value(self.dtypes)?;
        let data_preview = match self.data_preview {
            serde_json::Value::Array(rows) => rows,
            other => vec![other],
        };

        let dataset = Dataset {
            id: self.id,
            name: self.name,
            row_count: self.row_count,
            column_count: self.column_count,
            columns,
            dtypes,
            data_preview,
            storage_type: slot.storage_type(),
            data: bytes::Bytes::new(),
            source_type: self.source_type,
            source_config: self.source_config,
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        Ok((dataset, slot))
    }
}

impl TryFrom<DatasetSummaryRow> for DatasetSummary {
    type Error = crate::error::PersistenceError;

    fn try_from(row: DatasetSummaryRow) -> Result<Self, Self::Error> {
        Ok(DatasetSummary {
            id: row.id,
            name: row.name,
            row_count: row.row_count,
            column_count: row.column_count,
            columns: serde_json::from_value(row.columns)?,
            storage_type: StorageType::parse(&row.storage_type)?,
            source_type: row.source_type,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TrainingMetadataRow {
    pub fn from_metadata(metadata: &TrainingMetadata) -> PersistenceResult<Self> {
        Ok(Self {
            id: metadata.id.clone(),
            dataset_id: metadata.dataset_id.clone(),
            workspace_name: metadata.workspace_name.clone(),
            model_name: metadata.model_name.clone(),
            model_type: metadata.model_type.as_str().to_string(),
            target_variable: metadata.target_variable.clone(),
            features: serde_json::to_value(&metadata.features)?,
            metrics: serde_json::to_value(&metadata.metrics)?,
            hyperparameters: metadata.hyperparameters.clone(),
            feature_importance: metadata.feature_importance.clone(),
            training_time: metadata.training_time,
            is_best: metadata.is_best,
            created_at: metadata.created_at,
        })
    }
}

impl TryFrom<TrainingMetadataRow> for TrainingMetadata {
    type Error = crate::error::PersistenceError;

    fn try_from(row: TrainingMetadataRow) -> Result<Self, Self::Error> {
        Ok(TrainingMetadata {
            id: row.id,
            dataset_id: row.dataset_id,
            workspace_name: row.workspace_name,
            model_name: row.model_name,
            model_type: ModelType::parse(&row.model_type)?,
            target_variable: row.target_variable,
            features: serde_json::from_value(row.features)?,
            metrics: serde_json::from_value(row.metrics)?,
            hyperparameters: row.hyperparameters,
            feature_importance: row.feature_importance,
            training_time: row.training_time,
            is_best: row.is_best,
            created_at: row.created_at,
        })
    }
}

impl WorkspaceStateRow {
    /// Splits the row into the state (artifacts still empty) and its slot.
    pub fn into_state(self) -> PersistenceResult<(WorkspaceState, PayloadSlot)> {
        let slot = PayloadSlot::from_columns(&self.storage_type, self.inline_data, self.offload_ref)?;
        let state = WorkspaceState {
            id: self.id,
            workspace_name: self.workspace_name,
            dataset_id: self.dataset_id,
            predictive_analysis: None,
            visualization: None,
            variable_selection: None,
            storage_type: slot.storage_type(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        Ok((state, slot))
    }
}

impl TryFrom<WorkspaceSummaryRow> for WorkspaceSummary {
    type Error = crate::error::PersistenceError;

    fn try_from(row: WorkspaceSummaryRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceSummary {
            id: row.id,
            workspace_name: row.workspace_name,
            dataset_id: row.dataset_id,
            storage_type: StorageType::parse(&row.storage_type)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
