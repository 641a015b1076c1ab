use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{PersistenceError, PersistenceResult};

/// Upper bound on the rows kept in `Dataset::data_preview`.
pub const MAX_PREVIEW_ROWS: usize = 1000;

/// Current time at the millisecond precision both backends can round-trip.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub fn new_dataset_id() -> String {
    format!("ds_{}", Uuid::new_v4().simple())
}

pub fn new_training_id() -> String {
    format!("tm_{}", Uuid::new_v4().simple())
}

pub fn new_workspace_id() -> String {
    format!("ws_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageType {
    #[serde(rename = "inline")]
    Inline,
    #[serde(rename = "offloaded")]
    Offloaded,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Inline => "inline",
            StorageType::Offloaded => "offloaded",
        }
    }

    pub fn parse(value: &str) -> PersistenceResult<Self> {
        match value {
            "inline" => Ok(StorageType::Inline),
            "offloaded" => Ok(StorageType::Offloaded),
            other => Err(PersistenceError::corrupt(format!(
                "Unknown storage type: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModelType {
    #[serde(rename = "regression")]
    Regression,
    #[serde(rename = "classification")]
    Classification,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Regression => "regression",
            ModelType::Classification => "classification",
        }
    }

    pub fn parse(value: &str) -> PersistenceResult<Self> {
        match value {
            "regression" => Ok(ModelType::Regression),
            "classification" => Ok(ModelType::Classification),
            other => Err(PersistenceError::validation(format!(
                "Unknown model type: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named tabular source with its content. `storage_type` is ignored on save.
#[derive(Clone, PartialEq)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub row_count: i64,
    pub column_count: i64,
    pub columns: Vec<String>,
    pub dtypes: HashMap<String, String>,
    pub data_preview: Vec<serde_json::Value>,
    pub storage_type: StorageType,
    pub data: Bytes,
    pub source_type: String,
    pub source_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let now = timestamp_now();
        Self {
            id: String::new(),
            name: name.into(),
            row_count: 0,
            column_count: 0,
            columns: Vec::new(),
            dtypes: HashMap::new(),
            data_preview: Vec::new(),
            storage_type: StorageType::Inline,
            data: data.into(),
            source_type: "upload".to_string(),
            source_config: serde_json::Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_columns(mut self, columns: Vec<(String, String)>) -> Self {
        self.column_count = columns.len() as i64;
        self.dtypes = columns.iter().cloned().collect();
        self.columns = columns.into_iter().map(|(name, _)| name).collect();
        self
    }

    pub fn with_rows(mut self, row_count: i64, preview: Vec<serde_json::Value>) -> Self {
        self.row_count = row_count;
        self.data_preview = preview;
        self
    }

    pub fn with_source(mut self, source_type: impl Into<String>, config: serde_json::Value) -> Self {
        self.source_type = source_type.into();
        self.source_config = config;
        self
    }

    pub fn validate(&self) -> PersistenceResult<()> {
        if self.name.trim().is_empty() {
            return Err(PersistenceError::validation("Dataset name must not be empty"));
        }
        if self.row_count < 0 {
            return Err(PersistenceError::validation(format!(
                "Dataset row_count must not be negative, got {}",
                self.row_count
            )));
        }
        if self.column_count < 0 {
            return Err(PersistenceError::validation(format!(
                "Dataset column_count must not be negative, got {}",
                self.column_count
            )));
        }
        if !self.columns.is_empty() && self.columns.len() as i64 != self.column_count {
            return Err(PersistenceError::validation(format!(
                "Dataset declares {} columns but lists {}",
                self.column_count,
                self.columns.len()
            )));
        }
        if self.data_preview.len() > MAX_PREVIEW_ROWS {
            return Err(PersistenceError::validation(format!(
                "Dataset preview holds {} rows, at most {} allowed",
                self.data_preview.len(),
                MAX_PREVIEW_ROWS
            )));
        }
        if let Some(unknown) = self.dtypes.keys().find(|c| !self.columns.contains(c)) {
            return Err(PersistenceError::validation(format!(
                "Dataset dtype declared for unknown column '{}'",
                unknown
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            row_count: self.row_count,
            column_count: self.column_count,
            columns: self.columns.clone(),
            storage_type: self.storage_type,
            source_type: self.source_type.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("row_count", &self.row_count)
            .field("column_count", &self.column_count)
            .field("columns", &self.columns)
            .field("storage_type", &self.storage_type)
            .field("data_len", &self.data.len())
            .field("preview_rows", &self.data_preview.len())
            .field("source_type", &self.source_type)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Listing view of a dataset; never carries the content bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetSummary {
    pub id: String,
    pub name: String,
    pub row_count: i64,
    pub column_count: i64,
    pub columns: Vec<String>,
    pub storage_type: StorageType,
    pub source_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One completed model-training run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingMetadata {
    pub id: String,
    pub dataset_id: String,
    pub workspace_name: Option<String>,
    pub model_name: String,
    pub model_type: ModelType,
    pub target_variable: String,
    pub features: Vec<String>,
    pub metrics: HashMap<String, f64>,
    pub hyperparameters: serde_json::Value,
    pub feature_importance: serde_json::Value,
    pub training_time: f64,
    pub is_best: bool,
    pub created_at: DateTime<Utc>,
}

impl TrainingMetadata {
    pub fn new(
        dataset_id: impl Into<String>,
        model_name: impl Into<String>,
        model_type: ModelType,
        target_variable: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            dataset_id: dataset_id.into(),
            workspace_name: None,
            model_name: model_name.into(),
            model_type,
            target_variable: target_variable.into(),
            features: Vec::new(),
            metrics: HashMap::new(),
            hyperparameters: serde_json::Value::Object(Default::default()),
            feature_importance: serde_json::Value::Object(Default::default()),
            training_time: 0.0,
            is_best: false,
            created_at: timestamp_now(),
        }
    }

    pub fn in_workspace(mut self, workspace_name: impl Into<String>) -> Self {
        self.workspace_name = Some(workspace_name.into());
        self
    }

    pub fn validate(&self) -> PersistenceResult<()> {
        if self.dataset_id.trim().is_empty() {
            return Err(PersistenceError::validation(
                "Training metadata must reference a dataset",
            ));
        }
        if self.model_name.trim().is_empty() {
            return Err(PersistenceError::validation("Model name must not be empty"));
        }
        if self.target_variable.trim().is_empty() {
            return Err(PersistenceError::validation(
                "Target variable must not be empty",
            ));
        }
        if matches!(&self.workspace_name, Some(name) if name.trim().is_empty()) {
            return Err(PersistenceError::validation(
                "Workspace name must be absent or non-empty",
            ));
        }
        if !self.training_time.is_finite() || self.training_time < 0.0 {
            return Err(PersistenceError::validation(format!(
                "Training time must be a non-negative number, got {}",
                self.training_time
            )));
        }
        if let Some((name, _)) = self.metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(PersistenceError::validation(format!(
                "Metric '{}' is not a finite number",
                name
            )));
        }
        Ok(())
    }

    /// Whether `other` competes with this record for the `is_best` flag.
    pub fn same_group(&self, other: &TrainingMetadata) -> bool {
        self.dataset_id == other.dataset_id && self.workspace_name == other.workspace_name
    }
}

/// A named snapshot of cached analysis artifacts for one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceState {
    pub id: String,
    pub workspace_name: String,
    pub dataset_id: String,
    pub predictive_analysis: Option<serde_json::Value>,
    pub visualization: Option<serde_json::Value>,
    pub variable_selection: Option<serde_json::Value>,
    pub storage_type: StorageType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceState {
    pub fn new(workspace_name: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        let now = timestamp_now();
        Self {
            id: String::new(),
            workspace_name: workspace_name.into(),
            dataset_id: dataset_id.into(),
            predictive_analysis: None,
            visualization: None,
            variable_selection: None,
            storage_type: StorageType::Inline,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> PersistenceResult<()> {
        if self.workspace_name.trim().is_empty() {
            return Err(PersistenceError::validation(
                "Workspace name must not be empty",
            ));
        }
        if self.dataset_id.trim().is_empty() {
            return Err(PersistenceError::validation(
                "Workspace state must reference a dataset",
            ));
        }
        Ok(())
    }

    pub fn summary(&self) -> WorkspaceSummary {
        WorkspaceSummary {
            id: self.id.clone(),
            workspace_name: self.workspace_name.clone(),
            dataset_id: self.dataset_id.clone(),
            storage_type: self.storage_type,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSummary {
    pub id: String,
    pub workspace_name: String,
    pub dataset_id: String,
    pub storage_type: StorageType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
