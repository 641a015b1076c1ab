pub mod adapter;
pub mod batch;
pub mod blob_store;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod database;
pub mod deadline;
pub mod document;
pub mod engine;
pub mod error;
pub mod models;
pub mod relational_blobs;
pub mod schema;
pub mod selector;
pub mod storage;
pub mod store_client;

pub use adapter::{BackendKind, StorageAdapter};
pub use batch::{BatchExecutor, BatchFailure, BatchSummary};
pub use catalog::{
    Dataset, DatasetSummary, ModelType, StorageType, TrainingMetadata, WorkspaceState,
    WorkspaceSummary,
};
pub use config::{AdapterSettings, BackendConfig, PersistenceConfig, RetrySettings};
pub use engine::PersistenceEngine;
pub use error::{PersistenceError, PersistenceResult};
pub use selector::AdapterSelector;
