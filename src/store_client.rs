use object_store::{
    aws::AmazonS3Builder, gcp::GoogleCloudStorageBuilder, local::LocalFileSystem,
    memory::InMemory, path::Path as ObjectPath, prefix::PrefixStore, ObjectStore,
};
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::error::PersistenceError;

pub fn create_gcs_client(bucket_name: &str) -> Result<Arc<dyn ObjectStore>, PersistenceError> {
    let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket_name);

    if let Ok(service_account_path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
        builder = builder.with_service_account_path(service_account_path);
    }

    let store = builder.build().map_err(|e| {
        PersistenceError::config(format!(
            "Failed to create GCS client for bucket '{}': {}",
            bucket_name, e
        ))
    })?;

    Ok(Arc::new(store))
}

pub fn create_s3_client(bucket_name: &str) -> Result<Arc<dyn ObjectStore>, PersistenceError> {
    let store = AmazonS3Builder::from_env()
        .with_bucket_name(bucket_name)
        .build()
        .map_err(|e| {
            PersistenceError::config(format!(
                "Failed to create S3 client for bucket '{}': {}",
                bucket_name, e
            ))
        })?;

    Ok(Arc::new(store))
}

/// Builds the object store behind the document backend from its URL. A path
/// after the bucket scopes every document and blob under that prefix.
pub fn create_object_store(location: &str) -> Result<Arc<dyn ObjectStore>, PersistenceError> {
    let url = Url::parse(location).map_err(|e| {
        PersistenceError::config(format!("Invalid object store URL '{}': {}", location, e))
    })?;

    let store: Arc<dyn ObjectStore> = match url.scheme() {
        "memory" => {
            info!("Using in-memory object store");
            Arc::new(InMemory::new())
        }
        "file" => {
            let root = url.to_file_path().map_err(|_| {
                PersistenceError::config(format!("Invalid file URL: {}", location))
            })?;
            std::fs::create_dir_all(&root)?;
            info!("Using local object store at {}", root.display());
            let local = LocalFileSystem::new_with_prefix(&root).map_err(|e| {
                PersistenceError::config(format!(
                    "Failed to open local store at {}: {}",
                    root.display(),
                    e
                ))
            })?;
            return Ok(Arc::new(local));
        }
        "gs" | "s3" => {
            let bucket = url.host_str().ok_or_else(|| {
                PersistenceError::config(format!("Object store URL is missing a bucket: {}", location))
            })?;
            info!("Using {} bucket {}", url.scheme(), bucket);
            if url.scheme() == "gs" {
                create_gcs_client(bucket)?
            } else {
                create_s3_client(bucket)?
            }
        }
        scheme => {
            return Err(PersistenceError::config(format!(
                "Unsupported storage scheme: {}",
                scheme
            )));
        }
    };

    let prefix = url.path().trim_matches('/');
    if prefix.is_empty() {
        Ok(store)
    } else {
        Ok(Arc::new(PrefixStore::new(store, ObjectPath::from(prefix))))
    }
}
