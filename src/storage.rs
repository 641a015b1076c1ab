use async_trait::async_trait;
use bytes::BytesMut;
use futures::{StreamExt, TryStreamExt};
use object_store::{path::Path as ObjectPath, MultipartUpload, ObjectStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::blob_store::{BlobInfo, BlobRef, BlobStore, ByteStream};
use crate::error::{PersistenceError, PersistenceResult};

const BLOB_PREFIX: &str = "blobs";

/// Blob store over an object store: each blob is one object under `blobs/`,
/// written with a multipart upload so it only becomes visible on completion.
#[derive(Debug, Clone)]
pub struct ObjectBlobStore {
    store: Arc<dyn ObjectStore>,
    part_size: usize,
}

impl ObjectBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>, part_size: usize) -> Self {
        Self {
            store,
            part_size: part_size.max(1),
        }
    }

    fn blob_path(blob_ref: &BlobRef) -> ObjectPath {
        ObjectPath::from(BLOB_PREFIX).child(blob_ref.as_str())
    }

    async fn upload_parts(
        &self,
        multipart: &mut Box<dyn MultipartUpload>,
        mut chunks: ByteStream,
    ) -> PersistenceResult<u64> {
        let mut total_bytes = 0u64;
        let mut part_number = 0;
        let mut buffer = BytesMut::new();

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);
            total_bytes += chunk.len() as u64;

            if buffer.len() >= self.part_size {
                debug!(
                    "Uploading buffered part {} ({} bytes, total {} bytes)",
                    part_number,
                    buffer.len(),
                    total_bytes
                );

                multipart
                    .put_part(buffer.split().freeze().into())
                    .await
                    .map_err(|e| {
                        PersistenceError::connection(format!(
                            "Failed to upload part {}: {}",
                            part_number, e
                        ))
                    })?;
                part_number += 1;
            }
        }

        if !buffer.is_empty() {
            debug!(
                "Uploading final buffered part {} ({} bytes)",
                part_number,
                buffer.len()
            );

            multipart
                .put_part(buffer.freeze().into())
                .await
                .map_err(|e| {
                    PersistenceError::connection(format!(
                        "Failed to upload final part {}: {}",
                        part_number, e
                    ))
                })?;
        }

        Ok(total_bytes)
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn put(&self, chunks: ByteStream) -> PersistenceResult<BlobRef> {
        let blob_ref = BlobRef::generate();
        let path = Self::blob_path(&blob_ref);

        let mut multipart = self.store.put_multipart(&path).await.map_err(|e| {
            PersistenceError::connection(format!("Failed to initiate multipart upload: {}", e))
        })?;

        let total_bytes = match self.upload_parts(&mut multipart, chunks).await {
            Ok(total) => total,
            Err(e) => {
                if let Err(abort_err) = multipart.abort().await {
                    warn!("Failed to abort multipart upload {}: {}", path, abort_err);
                }
                return Err(e);
            }
        };

        multipart.complete().await.map_err(|e| {
            PersistenceError::connection(format!("Failed to complete multipart upload: {}", e))
        })?;

        info!("Stored blob {} ({} bytes)", blob_ref, total_bytes);
        Ok(blob_ref)
    }

    async fn get(&self, blob_ref: &BlobRef) -> PersistenceResult<ByteStream> {
        let result = self
            .store
            .get(&Self::blob_path(blob_ref))
            .await
            .map_err(|e| match e {
                object_store::Error::NotFound { .. } => {
                    PersistenceError::not_found("blob", blob_ref.as_str())
                }
                other => PersistenceError::from(other),
            })?;

        Ok(result.into_stream().map_err(PersistenceError::from).boxed())
    }

    async fn delete(&self, blob_ref: &BlobRef) -> PersistenceResult<bool> {
        let path = Self::blob_path(blob_ref);
        match self.store.head(&path).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        match self.store.delete(&path).await {
            Ok(()) => {
                debug!("Deleted blob {}", blob_ref);
                Ok(true)
            }
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> PersistenceResult<Vec<BlobInfo>> {
        let prefix = ObjectPath::from(BLOB_PREFIX);
        let mut stream = self.store.list(Some(&prefix));
        let mut blobs = Vec::new();

        while let Some(meta) = stream.next().await {
            let meta = meta?;
            if let Some(name) = meta.location.filename() {
                blobs.push(BlobInfo {
                    blob_ref: BlobRef::from(name),
                    size_bytes: meta.size as u64,
                    created_at: meta.last_modified,
                });
            }
        }

        Ok(blobs)
    }
}
