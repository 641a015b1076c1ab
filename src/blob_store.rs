use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PersistenceError, PersistenceResult};

pub type ByteStream = BoxStream<'static, PersistenceResult<Bytes>>;

/// Opaque handle to a blob in a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn generate() -> Self {
        Self(format!("blob_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for BlobRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for BlobRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobInfo {
    pub blob_ref: BlobRef,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Streaming large-object storage. A blob is readable only once `put` returns.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    async fn put(&self, chunks: ByteStream) -> PersistenceResult<BlobRef>;

    /// Fails with `NotFound` when the reference is unknown or incomplete.
    async fn get(&self, blob_ref: &BlobRef) -> PersistenceResult<ByteStream>;

    /// Returns false if there was nothing to delete.
    async fn delete(&self, blob_ref: &BlobRef) -> PersistenceResult<bool>;

    async fn list(&self) -> PersistenceResult<Vec<BlobInfo>>;
}

/// Splits an in-memory payload into `part_size` slices without copying.
pub fn chunked(payload: Bytes, part_size: usize) -> ByteStream {
    let part_size = part_size.max(1);
    let mut parts = Vec::with_capacity(payload.len() / part_size + 1);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + part_size).min(payload.len());
        parts.push(Ok(payload.slice(offset..end)));
        offset = end;
    }
    stream::iter(parts).boxed()
}

pub async fn put_bytes(
    store: &dyn BlobStore,
    payload: Bytes,
    part_size: usize,
) -> PersistenceResult<BlobRef> {
    store.put(chunked(payload, part_size)).await
}

pub async fn get_bytes(store: &dyn BlobStore, blob_ref: &BlobRef) -> PersistenceResult<Bytes> {
    let stream = store.get(blob_ref).await?;
    collect_stream(stream).await
}

pub async fn collect_stream(stream: ByteStream) -> PersistenceResult<Bytes> {
    let buffer = stream
        .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
            buffer.extend_from_slice(&chunk);
            Ok(buffer)
        })
        .await?;
    Ok(buffer.freeze())
}

/// Resolves an offloaded payload, reporting a missing blob as corruption.
pub async fn read_offloaded(
    store: &dyn BlobStore,
    blob_ref: &BlobRef,
) -> PersistenceResult<Bytes> {
    match get_bytes(store, blob_ref).await {
        Err(PersistenceError::NotFound { .. }) => Err(PersistenceError::corrupt(format!(
            "Offloaded blob {} is missing",
            blob_ref
        ))),
        other => other,
    }
}

/// Deletes a blob that is no longer referenced. Failures are only logged.
pub async fn release(store: &dyn BlobStore, blob_ref: Option<&BlobRef>) {
    if let Some(blob_ref) = blob_ref {
        if let Err(e) = store.delete(blob_ref).await {
            warn!("Failed to release blob {}: {}", blob_ref, e);
        }
    }
}

/// Deletes every blob created before `cutoff` that is not in `referenced`.
pub async fn collect_orphans(
    store: &dyn BlobStore,
    referenced: &HashSet<BlobRef>,
    cutoff: DateTime<Utc>,
) -> PersistenceResult<usize> {
    let mut removed = 0;
    for blob in store.list().await? {
        if blob.created_at >= cutoff || referenced.contains(&blob.blob_ref) {
            continue;
        }
        if store.delete(&blob.blob_ref).await? {
            info!(
                "Collected orphaned blob {} ({} bytes)",
                blob.blob_ref, blob.size_bytes
            );
            removed += 1;
        }
    }
    Ok(removed)
}
