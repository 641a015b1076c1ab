use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::blob_store::{BlobInfo, BlobRef, BlobStore, ByteStream};
use crate::catalog::timestamp_now;
use crate::error::{PersistenceError, PersistenceResult};
use crate::models::{BlobRow, NewBlobChunk};
use crate::schema::{blob_chunks, blobs};

/// Blob store over two side tables: a `blobs` header row per blob and one
/// `blob_chunks` BYTEA row per part. The header stays `complete = false` until
/// every chunk is written, so readers never see a partial blob.
#[derive(Clone)]
pub struct RelationalBlobStore {
    pool: Pool<AsyncPgConnection>,
    chunk_size: usize,
}

impl std::fmt::Debug for RelationalBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalBlobStore")
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl RelationalBlobStore {
    pub fn new(pool: Pool<AsyncPgConnection>, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
        }
    }

    async fn write_chunk(
        &self,
        blob_ref: &BlobRef,
        seq: i32,
        data: &[u8],
    ) -> PersistenceResult<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(blob_chunks::table)
            .values(&NewBlobChunk {
                blob_ref: blob_ref.as_str(),
                seq,
                data,
            })
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn write_all(
        &self,
        blob_ref: &BlobRef,
        mut chunks: ByteStream,
    ) -> PersistenceResult<(i64, i32)> {
        let mut total_bytes = 0i64;
        let mut seq = 0i32;
        let mut buffer = BytesMut::new();

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);
            total_bytes += chunk.len() as i64;

            while buffer.len() >= self.chunk_size {
                let part = buffer.split_to(self.chunk_size).freeze();
                self.write_chunk(blob_ref, seq, &part).await?;
                seq += 1;
            }
        }

        if !buffer.is_empty() {
            self.write_chunk(blob_ref, seq, &buffer).await?;
            seq += 1;
        }

        Ok((total_bytes, seq))
    }

    async fn discard(&self, blob_ref: &BlobRef) {
        match self.pool.get().await {
            Ok(mut conn) => {
                if let Err(e) = delete_blob(&mut conn, blob_ref).await {
                    warn!("Failed to discard partial blob {}: {}", blob_ref, e);
                }
            }
            Err(e) => warn!("Failed to discard partial blob {}: {}", blob_ref, e),
        }
    }
}

/// Deletes a blob header and its chunks on an existing connection, so callers
/// can release blobs inside their own transaction.
pub async fn delete_blob(
    conn: &mut AsyncPgConnection,
    blob_ref: &BlobRef,
) -> PersistenceResult<bool> {
    diesel::delete(blob_chunks::table.filter(blob_chunks::blob_ref.eq(blob_ref.as_str())))
        .execute(conn)
        .await?;
    let removed = diesel::delete(blobs::table.find(blob_ref.as_str()))
        .execute(conn)
        .await?;
    Ok(removed > 0)
}

#[async_trait]
impl BlobStore for RelationalBlobStore {
    async fn put(&self, chunks: ByteStream) -> PersistenceResult<BlobRef> {
        let blob_ref = BlobRef::generate();

        {
            let mut conn = self.pool.get().await?;
            diesel::insert_into(blobs::table)
                .values(&BlobRow {
                    blob_ref: blob_ref.as_str().to_string(),
                    size_bytes: 0,
                    chunk_count: 0,
                    complete: false,
                    created_at: timestamp_now(),
                })
                .execute(&mut conn)
                .await?;
        }

        let (total_bytes, chunk_count) = match self.write_all(&blob_ref, chunks).await {
            Ok(written) => written,
            Err(e) => {
                self.discard(&blob_ref).await;
                return Err(e);
            }
        };

        let mut conn = self.pool.get().await?;
        diesel::update(blobs::table.find(blob_ref.as_str()))
            .set((
                blobs::size_bytes.eq(total_bytes),
                blobs::chunk_count.eq(chunk_count),
                blobs::complete.eq(true),
            ))
            .execute(&mut conn)
            .await?;

        info!(
            "Stored blob {} ({} bytes in {} chunks)",
            blob_ref, total_bytes, chunk_count
        );
        Ok(blob_ref)
    }

    async fn get(&self, blob_ref: &BlobRef) -> PersistenceResult<ByteStream> {
        let header = {
            let mut conn = self.pool.get().await?;
            blobs::table
                .find(blob_ref.as_str())
                .filter(blobs::complete.eq(true))
                .select(BlobRow::as_select())
                .first::<BlobRow>(&mut conn)
                .await
                .optional()?
        };

        let header = header.ok_or_else(|| PersistenceError::not_found("blob", blob_ref.as_str()))?;
        debug!(
            "Streaming blob {} ({} bytes in {} chunks)",
            header.blob_ref, header.size_bytes, header.chunk_count
        );

        let (tx, rx) = mpsc::channel(2);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            for seq in 0..header.chunk_count {
                let chunk = read_chunk(&pool, &header.blob_ref, seq).await;
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn delete(&self, blob_ref: &BlobRef) -> PersistenceResult<bool> {
        let mut conn = self.pool.get().await?;
        delete_blob(&mut conn, blob_ref).await
    }

    async fn list(&self) -> PersistenceResult<Vec<BlobInfo>> {
        let mut conn = self.pool.get().await?;
        let rows = blobs::table
            .select(BlobRow::as_select())
            .load::<BlobRow>(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| BlobInfo {
                blob_ref: BlobRef::from(row.blob_ref),
                size_bytes: row.size_bytes.max(0) as u64,
                created_at: row.created_at,
            })
            .collect())
    }
}

async fn read_chunk(
    pool: &Pool<AsyncPgConnection>,
    blob_ref: &str,
    seq: i32,
) -> PersistenceResult<Bytes> {
    let mut conn = pool.get().await?;
    let data = blob_chunks::table
        .filter(blob_chunks::blob_ref.eq(blob_ref))
        .filter(blob_chunks::seq.eq(seq))
        .select(blob_chunks::data)
        .first::<Vec<u8>>(&mut conn)
        .await
        .optional()?;

    data.map(Bytes::from).ok_or_else(|| {
        PersistenceError::corrupt(format!("Blob {} is missing chunk {}", blob_ref, seq))
    })
}
