//! Downloads and lazy consolidation of parts.
//!
//! The first download of a parts-only location claims the merge and fans
//! every chunk out to two bounded channels: one feeds the response, the
//! other feeds an upload of `{folder}/merged`. Each send waits for room, so
//! the part reader runs at the pace of the slower consumer. A client that
//! goes away only drops its side; the merge keeps going.

use crate::engine::CacheEngine;
use crate::error::{EngineError, EngineResult};
use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use hoard_core::layout::{merged_object, part_object, parts_folder};
use hoard_metadata::{LocationState, MetadataError, MetadataStore, StorageLocationRow};
use hoard_storage::{ByteStream, StorageAdapter, StorageError, StorageResult};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;
use uuid::Uuid;

/// Chunks buffered per fan-out destination.
const FANOUT_CAPACITY: usize = 16;

type ChunkSender = mpsc::Sender<StorageResult<Bytes>>;

impl CacheEngine {
    /// Open the content of a cache entry for reading.
    ///
    /// Returns `None` if the entry does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn download(&self, entry_id: Uuid) -> EngineResult<Option<ByteStream>> {
        let Some(location) = self.metadata.get_location_for_entry(entry_id).await? else {
            return Ok(None);
        };
        let location_id = location.id;
        let stream = self.open_location(location).await?;
        self.metadata
            .record_download(location_id, Self::now())
            .await?;
        Ok(Some(stream))
    }

    async fn open_location(&self, mut location: StorageLocationRow) -> EngineResult<ByteStream> {
        let mut lost_claim = false;
        loop {
            match location.state() {
                LocationState::Inconsistent => {
                    tracing::error!(
                        location_id = %location.id,
                        folder = %location.folder_name,
                        "Parts were deleted before a merge completed"
                    );
                    return Err(EngineError::Inconsistent {
                        location_id: location.id,
                        detail: "parts deleted without a completed merge".to_string(),
                    });
                }
                LocationState::Merged | LocationState::PartsReclaimed => {
                    let stream = self
                        .storage
                        .create_download_stream(&merged_object(&location.folder_name))
                        .await?;
                    return Ok(stream);
                }
                LocationState::MergeInProgress => {
                    return Ok(Box::pin(read_parts(
                        self.storage.clone(),
                        Some(self.metadata.clone()),
                        location,
                    )));
                }
                // Someone else claimed and has already given up; serve the parts.
                LocationState::PartsOnly if lost_claim => {
                    return Ok(Box::pin(read_parts(
                        self.storage.clone(),
                        Some(self.metadata.clone()),
                        location,
                    )));
                }
                LocationState::PartsOnly => {
                    let claimed_at = Self::now();
                    if self.metadata.claim_merge(location.id, claimed_at).await? {
                        return Ok(self.spawn_merge(location, claimed_at));
                    }
                    lost_claim = true;
                    let id = location.id;
                    location = self
                        .metadata
                        .get_location(id)
                        .await?
                        .ok_or_else(|| MetadataError::NotFound(format!("storage location {id}")))?;
                }
            }
        }
    }

    fn spawn_merge(&self, location: StorageLocationRow, claimed_at: OffsetDateTime) -> ByteStream {
        let (response_tx, response_rx) = mpsc::channel(FANOUT_CAPACITY);
        let span = tracing::info_span!(
            "merge",
            location_id = %location.id,
            folder = %location.folder_name
        );
        tokio::spawn(
            self.clone()
                .run_merge(location, claimed_at, response_tx)
                .instrument(span),
        );
        Box::pin(ReceiverStream::new(response_rx))
    }

    /// Every state change after the upload is conditional on `claimed_at`
    /// still being the location's claim. A claim cleared by the stalled-merge
    /// reset may already belong to another merge.
    async fn run_merge(
        self,
        location: StorageLocationRow,
        claimed_at: OffsetDateTime,
        response_tx: ChunkSender,
    ) {
        let (merge_tx, merge_rx) = mpsc::channel(FANOUT_CAPACITY);
        let merged = merged_object(&location.folder_name);
        let parts: ByteStream = Box::pin(read_parts(self.storage.clone(), None, location.clone()));

        let (uploaded, pumped) = tokio::join!(
            self.storage
                .upload_stream(&merged, Box::pin(ReceiverStream::new(merge_rx))),
            fan_out(parts, merge_tx, response_tx),
        );

        match (uploaded, pumped) {
            (Ok(()), Ok(bytes)) => {
                match self
                    .metadata
                    .complete_merge(location.id, claimed_at, Self::now())
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("Merge claim was taken over, leaving parts in place");
                        return;
                    }
                    Err(e) => {
                        // Stalled-merge reset picks this up later.
                        tracing::error!(error = %e, "Failed to record completed merge");
                        return;
                    }
                }
                tracing::info!(bytes, parts = location.part_count, "Merge completed");
                if let Err(e) = self.reclaim_parts(&location).await {
                    tracing::warn!(error = %e, "Failed to reclaim parts after merge");
                }
            }
            (uploaded, pumped) => {
                tracing::warn!(
                    upload_error = ?uploaded.err().map(|e| e.to_string()),
                    read_error = ?pumped.err().map(|e| e.to_string()),
                    "Merge failed, reverting location to parts-only"
                );
                match self.metadata.reset_merge(location.id, claimed_at).await {
                    Ok(true) => {}
                    Ok(false) => tracing::debug!("Merge claim already released"),
                    Err(e) => tracing::error!(error = %e, "Failed to reset merge state"),
                }
            }
        }
    }

    /// Delete the parts of a merged location, then mark them deleted.
    pub(crate) async fn reclaim_parts(&self, location: &StorageLocationRow) -> EngineResult<()> {
        self.storage
            .delete_folder(&parts_folder(&location.folder_name))
            .await?;
        self.metadata
            .mark_parts_deleted(location.id, Self::now())
            .await?;
        Ok(())
    }
}

/// Copy every chunk of `parts` to the merge upload and to the response.
///
/// Returns the number of bytes read. A failed read or a failed merge upload
/// aborts both destinations; a dropped response does not.
async fn fan_out(
    mut parts: ByteStream,
    merge_tx: ChunkSender,
    response_tx: ChunkSender,
) -> StorageResult<u64> {
    let mut response = Some(response_tx);
    let mut total: u64 = 0;

    while let Some(item) = parts.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                let reason = e.to_string();
                let _ = merge_tx.send(Err(StorageError::Aborted(reason.clone()))).await;
                if let Some(tx) = response.take() {
                    let _ = tx.send(Err(e)).await;
                }
                return Err(StorageError::Aborted(reason));
            }
        };
        total += chunk.len() as u64;

        if merge_tx.send(Ok(chunk.clone())).await.is_err() {
            if let Some(tx) = response.take() {
                let _ = tx
                    .send(Err(StorageError::Aborted("merge upload failed".to_string())))
                    .await;
            }
            return Err(StorageError::Aborted(
                "merge upload stopped accepting data".to_string(),
            ));
        }

        let client_gone = match &response {
            Some(tx) => tx.send(Ok(chunk)).await.is_err(),
            None => false,
        };
        if client_gone {
            tracing::debug!(bytes_sent = total, "Client disconnected, merge continues");
            response = None;
        }
    }

    Ok(total)
}

/// Read parts `0..part_count` back to back as one stream.
///
/// With `metadata` set, a part that has disappeared because a concurrent
/// merge finished and reclaimed it is replaced by the merged object, resumed
/// at the same byte offset.
fn read_parts(
    storage: Arc<dyn StorageAdapter>,
    metadata: Option<Arc<dyn MetadataStore>>,
    location: StorageLocationRow,
) -> impl Stream<Item = StorageResult<Bytes>> + Send + 'static {
    try_stream! {
        let part_count = u32::try_from(location.part_count).map_err(|_| {
            StorageError::InvalidKey(format!("invalid part count {}", location.part_count))
        })?;
        let mut offset: u64 = 0;
        let mut fallback: Option<ByteStream> = None;

        for index in 0..part_count {
            let name = part_object(&location.folder_name, index);
            let mut part = match storage.create_download_stream(&name).await {
                Ok(part) => part,
                Err(e) if e.is_not_found() => {
                    match merged_after_reclaim(storage.as_ref(), metadata.as_deref(), location.id)
                        .await?
                    {
                        Some(merged) => {
                            fallback = Some(merged);
                            break;
                        }
                        None => Err::<ByteStream, _>(e)?,
                    }
                }
                Err(e) => Err::<ByteStream, _>(e)?,
            };
            while let Some(chunk) = part.next().await {
                let chunk = chunk?;
                offset += chunk.len() as u64;
                yield chunk;
            }
        }

        if let Some(merged) = fallback {
            tracing::debug!(offset, "Parts reclaimed mid-read, continuing from merged object");
            let mut rest = Box::pin(skip_bytes(merged, offset));
            while let Some(chunk) = rest.next().await {
                yield chunk?;
            }
        }
    }
}

async fn merged_after_reclaim(
    storage: &dyn StorageAdapter,
    metadata: Option<&dyn MetadataStore>,
    location_id: Uuid,
) -> StorageResult<Option<ByteStream>> {
    let Some(metadata) = metadata else {
        return Ok(None);
    };
    let fresh = metadata
        .get_location(location_id)
        .await
        .map_err(|e| StorageError::Backend(Box::new(e)))?;
    match fresh {
        Some(location) if location.merged_at.is_some() => {
            let stream = storage
                .create_download_stream(&merged_object(&location.folder_name))
                .await?;
            Ok(Some(stream))
        }
        _ => Ok(None),
    }
}

/// Drop the first `skip` bytes of `stream`.
fn skip_bytes(
    mut stream: ByteStream,
    mut skip: u64,
) -> impl Stream<Item = StorageResult<Bytes>> + Send + 'static {
    try_stream! {
        while let Some(chunk) = stream.next().await {
            let mut chunk = chunk?;
            if skip > 0 {
                let len = chunk.len() as u64;
                if len <= skip {
                    skip -= len;
                    continue;
                }
                // skip < len, so it fits in usize
                chunk = chunk.slice(skip as usize..);
                skip = 0;
            }
            yield chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        let items: Vec<StorageResult<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        Box::pin(futures::stream::iter(items))
    }

    async fn collect(stream: impl Stream<Item = StorageResult<Bytes>>) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_skip_bytes_across_chunk_boundaries() {
        let source = || chunks(&[b"abc", b"defg", b"hi"]);
        assert_eq!(collect(skip_bytes(source(), 0)).await, b"abcdefghi");
        assert_eq!(collect(skip_bytes(source(), 3)).await, b"defghi");
        assert_eq!(collect(skip_bytes(source(), 5)).await, b"fghi");
        assert_eq!(collect(skip_bytes(source(), 9)).await, b"");
        assert_eq!(collect(skip_bytes(source(), 20)).await, b"");
    }

    #[tokio::test]
    async fn test_fan_out_feeds_both_destinations() {
        let (merge_tx, merge_rx) = mpsc::channel(1);
        let (response_tx, response_rx) = mpsc::channel(1);

        let (total, merged, response) = tokio::join!(
            fan_out(chunks(&[b"one", b"two"]), merge_tx, response_tx),
            collect(ReceiverStream::new(merge_rx)),
            collect(ReceiverStream::new(response_rx)),
        );
        assert_eq!(total.unwrap(), 6);
        assert_eq!(merged, b"onetwo");
        assert_eq!(response, b"onetwo");
    }

    #[tokio::test]
    async fn test_fan_out_survives_dropped_response() {
        let (merge_tx, merge_rx) = mpsc::channel(1);
        let (response_tx, response_rx) = mpsc::channel(1);
        drop(response_rx);

        let (total, merged) = tokio::join!(
            fan_out(chunks(&[b"a", b"b", b"c"]), merge_tx, response_tx),
            collect(ReceiverStream::new(merge_rx)),
        );
        assert_eq!(total.unwrap(), 3);
        assert_eq!(merged, b"abc");
    }

    #[tokio::test]
    async fn test_fan_out_aborts_both_on_read_error() {
        let items: Vec<StorageResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"ok")),
            Err(StorageError::NotFound("f/parts/1".into())),
        ];
        let (merge_tx, mut merge_rx) = mpsc::channel(4);
        let (response_tx, mut response_rx) = mpsc::channel(4);

        let result = fan_out(Box::pin(futures::stream::iter(items)), merge_tx, response_tx).await;
        assert!(matches!(result, Err(StorageError::Aborted(_))));

        assert!(merge_rx.recv().await.unwrap().is_ok());
        assert!(merge_rx.recv().await.unwrap().is_err());
        assert!(response_rx.recv().await.unwrap().is_ok());
        assert!(matches!(
            response_rx.recv().await.unwrap(),
            Err(StorageError::NotFound(_))
        ));
    }
}
