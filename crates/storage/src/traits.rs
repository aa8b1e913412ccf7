//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Uniform interface to a blob store.
///
/// Object names are `/`-separated paths relative to the adapter's root or
/// prefix. "Folders" are name prefixes; backends without real directories
/// emulate them with prefix listings.
#[async_trait]
pub trait StorageAdapter: Send + Sync + 'static {
    /// Write a stream to `name`, replacing any existing object.
    ///
    /// If the stream yields an error the partial object is discarded and the
    /// error is returned.
    async fn upload_stream(&self, name: &str, stream: ByteStream) -> StorageResult<()>;

    /// Open `name` for reading. Fails with [`StorageError::NotFound`] if the
    /// object does not exist.
    ///
    /// [`StorageError::NotFound`]: crate::StorageError::NotFound
    async fn create_download_stream(&self, name: &str) -> StorageResult<ByteStream>;

    /// Recursively delete everything under `folder`. Deleting a folder that
    /// does not exist succeeds.
    async fn delete_folder(&self, folder: &str) -> StorageResult<()>;

    /// Number of objects directly under `folder`, not counting nested
    /// folders or their contents. Zero if it does not exist.
    async fn count_files_in_folder(&self, folder: &str) -> StorageResult<u64>;

    /// Pre-signed URL for downloading `name` directly from the backend.
    /// `None` if the backend cannot sign URLs.
    async fn create_download_url(&self, _name: &str) -> StorageResult<Option<String>> {
        Ok(None)
    }

    /// Static identifier of the backend ("filesystem", "s3", "gcs").
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable and writable. Called at startup.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Incremental writer used by backends to implement `upload_stream`.
#[async_trait]
pub(crate) trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Drain `stream` into `upload`, aborting the upload on any error.
pub(crate) async fn drain_into(
    mut upload: Box<dyn StreamingUpload>,
    mut stream: ByteStream,
) -> StorageResult<u64> {
    use futures::StreamExt;

    while let Some(item) = stream.next().await {
        let result = match item {
            Ok(chunk) => upload.write(chunk).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if let Err(abort_err) = upload.abort().await {
                tracing::warn!(error = %abort_err, "failed to abort partial upload");
            }
            return Err(e);
        }
    }
    upload.finish().await
}
