//! Storage test utilities.

use async_trait::async_trait;
use hoard_storage::{ByteStream, FilesystemBackend, StorageAdapter, StorageError, StorageResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// A test storage wrapper that cleans up on drop.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestStorage {
    pub backend: Arc<dyn StorageAdapter>,
    temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestStorage {
    /// Create a new test storage with a temporary directory.
    pub async fn new() -> StorageResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let backend = FilesystemBackend::new(temp_dir.path()).await?;

        Ok(Self {
            backend: Arc::new(backend),
            temp_dir,
        })
    }

    /// Get a reference to the storage adapter.
    pub fn store(&self) -> Arc<dyn StorageAdapter> {
        self.backend.clone()
    }

    /// Whether `name` exists on disk.
    pub fn exists(&self, name: &str) -> bool {
        self.temp_dir.path().join(name).exists()
    }
}

/// Storage wrapper that fails the next `n` uploads of merged objects.
#[allow(dead_code)]
pub struct FailingStorage {
    inner: Arc<dyn StorageAdapter>,
    merged_failures: AtomicUsize,
}

#[allow(dead_code)]
impl FailingStorage {
    pub fn new(inner: Arc<dyn StorageAdapter>, merged_failures: usize) -> Self {
        Self {
            inner,
            merged_failures: AtomicUsize::new(merged_failures),
        }
    }

    fn take_failure(&self) -> bool {
        self.merged_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StorageAdapter for FailingStorage {
    async fn upload_stream(&self, name: &str, stream: ByteStream) -> StorageResult<()> {
        if name.ends_with("/merged") && self.take_failure() {
            drop(stream);
            return Err(StorageError::Backend("injected merge upload failure".into()));
        }
        self.inner.upload_stream(name, stream).await
    }

    async fn create_download_stream(&self, name: &str) -> StorageResult<ByteStream> {
        self.inner.create_download_stream(name).await
    }

    async fn delete_folder(&self, folder: &str) -> StorageResult<()> {
        self.inner.delete_folder(folder).await
    }

    async fn count_files_in_folder(&self, folder: &str) -> StorageResult<u64> {
        self.inner.count_files_in_folder(folder).await
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

/// Storage wrapper that stalls merged uploads and part reads.
#[allow(dead_code)]
pub struct SlowStorage {
    inner: Arc<dyn StorageAdapter>,
    merged_upload_delay: Duration,
    part_read_delay: Duration,
}

#[allow(dead_code)]
impl SlowStorage {
    pub fn new(
        inner: Arc<dyn StorageAdapter>,
        merged_upload_delay: Duration,
        part_read_delay: Duration,
    ) -> Self {
        Self {
            inner,
            merged_upload_delay,
            part_read_delay,
        }
    }
}

#[async_trait]
impl StorageAdapter for SlowStorage {
    async fn upload_stream(&self, name: &str, stream: ByteStream) -> StorageResult<()> {
        if name.ends_with("/merged") {
            tokio::time::sleep(self.merged_upload_delay).await;
        }
        self.inner.upload_stream(name, stream).await
    }

    async fn create_download_stream(&self, name: &str) -> StorageResult<ByteStream> {
        if name.contains("/parts/") {
            tokio::time::sleep(self.part_read_delay).await;
        }
        self.inner.create_download_stream(name).await
    }

    async fn delete_folder(&self, folder: &str) -> StorageResult<()> {
        self.inner.delete_folder(folder).await
    }

    async fn count_files_in_folder(&self, folder: &str) -> StorageResult<u64> {
        self.inner.count_files_in_folder(folder).await
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }
}
