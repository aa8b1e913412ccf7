//! Engine test utilities.

use super::fixtures::chunked_stream;
use super::metadata::TestMetadata;
use super::storage::TestStorage;
use bytes::Bytes;
use futures::TryStreamExt;
use hoard_core::CacheTriple;
use hoard_core::config::AppConfig;
use hoard_metadata::{LocationState, MetadataStore};
use hoard_server::CacheEngine;
use hoard_storage::{ByteStream, StorageAdapter};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// An engine over tempdir storage and SQLite.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestEngine {
    pub engine: CacheEngine,
    pub storage: TestStorage,
    pub metadata: TestMetadata,
}

#[allow(dead_code)]
impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(AppConfig::for_testing()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let storage = TestStorage::new().await.expect("Failed to create storage");
        let metadata = TestMetadata::new().await.expect("Failed to create metadata");
        let engine = CacheEngine::new(storage.store(), metadata.store(), &config);
        Self {
            engine,
            storage,
            metadata,
        }
    }

    /// Same stores, different storage adapter in front of them.
    pub fn with_adapter(&self, adapter: Arc<dyn StorageAdapter>) -> CacheEngine {
        CacheEngine::new(adapter, self.metadata.store(), &AppConfig::for_testing())
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.metadata.store()
    }
}

/// Reserve, upload every part in order, and commit.
#[allow(dead_code)]
pub async fn store_entry(engine: &CacheEngine, triple: &CacheTriple, parts: &[Bytes]) -> Uuid {
    let upload_id = engine
        .reserve_upload(triple)
        .await
        .expect("reserve failed")
        .expect("upload already reserved");
    for (index, part) in parts.iter().enumerate() {
        let accepted = engine
            .upload_part(upload_id, index as u32, chunked_stream(part, 1024))
            .await
            .expect("part upload failed");
        assert!(accepted, "part {index} rejected");
    }
    engine
        .commit_upload(triple)
        .await
        .expect("commit failed")
        .expect("nothing to commit")
}

/// Drain a download stream.
#[allow(dead_code)]
pub async fn read_all(stream: ByteStream) -> Vec<u8> {
    let chunks: Vec<Bytes> = stream.try_collect().await.expect("stream failed");
    chunks.concat()
}

/// Poll until the entry's location reaches `state`.
#[allow(dead_code)]
pub async fn wait_for_state(metadata: &dyn MetadataStore, entry_id: Uuid, state: LocationState) {
    for _ in 0..200 {
        let location = metadata
            .get_location_for_entry(entry_id)
            .await
            .expect("lookup failed")
            .expect("entry has no location");
        if location.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("location of {entry_id} never reached {state:?}");
}
