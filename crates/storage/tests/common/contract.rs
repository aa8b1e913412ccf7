//! Behaviour every storage adapter must share, run against each backend.

use super::fixtures::{chunked_stream, read_object, seeded_bytes, sha256_hash};
use bytes::Bytes;
use hoard_storage::{StorageAdapter, StorageError};
use std::sync::Arc;

pub async fn roundtrip_preserves_bytes(adapter: &dyn StorageAdapter) {
    let data = seeded_bytes(7, 300_000);
    adapter
        .upload_stream("rt/parts/0", chunked_stream(data.clone(), 10_000))
        .await
        .unwrap();

    let read = read_object(adapter, "rt/parts/0").await.unwrap();
    assert_eq!(sha256_hash(&read), sha256_hash(&data));
}

pub async fn empty_object_roundtrip(adapter: &dyn StorageAdapter) {
    adapter
        .upload_stream("empty/merged", chunked_stream(Bytes::new(), 1024))
        .await
        .unwrap();
    assert!(read_object(adapter, "empty/merged").await.unwrap().is_empty());
}

pub async fn missing_object_is_not_found(adapter: &dyn StorageAdapter) {
    match adapter.create_download_stream("absent/merged").await {
        Err(StorageError::NotFound(_)) => {}
        Err(other) => panic!("expected NotFound, got {other:?}"),
        Ok(_) => panic!("expected NotFound, got a stream"),
    }
}

pub async fn count_reflects_folder_contents(adapter: &dyn StorageAdapter) {
    assert_eq!(adapter.count_files_in_folder("cnt/parts").await.unwrap(), 0);
    for i in 0..3 {
        adapter
            .upload_stream(
                &format!("cnt/parts/{i}"),
                chunked_stream(seeded_bytes(i, 100), 64),
            )
            .await
            .unwrap();
    }
    // A sibling folder sharing a name prefix must not be counted.
    adapter
        .upload_stream("cnt/parts-extra/0", chunked_stream(seeded_bytes(9, 10), 64))
        .await
        .unwrap();
    // Neither are objects in nested folders.
    adapter
        .upload_stream("cnt/parts/nested/0", chunked_stream(seeded_bytes(8, 10), 64))
        .await
        .unwrap();

    assert_eq!(adapter.count_files_in_folder("cnt/parts").await.unwrap(), 3);
}

pub async fn delete_folder_removes_everything_and_is_idempotent(adapter: &dyn StorageAdapter) {
    for name in ["del/parts/0", "del/parts/1", "del/merged"] {
        adapter
            .upload_stream(name, chunked_stream(seeded_bytes(1, 10), 64))
            .await
            .unwrap();
    }
    adapter
        .upload_stream("delete-me-not/merged", chunked_stream(seeded_bytes(2, 10), 64))
        .await
        .unwrap();

    adapter.delete_folder("del").await.unwrap();
    assert_eq!(adapter.count_files_in_folder("del/parts").await.unwrap(), 0);
    assert!(matches!(
        adapter.create_download_stream("del/merged").await,
        Err(StorageError::NotFound(_))
    ));
    assert!(read_object(adapter, "delete-me-not/merged").await.is_ok());

    adapter.delete_folder("del").await.unwrap();
}

pub async fn concurrent_uploads_do_not_interfere(adapter: Arc<dyn StorageAdapter>) {
    let handles: Vec<_> = (0..6u64)
        .map(|i| {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                adapter
                    .upload_stream(
                        &format!("conc/parts/{i}"),
                        chunked_stream(seeded_bytes(i, 50_000), 4096),
                    )
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for i in 0..6u64 {
        let read = read_object(adapter.as_ref(), &format!("conc/parts/{i}"))
            .await
            .unwrap();
        assert_eq!(read, seeded_bytes(i, 50_000).to_vec());
    }
}
