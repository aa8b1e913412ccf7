//! Upload sessions: reserve, parts, commit and replacement.

mod common;

use bytes::Bytes;
use common::{TestEngine, chunked_stream, read_all, seeded_bytes, store_entry, triple};
use hoard_core::UploadId;
use hoard_server::EngineError;

#[tokio::test]
async fn test_reserve_is_exclusive_per_triple() {
    let t = TestEngine::new().await;
    let target = triple("exclusive");

    let first = t.engine.reserve_upload(&target).await.unwrap();
    assert!(first.is_some());
    let second = t.engine.reserve_upload(&target).await.unwrap();
    assert!(second.is_none());

    // Other triples are unaffected.
    assert!(t.engine.reserve_upload(&triple("other")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_reserve_has_one_winner() {
    let t = TestEngine::new().await;
    let target = triple("racing");

    let (a, b) = tokio::join!(
        t.engine.reserve_upload(&target),
        t.engine.reserve_upload(&target)
    );
    let winners = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|id| id.is_some())
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_reserve_allowed_again_after_commit() {
    let t = TestEngine::new().await;
    let target = triple("again");
    store_entry(&t.engine, &target, &[seeded_bytes(1, 32)]).await;

    assert!(t.engine.reserve_upload(&target).await.unwrap().is_some());
}

#[tokio::test]
async fn test_upload_id_shape() {
    let t = TestEngine::new().await;
    let id = t.engine.reserve_upload(&triple("shape")).await.unwrap().unwrap();

    assert_eq!(id.to_string().len(), 10);
    let upload = t.store().get_upload(id.as_i64()).await.unwrap().unwrap();
    assert_eq!(upload.folder_name, id.folder_name());
    assert_eq!(upload.started_part_upload_count, 0);
    assert!(upload.last_part_uploaded_at.is_none());
}

#[tokio::test]
async fn test_part_accounting() {
    let t = TestEngine::new().await;
    let id = t.engine.reserve_upload(&triple("counted")).await.unwrap().unwrap();

    for index in 0..3u32 {
        let data = seeded_bytes(u64::from(index), 100);
        assert!(t.engine.upload_part(id, index, chunked_stream(&data, 30)).await.unwrap());
    }

    let upload = t.store().get_upload(id.as_i64()).await.unwrap().unwrap();
    assert_eq!(upload.started_part_upload_count, 3);
    assert_eq!(upload.finished_part_upload_count, 3);
    assert!(upload.last_part_uploaded_at.is_some());
    assert!(t.storage.exists(&format!("{}/parts/2", id.folder_name())));
}

#[tokio::test]
async fn test_unknown_upload_part_is_rejected() {
    let t = TestEngine::new().await;
    let accepted = t
        .engine
        .upload_part(UploadId::from_raw(1_234_567_890), 0, chunked_stream(b"data", 2))
        .await
        .unwrap();
    assert!(!accepted);
    assert!(!t.storage.exists("1234567890"));
}

#[tokio::test]
async fn test_parts_reassembled_in_index_order() {
    let t = TestEngine::new().await;
    let target = triple("ordered");
    let parts: Vec<Bytes> = (0..3).map(|i| seeded_bytes(10 + i, 3000)).collect();
    let id = t.engine.reserve_upload(&target).await.unwrap().unwrap();

    for index in [2u32, 0, 1] {
        let part = &parts[index as usize];
        assert!(t.engine.upload_part(id, index, chunked_stream(part, 512)).await.unwrap());
    }
    let entry_id = t.engine.commit_upload(&target).await.unwrap().unwrap();

    let content = read_all(t.engine.download(entry_id).await.unwrap().unwrap()).await;
    assert_eq!(content, parts.concat());
}

#[tokio::test]
async fn test_reuploaded_part_replaces_previous() {
    let t = TestEngine::new().await;
    let target = triple("retried");
    let id = t.engine.reserve_upload(&target).await.unwrap().unwrap();

    t.engine.upload_part(id, 0, chunked_stream(b"stale", 2)).await.unwrap();
    t.engine.upload_part(id, 0, chunked_stream(b"fresh", 2)).await.unwrap();
    let entry_id = t.engine.commit_upload(&target).await.unwrap().unwrap();

    let location = t.store().get_location_for_entry(entry_id).await.unwrap().unwrap();
    assert_eq!(location.part_count, 1);
    let content = read_all(t.engine.download(entry_id).await.unwrap().unwrap()).await;
    assert_eq!(content, b"fresh");
}

#[tokio::test]
async fn test_commit_without_parts_keeps_upload() {
    let t = TestEngine::new().await;
    let target = triple("empty");
    let id = t.engine.reserve_upload(&target).await.unwrap().unwrap();

    let result = t.engine.commit_upload(&target).await;
    match result {
        Err(EngineError::NoPartsUploaded { upload_id }) => assert_eq!(upload_id, id),
        other => panic!("expected NoPartsUploaded, got {other:?}"),
    }

    assert!(t.store().get_upload(id.as_i64()).await.unwrap().is_some());
    assert!(
        t.store()
            .find_exact(&target.key, &target.version, &target.scope)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_commit_without_reservation_is_none() {
    let t = TestEngine::new().await;
    assert!(t.engine.commit_upload(&triple("nobody")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_second_commit_is_none() {
    let t = TestEngine::new().await;
    let target = triple("twice");
    store_entry(&t.engine, &target, &[seeded_bytes(1, 32)]).await;

    assert!(t.engine.commit_upload(&target).await.unwrap().is_none());
}

#[tokio::test]
async fn test_commit_creates_entry_and_location() {
    let t = TestEngine::new().await;
    let target = triple("created");
    let id = t.engine.reserve_upload(&target).await.unwrap().unwrap();
    t.engine.upload_part(id, 0, chunked_stream(b"a", 1)).await.unwrap();
    t.engine.upload_part(id, 1, chunked_stream(b"b", 1)).await.unwrap();

    let entry_id = t.engine.commit_upload(&target).await.unwrap().unwrap();

    let entry = t.store().get_cache_entry(entry_id).await.unwrap().unwrap();
    assert_eq!(entry.key, "created");
    assert_eq!(entry.updated_at, entry.accessed_at);

    let location = t.store().get_location(entry.location_id).await.unwrap().unwrap();
    assert_eq!(location.folder_name, id.folder_name());
    assert_eq!(location.part_count, 2);
    assert!(location.merge_started_at.is_none());
    assert!(location.merged_at.is_none());

    assert!(t.store().get_upload(id.as_i64()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_replacement_keeps_entry_id_and_removes_old_location() {
    let t = TestEngine::new().await;
    let target = triple("replaced");

    let first = store_entry(&t.engine, &target, &[seeded_bytes(1, 64)]).await;
    let old_location = t.store().get_location_for_entry(first).await.unwrap().unwrap();
    assert!(t.storage.exists(&old_location.folder_name));

    let second = store_entry(&t.engine, &target, &[seeded_bytes(2, 64)]).await;
    assert_eq!(first, second);

    let new_location = t.store().get_location_for_entry(second).await.unwrap().unwrap();
    assert_ne!(new_location.id, old_location.id);
    assert!(t.store().get_location(old_location.id).await.unwrap().is_none());
    assert!(!t.storage.exists(&old_location.folder_name));

    let content = read_all(t.engine.download(second).await.unwrap().unwrap()).await;
    assert_eq!(content, seeded_bytes(2, 64));
}

#[tokio::test]
async fn test_part_for_committed_upload_is_rejected() {
    let t = TestEngine::new().await;
    let target = triple("late-part");
    let id = t.engine.reserve_upload(&target).await.unwrap().unwrap();
    t.engine.upload_part(id, 0, chunked_stream(b"ok", 1)).await.unwrap();
    let entry_id = t.engine.commit_upload(&target).await.unwrap().unwrap();

    let accepted = t
        .engine
        .upload_part(id, 1, chunked_stream(b"late", 1))
        .await
        .unwrap();
    assert!(!accepted);

    let content = read_all(t.engine.download(entry_id).await.unwrap().unwrap()).await;
    assert_eq!(content, b"ok");
}
