//! Draft import: batching, per-file failures, planned blocks.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use common::{fast_kdf, memory_file, pattern, signer, Harness, BLOCK};
use nimbus_chunks::BlockPlanner;
use nimbus_core::types::{NodeId, RevisionState, ShareId, UploadId, UploadSource, UploadState};
use nimbus_core::{NimbusError, NimbusResult, ValidationError};
use nimbus_crypto::LocalEncryptionResource;
use nimbus_upload::importer::NewDraft;
use nimbus_upload::{DraftImportStorage, DraftStore, SegmentedFileDraftImporter};
use parking_lot::Mutex;

/// Records the size of every batch it persists.
struct CountingStorage {
    inner: DraftStore,
    batches: Mutex<Vec<usize>>,
}

#[async_trait]
impl DraftImportStorage for CountingStorage {
    async fn persist_batch(&self, batch: Vec<NewDraft>) -> Vec<NimbusResult<UploadId>> {
        self.batches.lock().push(batch.len());
        self.inner.persist_batch(batch).await
    }
}

fn importer_over(storage: Arc<dyn DraftImportStorage>, batch_size: usize) -> SegmentedFileDraftImporter {
    SegmentedFileDraftImporter::new(
        storage,
        Arc::new(LocalEncryptionResource::new(fast_kdf())),
        BlockPlanner::new(BLOCK).unwrap(),
        batch_size,
        "client-test",
    )
}

#[tokio::test]
async fn drafts_are_persisted_in_batches() {
    let storage = Arc::new(CountingStorage {
        inner: DraftStore::in_memory(),
        batches: Mutex::new(Vec::new()),
    });
    let importer = importer_over(storage.clone(), 20);
    let files = (0..45)
        .map(|i| memory_file(&format!("file-{i}.txt"), pattern(100 + i)))
        .collect();

    let outcome = importer
        .import(files, &ShareId::from("s"), &NodeId::from("p"), &signer())
        .await
        .unwrap();

    assert_eq!(outcome.succeeded.len(), 45);
    assert!(outcome.failed.is_empty());
    assert_eq!(*storage.batches.lock(), vec![20, 20, 5]);
    assert_eq!(storage.inner.len(), 45);
}

#[tokio::test]
async fn imported_draft_is_queued_with_planned_blocks() {
    let h = Harness::new();
    let id = h.import_bytes("plan.bin", pattern(2 * BLOCK as usize + 1)).await;

    let draft = h.store.get(id).unwrap();
    assert_eq!(draft.state, UploadState::Queued);
    assert_eq!(draft.revision.state, RevisionState::Draft);
    assert_eq!(draft.revision.size, 2 * BLOCK + 1);
    assert!(draft.file.node_id.is_none());
    assert_eq!(draft.file.share_id, h.share);
    assert_eq!(draft.file.parent_id, h.parent);
    assert_eq!(draft.file.signature_email, h.signer.email);
    assert!(!draft.file.node_key.is_empty());

    let sizes: Vec<u64> = h.store.blocks(id).unwrap().iter().map(|b| b.clear_size).collect();
    assert_eq!(sizes, vec![BLOCK, BLOCK, 1]);
    assert!(h.store.blocks(id).unwrap().iter().all(|b| !b.is_uploaded));
}

#[tokio::test]
async fn invalid_names_fail_per_file() {
    let h = Harness::new();
    let files = vec![
        memory_file("good.txt", pattern(10)),
        memory_file("bad/name.txt", pattern(10)),
        memory_file("", pattern(10)),
        memory_file("also-good.txt", pattern(10)),
    ];

    let outcome = h
        .importer
        .import(files, &h.share, &h.parent, &h.signer)
        .await
        .unwrap();

    assert_eq!(outcome.succeeded.len(), 2);
    let failed: Vec<&str> = outcome.failed.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(failed, vec!["bad/name.txt", ""]);
    assert!(outcome.failed.iter().all(|f| matches!(
        f.error,
        NimbusError::Validation(ValidationError::InvalidName(_))
    )));
    assert_eq!(h.store.len(), 2);
}

#[tokio::test]
async fn empty_selection_is_rejected() {
    let h = Harness::new();
    let err = h
        .importer
        .import(Vec::new(), &h.share, &h.parent, &h.signer)
        .await
        .unwrap_err();
    assert!(matches!(err, NimbusError::Validation(ValidationError::EmptyBatch)));
}

#[tokio::test]
async fn unreadable_source_fails_per_file() {
    let h = Harness::new();
    let mut missing = memory_file("missing.bin", Vec::new());
    missing.source = UploadSource::Path {
        path: PathBuf::from("/nonexistent/dir/missing.bin"),
    };
    let files = vec![missing, memory_file("present.bin", pattern(10))];

    let outcome = h
        .importer
        .import(files, &h.share, &h.parent, &h.signer)
        .await
        .unwrap();

    assert_eq!(outcome.succeeded.len(), 1);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].name, "missing.bin");
}

#[tokio::test]
async fn file_needing_too_many_blocks_fails_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sparse.bin");
    std::fs::File::create(&path)
        .unwrap()
        .set_len(u32::MAX as u64 + 1)
        .unwrap();
    let mut huge = memory_file("sparse.bin", Vec::new());
    huge.source = UploadSource::Path { path };

    let store = Arc::new(DraftStore::in_memory());
    let importer = SegmentedFileDraftImporter::new(
        store.clone(),
        Arc::new(LocalEncryptionResource::new(fast_kdf())),
        BlockPlanner::new(1).unwrap(),
        10,
        "client-test",
    );
    let outcome = importer
        .import(
            vec![huge, memory_file("small.bin", pattern(10))],
            &ShareId::from("s"),
            &NodeId::from("p"),
            &signer(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.succeeded.len(), 1);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].name, "sparse.bin");
    assert!(matches!(outcome.failed[0].error, NimbusError::LocalState(_)));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn imported_drafts_start_from_the_queue() {
    let h = Harness::new();
    let files = (0..3)
        .map(|i| memory_file(&format!("q-{i}.bin"), pattern(1_000 * (i + 1))))
        .collect();
    let outcome = h
        .importer
        .import(files, &h.share, &h.parent, &h.signer)
        .await
        .unwrap();

    let handles = h.uploader.start_queued();
    let started: Vec<UploadId> = handles.iter().map(|h| h.upload_id()).collect();
    assert_eq!(started, outcome.succeeded);
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert!(h.uploader.start_queued().is_empty());
}
