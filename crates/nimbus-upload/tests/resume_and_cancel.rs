//! Pause, resume, cancel and restart after interruption.

mod common;

use std::sync::Arc;

use common::{eventually, pattern, test_config, Harness, BLOCK};
use nimbus_core::types::{NodeId, UploadState};
use nimbus_upload::memory::CloudCall;
use nimbus_upload::{DraftStore, MemoryCloud, UploadOutcome};

fn created_node(h: &Harness) -> Option<NodeId> {
    h.cloud.calls().into_iter().find_map(|c| match c.call {
        CloudCall::CreateRevision { node_id, .. } => Some(node_id),
        _ => None,
    })
}

fn requested_links(h: &Harness) -> Vec<Vec<u32>> {
    h.cloud
        .calls()
        .into_iter()
        .filter_map(|c| match c.call {
            CloudCall::RequestLinks { blocks, .. } => Some(blocks),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn resume_skips_blocks_already_uploaded() {
    let h = Harness::new();
    h.cloud.hold_puts([1, 2]);
    let id = h.import_bytes("resume.bin", pattern(3 * BLOCK as usize)).await;

    let handle = h.uploader.upload(id).unwrap();
    eventually(|| {
        h.store.block(id, 0).is_some_and(|b| b.is_uploaded)
            && h.puts_started("1") == 1
            && h.puts_started("2") == 1
    })
    .await;
    h.uploader.pause(id).unwrap();
    assert_eq!(handle.wait().await.unwrap(), UploadOutcome::Stopped(UploadState::Paused));
    assert_eq!(h.state(id), UploadState::Paused);

    h.cloud.release_puts();
    let handle = h.uploader.resume(id).unwrap();
    let progress = handle.progress().clone();
    assert!(matches!(handle.wait().await.unwrap(), UploadOutcome::Completed { .. }));

    assert_eq!(h.puts_started("0"), 1);
    assert_eq!(requested_links(&h), vec![vec![0, 1, 2], vec![1, 2]]);
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::CreateRevision { .. })), 1);
    assert_eq!(progress.completed(), 3 * BLOCK);
}

#[tokio::test]
async fn cancel_stops_before_commit_and_deletes_the_node() {
    let mut config = test_config();
    config.uploader.max_concurrent_blocks = 2;
    let h = Harness::with_config(config);
    h.cloud.hold_puts([1]);
    let id = h.import_bytes("cancel.bin", pattern(3 * BLOCK as usize)).await;

    let handle = h.uploader.upload(id).unwrap();
    eventually(|| h.puts_started("1") == 1).await;
    h.uploader.cancel(id).await.unwrap();
    assert_eq!(handle.wait().await.unwrap(), UploadOutcome::Stopped(UploadState::Canceled));

    assert_eq!(h.state(id), UploadState::Canceled);
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::Commit { .. })), 0);
    let node = created_node(&h).unwrap();
    assert!(!h.cloud.node_exists(&node));
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::DeleteFile { .. })), 1);
    assert!(!h.uploader.is_running(id));
}

#[tokio::test]
async fn canceled_draft_cannot_be_resumed() {
    let h = Harness::new();
    h.cloud.hold_puts([0]);
    let id = h.import_bytes("gone.bin", pattern(1_000)).await;

    let handle = h.uploader.upload(id).unwrap();
    eventually(|| h.puts_started("0") == 1).await;
    h.uploader.cancel(id).await.unwrap();
    handle.wait().await.unwrap();

    assert!(h.uploader.resume(id).is_err());
    assert!(h.uploader.retry_failed(id).is_err());
}

#[tokio::test]
async fn queued_draft_cancels_without_remote_calls() {
    let h = Harness::new();
    let id = h.import_bytes("queued.bin", pattern(100)).await;

    h.uploader.cancel(id).await.unwrap();

    assert_eq!(h.state(id), UploadState::Canceled);
    assert!(h.cloud.calls().is_empty());
    assert!(h.uploader.upload(id).is_err());
}

#[tokio::test]
async fn queued_draft_can_be_paused_and_resumed() {
    let h = Harness::new();
    let id = h.import_bytes("later.bin", pattern(100)).await;

    h.uploader.pause(id).unwrap();
    assert_eq!(h.state(id), UploadState::Paused);

    let outcome = h.uploader.resume(id).unwrap().wait().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Completed { .. }));
}

#[tokio::test]
async fn interrupted_uploads_restart() {
    let h = Harness::new();
    h.cloud.hold_puts([1]);
    let first = h.import_bytes("one.bin", pattern(2 * BLOCK as usize)).await;
    let second = h.import_bytes("two.bin", pattern(2 * BLOCK as usize)).await;

    let handles = h.uploader.start_queued();
    assert_eq!(handles.len(), 2);
    eventually(|| h.puts_started("1") == 2).await;

    assert_eq!(h.uploader.interrupt_all(), 2);
    for handle in handles {
        assert_eq!(
            handle.wait().await.unwrap(),
            UploadOutcome::Stopped(UploadState::Interrupted)
        );
    }
    assert_eq!(h.state(first), UploadState::Interrupted);

    h.cloud.release_puts();
    let handles = h.uploader.restart_interrupted();
    assert_eq!(handles.len(), 2);
    for handle in handles {
        assert!(matches!(handle.wait().await.unwrap(), UploadOutcome::Completed { .. }));
    }
    h.uploader.wait_for_verifications().await;
    assert_eq!(h.state(first), UploadState::Done);
    assert_eq!(h.state(second), UploadState::Done);
}

#[tokio::test]
async fn orphaned_drafts_are_recovered_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drafts.json");
    let cloud = Arc::new(MemoryCloud::new().unwrap());

    let id = {
        let store = Arc::new(DraftStore::open(&path).unwrap());
        let h = Harness::with_parts(test_config(), store.clone(), cloud.clone());
        let id = h.import_bytes("orphan.bin", pattern(5_000)).await;
        // A process that died mid-upload leaves the draft in a running stage.
        store.transition(id, UploadState::CreatingContent).unwrap();
        store.transition(id, UploadState::UploadingBlocks).unwrap();
        store.flush().unwrap();
        id
    };

    let store = Arc::new(DraftStore::open(&path).unwrap());
    assert_eq!(store.state(id), Some(UploadState::UploadingBlocks));
    let h = Harness::with_parts(test_config(), store, cloud);

    let handles = h.uploader.restart_interrupted();
    assert_eq!(handles.len(), 1);
    let handle = handles.into_iter().next().unwrap();
    assert_eq!(handle.upload_id(), id);
    assert!(matches!(handle.wait().await.unwrap(), UploadOutcome::Completed { .. }));
    h.uploader.wait_for_verifications().await;
    assert_eq!(h.state(id), UploadState::Done);

    let reloaded = DraftStore::open(&path).unwrap();
    assert_eq!(reloaded.state(id), Some(UploadState::Done));
}

#[tokio::test]
async fn pending_verification_is_rerun_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drafts.json");
    let cloud = Arc::new(MemoryCloud::new().unwrap());
    cloud.hold_verification();

    let id = {
        let store = Arc::new(DraftStore::open(&path).unwrap());
        let h = Harness::with_parts(test_config(), store, cloud.clone());
        let id = h.import_bytes("verify-later.bin", pattern(5_000)).await;
        let outcome = h.uploader.upload(id).unwrap().wait().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Completed { verifying: true, .. }));
        assert_eq!(h.state(id), UploadState::Verifying);
        id
    };

    // The first uploader's verification stays parked on the held gate; the
    // restarted process works from a snapshot of its store.
    let restarted = dir.path().join("drafts-restarted.json");
    std::fs::copy(&path, &restarted).unwrap();
    let store = Arc::new(DraftStore::open(&restarted).unwrap());
    assert_eq!(store.state(id), Some(UploadState::Verifying));
    let h = Harness::with_parts(test_config(), store, cloud.clone());
    cloud.release_verification();

    assert!(h.uploader.restart_interrupted().is_empty());
    h.uploader.wait_for_verifications().await;
    assert_eq!(h.state(id), UploadState::Done);
    assert!(cloud.count(|c| matches!(c, CloudCall::ConfirmVerification { .. })) >= 1);
}
