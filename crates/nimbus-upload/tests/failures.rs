//! Error classification, retries, circuit breaker and the dedup fast path.

mod common;

use std::time::{Duration, Instant};

use common::{memory_file, pattern, Harness, BLOCK};
use nimbus_chunks::DigestBuilder;
use nimbus_core::types::{RevisionState, UploadState};
use nimbus_core::{ErrorKind, NimbusError, ValidationError};
use nimbus_upload::memory::{CloudCall, PutFault};
use nimbus_upload::{UploadEvent, UploadOutcome};

fn sha1_of(bytes: &[u8]) -> String {
    let mut builder = DigestBuilder::new();
    builder.add(bytes);
    builder.finish()
}

#[tokio::test]
async fn quota_exceeded_fails_and_retry_succeeds() {
    let h = Harness::new();
    let mut events = h.uploader.subscribe();
    h.cloud.set_quota_exceeded(true);
    let id = h.import_bytes("big.iso", pattern(5_000)).await;

    let err = h.uploader.upload(id).unwrap().wait().await.unwrap_err();
    assert!(matches!(err, NimbusError::Validation(ValidationError::QuotaExceeded)));
    assert_eq!(h.state(id), UploadState::Failed);
    assert!(h.store.get(id).unwrap().last_error.is_some());

    let failed = std::iter::from_fn(|| events.try_recv().ok())
        .find_map(|e| match e {
            UploadEvent::Failed { state, user_message, .. } => Some((state, user_message)),
            _ => None,
        })
        .unwrap();
    assert_eq!(failed.0, UploadState::Failed);
    assert!(failed.1.contains("storage space"));

    assert!(h.uploader.resume(id).is_err());
    h.cloud.set_quota_exceeded(false);
    let outcome = h.uploader.retry_failed(id).unwrap().wait().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Completed { .. }));
    assert!(h.store.get(id).unwrap().last_error.is_none());
}

#[tokio::test]
async fn transient_put_failures_are_retried_in_place() {
    let h = Harness::new();
    h.cloud.fail_puts(1, PutFault::Transient, 2);
    let id = h.import_bytes("flaky.bin", pattern(3 * BLOCK as usize)).await;

    let outcome = h.uploader.upload(id).unwrap().wait().await.unwrap();

    assert!(matches!(outcome, UploadOutcome::Completed { .. }));
    assert_eq!(h.puts_started("1"), 3);
    assert_eq!(h.puts_started("0"), 1);
}

#[tokio::test]
async fn exhausted_retries_interrupt_the_draft() {
    let h = Harness::new();
    h.cloud.fail_puts(0, PutFault::Transient, 100);
    let id = h.import_bytes("offline.bin", pattern(2_000)).await;

    let err = h.uploader.upload(id).unwrap().wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(h.state(id), UploadState::Interrupted);
    // initial attempt plus max_retries
    assert_eq!(h.puts_started("0"), 1 + h.config.uploader.max_retries as usize);

    h.cloud.fail_puts(0, PutFault::Transient, 0);
    let outcome = h.uploader.resume(id).unwrap().wait().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Completed { .. }));
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let h = Harness::new();
    h.cloud.fail_puts(0, PutFault::Server(400), 1);
    let id = h.import_bytes("bad.bin", pattern(2_000)).await;

    let err = h.uploader.upload(id).unwrap().wait().await.unwrap_err();
    assert!(matches!(err, NimbusError::Server { status: 400, .. }));
    assert_eq!(h.puts_started("0"), 1);
    assert_eq!(h.state(id), UploadState::Interrupted);
}

#[tokio::test]
async fn server_outage_delays_the_next_upload() {
    let h = Harness::new();
    h.cloud.fail_puts(0, PutFault::Server(503), 100);
    let first = h.import_bytes("first.bin", pattern(2_000)).await;
    let second = h.import_bytes("second.bin", pattern(3_000)).await;

    let err = h.uploader.upload(first).unwrap().wait().await.unwrap_err();
    assert!(err.is_server_outage());
    assert_eq!(h.state(first), UploadState::Interrupted);

    h.cloud.fail_puts(0, PutFault::Server(503), 0);
    let started = Instant::now();
    let outcome = h.uploader.upload(second).unwrap().wait().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Completed { .. }));
    assert!(started.elapsed() >= Duration::from_millis(500));
}

#[tokio::test]
async fn existing_content_takes_the_fast_path() {
    let h = Harness::new();
    let bytes = pattern(9_000);
    let existing = h.cloud.seed_existing(&h.share, &h.parent, "dup.bin", &sha1_of(&bytes));
    let id = h.import(memory_file("dup.bin", bytes)).await;

    let outcome = h.uploader.upload(id).unwrap().wait().await.unwrap();

    assert_eq!(
        outcome,
        UploadOutcome::Completed {
            identifier: existing.clone(),
            verifying: false,
            fast_path: true,
        }
    );
    assert_eq!(h.state(id), UploadState::Done);
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::CreateRevision { .. })), 0);
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::PutStarted { .. })), 0);
    let draft = h.store.get(id).unwrap();
    assert_eq!(draft.identifier(), Some(existing));
    assert_eq!(draft.revision.state, RevisionState::Active);
}

#[tokio::test]
async fn same_content_under_another_name_is_a_new_file() {
    let h = Harness::new();
    let bytes = pattern(6_000);
    let first = h.import(memory_file("a.bin", bytes.clone())).await;
    let UploadOutcome::Completed { identifier: a, .. } = h.uploader.upload(first).unwrap().wait().await.unwrap() else {
        panic!("first upload did not complete");
    };

    let second = h.import(memory_file("b.bin", bytes)).await;
    let outcome = h.uploader.upload(second).unwrap().wait().await.unwrap();
    let UploadOutcome::Completed { identifier: b, fast_path, .. } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };

    assert!(!fast_path);
    assert_ne!(a.node_id, b.node_id);
    assert!(h.cloud.is_active(&a.revision_id));
    assert!(h.cloud.is_active(&b.revision_id));
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::CreateRevision { .. })), 2);
    assert_eq!(h.store.get(second).unwrap().identifier(), Some(b));
}

#[tokio::test]
async fn reuploading_the_same_file_takes_the_fast_path() {
    let h = Harness::new();
    let bytes = pattern(6_000);
    let first = h.import(memory_file("a.bin", bytes.clone())).await;
    let UploadOutcome::Completed { identifier, .. } = h.uploader.upload(first).unwrap().wait().await.unwrap() else {
        panic!("first upload did not complete");
    };

    let again = h.import(memory_file("a.bin", bytes)).await;
    let outcome = h.uploader.upload(again).unwrap().wait().await.unwrap();
    assert!(matches!(
        outcome,
        UploadOutcome::Completed { fast_path: true, identifier: ref i, .. } if *i == identifier
    ));
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::CreateRevision { .. })), 1);
}

#[tokio::test]
async fn failed_dedup_lookup_falls_back_to_upload() {
    let h = Harness::new();
    h.cloud.fail_digest_lookup(true);
    let id = h.import_bytes("lookup.bin", pattern(5_000)).await;

    let outcome = h.uploader.upload(id).unwrap().wait().await.unwrap();

    assert!(matches!(outcome, UploadOutcome::Completed { fast_path: false, .. }));
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::FindByDigest { .. })), 1);
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::Commit { .. })), 1);
}

#[tokio::test]
async fn transient_commit_failure_is_retried() {
    let h = Harness::new();
    let id = h.import_bytes("retry-commit.bin", pattern(5_000)).await;
    h.cloud.fail_next_commit(NimbusError::transient("connection reset"));

    let outcome = h.uploader.upload(id).unwrap().wait().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Completed { verifying: true, .. }));
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::Commit { .. })), 2);
}

#[tokio::test]
async fn lost_commit_response_is_confirmed_from_the_active_revision() {
    let h = Harness::new();
    let id = h.import_bytes("lost-response.bin", pattern(5_000)).await;
    h.cloud.lose_next_commit_response();

    let outcome = h.uploader.upload(id).unwrap().wait().await.unwrap();
    let UploadOutcome::Completed { identifier, verifying, .. } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert!(!verifying);
    assert!(h.cloud.is_active(&identifier.revision_id));
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::Commit { .. })), 2);
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::FindByDigest { .. })), 1);
    assert_eq!(
        h.cloud.count(|c| matches!(c, CloudCall::CheckRevision { revision_id } if *revision_id == identifier.revision_id)),
        1
    );
    assert_eq!(h.state(id), UploadState::Done);
}

#[tokio::test]
async fn lost_commit_beside_identical_file_confirms_its_own_revision() {
    let h = Harness::new();
    let bytes = pattern(5_000);
    let first = h.import(memory_file("a.bin", bytes.clone())).await;
    let UploadOutcome::Completed { identifier: a, .. } = h.uploader.upload(first).unwrap().wait().await.unwrap() else {
        panic!("first upload did not complete");
    };

    let second = h.import(memory_file("b.bin", bytes)).await;
    h.cloud.lose_next_commit_response();
    let outcome = h.uploader.upload(second).unwrap().wait().await.unwrap();
    let UploadOutcome::Completed { identifier: b, verifying, fast_path } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };

    assert!(!verifying);
    assert!(!fast_path);
    assert_ne!(a.node_id, b.node_id);
    assert!(h.cloud.is_active(&b.revision_id));
    assert_eq!(h.store.get(second).unwrap().identifier(), Some(b));
    assert_eq!(h.state(second), UploadState::Done);
}

#[tokio::test]
async fn commit_reported_existing_but_never_activated_is_a_conflict() {
    let h = Harness::new();
    let id = h.import_bytes("phantom.bin", pattern(5_000)).await;
    h.cloud.report_next_commit_as_existing();

    let err = h.uploader.upload(id).unwrap().wait().await.unwrap_err();

    assert!(matches!(err, NimbusError::Validation(ValidationError::ConflictingRevision(_))));
    assert_eq!(h.state(id), UploadState::Failed);
    let draft = h.store.get(id).unwrap();
    assert_ne!(draft.revision.state, RevisionState::Active);
    assert_eq!(h.cloud.count(|c| matches!(c, CloudCall::CheckRevision { .. })), 1);
}
