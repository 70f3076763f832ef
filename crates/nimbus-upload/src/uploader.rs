//! Upload orchestration: slots, stop requests, final state of each attempt,
//! background verification and restart after interruption.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nimbus_chunks::BlockPlanner;
use nimbus_core::config::{NimbusConfig, UploaderConfig};
use nimbus_core::types::{RevisionState, UploadId, UploadState, UploadingFileIdentifier};
use nimbus_core::{ErrorKind, NimbusError, NimbusResult};
use nimbus_crypto::{ContentKeyResource, EncryptionResource, ExtendedAttributesCreator, SignersKit};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::events::{EventBus, UploadEvent};
use crate::operations::UploadContext;
use crate::pipeline::{run_pipeline, PipelineOutcome};
use crate::progress::UploadProgress;
use crate::remote::CloudServices;
use crate::retry::{with_retry, with_timeout, CircuitBreaker, RetryPolicy, Timeouts};
use crate::store::DraftStore;
use crate::verifier::{UploadVerifier, VerificationInfoRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Pause,
    Interrupt,
    Cancel,
}

impl StopReason {
    fn state(self) -> UploadState {
        match self {
            StopReason::Pause => UploadState::Paused,
            StopReason::Interrupt => UploadState::Interrupted,
            StopReason::Cancel => UploadState::Canceled,
        }
    }
}

struct RunningUpload {
    cancel: CancellationToken,
    progress: Arc<UploadProgress>,
    stop: Option<StopReason>,
}

/// How one upload attempt ended, short of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The revision is active on the server.
    Completed {
        identifier: UploadingFileIdentifier,
        /// Post-commit verification was started in the background
        verifying: bool,
        /// The content already existed; nothing was uploaded
        fast_path: bool,
    },
    /// Stopped on request; the draft is paused, interrupted or canceled.
    Stopped(UploadState),
}

/// Completion handle for one upload attempt.
pub struct UploadHandle {
    upload_id: UploadId,
    progress: Arc<UploadProgress>,
    rx: oneshot::Receiver<NimbusResult<UploadOutcome>>,
}

impl UploadHandle {
    pub fn upload_id(&self) -> UploadId {
        self.upload_id
    }

    pub fn progress(&self) -> &Arc<UploadProgress> {
        &self.progress
    }

    /// Resolves once the draft has left the pipeline. Failures come back as
    /// the error that moved the draft to `failed` or `interrupted`.
    pub async fn wait(self) -> NimbusResult<UploadOutcome> {
        self.rx
            .await
            .map_err(|_| NimbusError::local_state(format!("upload {} task dropped", self.upload_id)))?
    }
}

impl std::fmt::Debug for UploadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadHandle")
            .field("upload_id", &self.upload_id)
            .finish_non_exhaustive()
    }
}

struct Inner {
    store: Arc<DraftStore>,
    cloud: CloudServices,
    keys: ContentKeyResource,
    xattrs: ExtendedAttributesCreator,
    signer: SignersKit,
    planner: BlockPlanner,
    config: UploaderConfig,
    policy: RetryPolicy,
    timeouts: Timeouts,
    events: EventBus,
    slots: Arc<Semaphore>,
    breaker: CircuitBreaker,
    running: Mutex<HashMap<UploadId, RunningUpload>>,
    verifying: Mutex<HashMap<UploadId, CancellationToken>>,
    verifications: TaskTracker,
}

#[derive(Clone)]
pub struct FileUploader {
    inner: Arc<Inner>,
}

impl FileUploader {
    pub fn new(
        store: Arc<DraftStore>,
        cloud: CloudServices,
        resource: Arc<dyn EncryptionResource>,
        signer: SignersKit,
        config: &NimbusConfig,
    ) -> NimbusResult<Self> {
        let planner = BlockPlanner::new(config.uploader.max_block_size)
            .map_err(|e| NimbusError::Config(format!("{e:#}")))?;
        let uploader = &config.uploader;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                cloud,
                keys: ContentKeyResource::new(resource.clone()),
                xattrs: ExtendedAttributesCreator::new(resource, planner),
                signer,
                planner,
                config: uploader.clone(),
                policy: RetryPolicy::from(uploader),
                timeouts: Timeouts::from(&config.network),
                events: EventBus::default(),
                slots: Arc::new(Semaphore::new(uploader.max_concurrent_uploads.max(1))),
                breaker: CircuitBreaker::new(Duration::from_secs(config.network.circuit_breaker_cooldown_secs)),
                running: Mutex::new(HashMap::new()),
                verifying: Mutex::new(HashMap::new()),
                verifications: TaskTracker::new(),
            }),
        })
    }

    pub fn store(&self) -> &Arc<DraftStore> {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self, id: UploadId) -> bool {
        self.inner.running.lock().contains_key(&id)
    }

    /// Start uploading a queued draft.
    pub fn upload(&self, id: UploadId) -> NimbusResult<UploadHandle> {
        let inner = &self.inner;
        let draft = inner
            .store
            .get(id)
            .ok_or_else(|| NimbusError::local_state(format!("draft {id} not found")))?;
        if draft.state != UploadState::Queued {
            return Err(NimbusError::local_state(format!(
                "draft {id} is {}, not queued",
                draft.state
            )));
        }

        let cancel = CancellationToken::new();
        let progress = Arc::new(UploadProgress::new(draft.revision.size));
        {
            let mut running = inner.running.lock();
            if running.contains_key(&id) {
                return Err(NimbusError::local_state(format!("draft {id} is already uploading")));
            }
            running.insert(
                id,
                RunningUpload {
                    cancel: cancel.clone(),
                    progress: progress.clone(),
                    stop: None,
                },
            );
        }

        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let task_progress = progress.clone();
        tokio::spawn(async move {
            let result = inner.attempt(id, task_progress, cancel).await;
            let outcome = inner.finish(id, result).await;
            let _ = tx.send(outcome);
        });
        Ok(UploadHandle {
            upload_id: id,
            progress,
            rx,
        })
    }

    /// Start every queued draft that is not already running, oldest first.
    pub fn start_queued(&self) -> Vec<UploadHandle> {
        self.inner
            .store
            .ids_in_states(&[UploadState::Queued])
            .into_iter()
            .filter(|id| !self.is_running(*id))
            .filter_map(|id| match self.upload(id) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(upload_id = %id, error = %e, "could not start upload");
                    None
                }
            })
            .collect()
    }

    fn request_stop(&self, id: UploadId, reason: StopReason) -> bool {
        let mut running = self.inner.running.lock();
        let Some(run) = running.get_mut(&id) else {
            return false;
        };
        // Cancel wins over an earlier pause or interrupt.
        if run.stop != Some(StopReason::Cancel) {
            run.stop = Some(reason);
        }
        run.progress.cancel();
        run.cancel.cancel();
        true
    }

    /// Stop a running upload and keep its progress for `resume`.
    pub fn pause(&self, id: UploadId) -> NimbusResult<()> {
        if self.request_stop(id, StopReason::Pause) {
            tracing::info!(upload_id = %id, "pause requested");
            return Ok(());
        }
        self.inner.move_to(id, UploadState::Paused)
    }

    /// Requeue a paused or interrupted draft and start it.
    pub fn resume(&self, id: UploadId) -> NimbusResult<UploadHandle> {
        let state = self
            .inner
            .store
            .state(id)
            .ok_or_else(|| NimbusError::local_state(format!("draft {id} not found")))?;
        if !state.is_resumable() {
            return Err(NimbusError::local_state(format!("draft {id} is {state}, cannot resume")));
        }
        self.requeue(id)?;
        self.upload(id)
    }

    /// Explicit restart of a failed draft.
    pub fn retry_failed(&self, id: UploadId) -> NimbusResult<UploadHandle> {
        if self.inner.store.state(id) != Some(UploadState::Failed) {
            return Err(NimbusError::local_state(format!("draft {id} has not failed")));
        }
        self.requeue(id)?;
        self.upload(id)
    }

    fn requeue(&self, id: UploadId) -> NimbusResult<()> {
        self.inner.store.update_draft(id, |d| {
            d.last_error = None;
            Ok(())
        })?;
        self.inner.move_to(id, UploadState::Queued)
    }

    /// Cancel a draft in any non-terminal state. A running upload stops its
    /// operations (most dependent first) and its remote node is deleted.
    pub async fn cancel(&self, id: UploadId) -> NimbusResult<()> {
        if self.request_stop(id, StopReason::Cancel) {
            tracing::info!(upload_id = %id, "cancel requested");
            return Ok(());
        }
        let verification = self.inner.verifying.lock().get(&id).cloned();
        if let Some(token) = verification {
            token.cancel();
        }
        self.inner.move_to(id, UploadState::Canceled)?;
        self.inner.clean_up_remote(id).await;
        Ok(())
    }

    /// Stop every running upload as interrupted, e.g. before the process
    /// is suspended.
    pub fn interrupt_all(&self) -> usize {
        let ids: Vec<UploadId> = self.inner.running.lock().keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.request_stop(*id, StopReason::Interrupt))
            .count()
    }

    /// Requeue and start everything a previous run left unfinished: paused
    /// and interrupted drafts, drafts caught mid-pipeline, and pending
    /// verifications.
    pub fn restart_interrupted(&self) -> Vec<UploadHandle> {
        let inner = &self.inner;
        let in_progress = [
            UploadState::CreatingContent,
            UploadState::UploadingBlocks,
            UploadState::CommittingRevision,
        ];
        for id in inner.store.ids_in_states(&in_progress) {
            if !self.is_running(id) {
                tracing::info!(upload_id = %id, "recovering orphaned draft");
                if let Err(e) = inner.move_to(id, UploadState::Interrupted) {
                    tracing::warn!(upload_id = %id, error = %e, "could not recover draft");
                }
            }
        }

        for id in inner.store.ids_in_states(&[UploadState::Verifying]) {
            if inner.verifying.lock().contains_key(&id) {
                continue;
            }
            match inner.store.get(id).and_then(|d| d.identifier()) {
                Some(identifier) => inner.spawn_verification(id, identifier),
                None => {
                    let _ = inner.move_to(id, UploadState::Done);
                }
            }
        }

        let mut handles = Vec::new();
        for id in inner
            .store
            .ids_in_states(&[UploadState::Paused, UploadState::Interrupted])
        {
            match self.requeue(id).and_then(|_| self.upload(id)) {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::warn!(upload_id = %id, error = %e, "could not restart draft"),
            }
        }
        tracing::info!(restarted = handles.len(), "interrupted uploads restarted");
        handles
    }

    /// Wait for every background verification started so far.
    pub async fn wait_for_verifications(&self) {
        let tracker = &self.inner.verifications;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }
}

impl Inner {
    /// Transition with an event; no-op when already there.
    fn move_to(&self, id: UploadId, next: UploadState) -> NimbusResult<()> {
        let from = self.store.transition(id, next)?;
        if from != next {
            tracing::debug!(upload_id = %id, %from, to = %next, "draft state changed");
            self.events.emit(UploadEvent::StateChanged {
                upload_id: id,
                from,
                to: next,
            });
        }
        Ok(())
    }

    fn context(&self, id: UploadId, progress: Arc<UploadProgress>) -> Arc<UploadContext> {
        Arc::new(UploadContext::new(
            id,
            self.store.clone(),
            self.cloud.clone(),
            self.keys.clone(),
            self.xattrs.clone(),
            self.signer.clone(),
            self.planner,
            self.events.clone(),
            progress,
            self.policy,
            self.timeouts,
        ))
    }

    async fn attempt(
        &self,
        id: UploadId,
        progress: Arc<UploadProgress>,
        cancel: CancellationToken,
    ) -> NimbusResult<PipelineOutcome> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NimbusError::Canceled),
            permit = self.slots.clone().acquire_owned() => permit
                .map_err(|_| NimbusError::local_state("upload slots closed"))?,
        };
        if self.breaker.is_open() {
            tracing::info!(upload_id = %id, "waiting for server outage cooldown");
        }
        self.breaker.wait_closed(&cancel).await?;

        tracing::info!(upload_id = %id, "upload started");
        let ctx = self.context(id, progress);
        run_pipeline(ctx, self.config.max_concurrent_blocks, cancel).await
    }

    /// Settle the draft after an attempt and produce the caller's result.
    async fn finish(
        self: &Arc<Self>,
        id: UploadId,
        result: NimbusResult<PipelineOutcome>,
    ) -> NimbusResult<UploadOutcome> {
        let stop = self.running.lock().remove(&id).and_then(|r| r.stop);
        match (result, stop) {
            (Ok(outcome), _) => self.completed(id, outcome),
            (Err(_), Some(reason)) => {
                let next = reason.state();
                self.move_to(id, next)?;
                tracing::info!(upload_id = %id, state = %next, "upload stopped");
                if reason == StopReason::Cancel {
                    self.clean_up_remote(id).await;
                }
                Ok(UploadOutcome::Stopped(next))
            }
            (Err(e), None) => {
                self.failed(id, &e);
                Err(e)
            }
        }
    }

    fn completed(self: &Arc<Self>, id: UploadId, outcome: PipelineOutcome) -> NimbusResult<UploadOutcome> {
        let (identifier, verify, fast_path) = match outcome {
            PipelineOutcome::FastPath { identifier } => (identifier, false, true),
            PipelineOutcome::Committed {
                identifier,
                verification_pending,
            } => (identifier, verification_pending && self.config.verify_uploads, false),
        };
        self.events.emit(UploadEvent::Committed {
            upload_id: id,
            identifier: identifier.clone(),
            fast_path,
        });
        if verify {
            self.move_to(id, UploadState::Verifying)?;
            self.spawn_verification(id, identifier.clone());
        } else {
            self.move_to(id, UploadState::Done)?;
        }
        tracing::info!(upload_id = %id, revision_id = %identifier.revision_id, fast_path, "upload finished");
        Ok(UploadOutcome::Completed {
            identifier,
            verifying: verify,
            fast_path,
        })
    }

    /// Network failures that outlived their retries interrupt the draft;
    /// everything else fails it.
    fn failed(&self, id: UploadId, error: &NimbusError) {
        let next = if error.kind() == ErrorKind::Network {
            if error.is_server_outage() {
                self.breaker.trip();
            }
            UploadState::Interrupted
        } else {
            UploadState::Failed
        };
        tracing::error!(upload_id = %id, state = %next, error = %error, "upload failed");

        let recorded = self.store.update_draft(id, |d| {
            d.last_error = Some(error.to_string());
            Ok(d.state)
        });
        let state = match recorded {
            Ok(state) if state.can_transition_to(next) => match self.move_to(id, next) {
                Ok(()) => next,
                Err(e) => {
                    tracing::warn!(upload_id = %id, error = %e, "could not record failure state");
                    state
                }
            },
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(upload_id = %id, error = %e, "could not record failure");
                return;
            }
        };
        self.events.emit(UploadEvent::Failed {
            upload_id: id,
            state,
            error: error.to_string(),
            user_message: error.user_message(),
        });
    }

    /// Best-effort removal of a remote node that never became active.
    async fn clean_up_remote(&self, id: UploadId) {
        let Some(draft) = self.store.get(id) else {
            return;
        };
        let Some(node_id) = draft.file.node_id else {
            return;
        };
        if draft.revision.state == RevisionState::Active {
            return;
        }
        let deleted = with_timeout(
            self.timeouts.request,
            "delete uploading file",
            self.cloud.cleaner.delete_uploading_file(&draft.file.share_id, &node_id),
        )
        .await;
        match deleted {
            Ok(()) => tracing::info!(upload_id = %id, node_id = %node_id, "remote draft removed"),
            Err(e) => tracing::warn!(upload_id = %id, node_id = %node_id, error = %e, "remote cleanup failed"),
        }
    }

    fn spawn_verification(self: &Arc<Self>, id: UploadId, identifier: UploadingFileIdentifier) {
        let cancel = CancellationToken::new();
        self.verifying.lock().insert(id, cancel.clone());
        let inner = self.clone();
        self.verifications.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(upload_id = %id, "verification canceled");
                }
                _ = inner.verify(id, &identifier, &cancel) => {}
            }
            inner.verifying.lock().remove(&id);
        });
    }

    /// One verification attempt. Its outcome is reported, never rolled back
    /// into the draft: the draft is done either way.
    async fn verify(&self, id: UploadId, identifier: &UploadingFileIdentifier, cancel: &CancellationToken) {
        tracing::info!(upload_id = %id, revision_id = %identifier.revision_id, "verification started");
        let verifier = UploadVerifier::new(VerificationInfoRepository::new(
            self.store.clone(),
            self.cloud.verification.clone(),
            self.keys.clone(),
            self.signer.clone(),
            self.timeouts,
        ));

        let failure = match verifier.verify_all(identifier).await {
            Ok(report) if report.is_complete() => {
                let committer = self.cloud.committer.clone();
                let timeout = self.timeouts.request;
                let tokens = report.tokens;
                let confirmed = with_retry(self.policy, cancel, "confirm verification", || {
                    with_timeout(timeout, "confirm verification", committer.confirm_verification(identifier, &tokens))
                })
                .await;
                match confirmed {
                    Ok(()) => {
                        tracing::info!(upload_id = %id, blocks = tokens.len(), "upload verified");
                        self.events.emit(UploadEvent::Verified {
                            upload_id: id,
                            identifier: identifier.clone(),
                            blocks: tokens.len(),
                        });
                        None
                    }
                    Err(e) => Some((Vec::new(), e.to_string())),
                }
            }
            Ok(report) => {
                let failed = report.failed_indices();
                let error = report
                    .failures
                    .first()
                    .map(|(_, e)| e.to_string())
                    .unwrap_or_default();
                Some((failed, error))
            }
            Err(e) => Some((Vec::new(), e.to_string())),
        };

        if let Some((failed_blocks, error)) = failure {
            tracing::error!(upload_id = %id, ?failed_blocks, error = %error, "verification failed");
            self.events.emit(UploadEvent::VerificationFailed {
                upload_id: id,
                identifier: identifier.clone(),
                failed_blocks,
                error,
            });
        }
        if let Err(e) = self.move_to(id, UploadState::Done) {
            tracing::warn!(upload_id = %id, error = %e, "could not finish verified draft");
        }
    }
}
