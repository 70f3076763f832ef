//! The units of work in one draft's operation graph.
//!
//! ```text
//! ContentsCreator ─┬─► BlockUpload(0) ─┐
//!                  ├─► BlockUpload(1) ─┼─► RevisionCommitter
//!                  └─► ThumbnailUpload ─┘
//! ```
//!
//! Block and thumbnail operations only write their own rows; the committer
//! is the single writer of the revision once blocks are in flight.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use nimbus_chunks::{sha256_hex, BlockPlanner, BlockReader};
use nimbus_core::types::{
    BlockRecord, RevisionState, UploadId, UploadState, UploadingFileIdentifier,
};
use nimbus_core::{NimbusError, NimbusResult, ValidationError};
use nimbus_crypto::gcm::encrypt_standalone;
use nimbus_crypto::{
    encrypt_block, ContentKey, ContentKeyResource, ExtendedAttributesCreator, NodeKey, SignersKit,
};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, UploadEvent};
use crate::graph::UploadOperation;
use crate::progress::UploadProgress;
use crate::remote::{CloudServices, CommitOutcome, CommittedBlock, RevisionCommit, UploadLink};
use crate::retry::{with_retry, with_timeout, RetryPolicy, Timeouts};
use crate::store::DraftStore;

/// Keys unlocked by the contents operation, shared with its dependents.
pub(crate) struct RevisionSecrets {
    pub node_key: NodeKey,
    pub content_key: ContentKey,
}

/// Everything the operations of one draft share.
pub struct UploadContext {
    pub upload_id: UploadId,
    pub store: Arc<DraftStore>,
    pub cloud: CloudServices,
    pub keys: ContentKeyResource,
    pub xattrs: ExtendedAttributesCreator,
    pub signer: SignersKit,
    pub planner: BlockPlanner,
    pub events: EventBus,
    pub progress: Arc<UploadProgress>,
    pub policy: RetryPolicy,
    pub timeouts: Timeouts,
    secrets: OnceLock<RevisionSecrets>,
    verification_pending: OnceLock<bool>,
}

impl UploadContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upload_id: UploadId,
        store: Arc<DraftStore>,
        cloud: CloudServices,
        keys: ContentKeyResource,
        xattrs: ExtendedAttributesCreator,
        signer: SignersKit,
        planner: BlockPlanner,
        events: EventBus,
        progress: Arc<UploadProgress>,
        policy: RetryPolicy,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            upload_id,
            store,
            cloud,
            keys,
            xattrs,
            signer,
            planner,
            events,
            progress,
            policy,
            timeouts,
            secrets: OnceLock::new(),
            verification_pending: OnceLock::new(),
        }
    }

    /// Validated transition of this draft, announced on the event bus.
    pub fn transition(&self, next: UploadState) -> NimbusResult<()> {
        let from = self.store.transition(self.upload_id, next)?;
        if from != next {
            tracing::debug!(upload_id = %self.upload_id, %from, to = %next, "draft state changed");
            self.events.emit(UploadEvent::StateChanged {
                upload_id: self.upload_id,
                from,
                to: next,
            });
        }
        Ok(())
    }

    fn secrets(&self) -> NimbusResult<&RevisionSecrets> {
        self.secrets.get().ok_or_else(|| {
            NimbusError::local_state(format!("draft {}: content keys not unlocked", self.upload_id))
        })
    }

    /// Whether the server asked for post-commit verification. `None` until
    /// the committer has run.
    pub fn verification_pending(&self) -> Option<bool> {
        self.verification_pending.get().copied()
    }

    fn draft(&self) -> NimbusResult<nimbus_core::types::FileDraft> {
        self.store
            .get(self.upload_id)
            .ok_or_else(|| NimbusError::local_state(format!("draft {} not found", self.upload_id)))
    }
}

/// Run CPU-bound crypto off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> NimbusResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> NimbusResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NimbusError::local_state(format!("blocking task failed: {e}")))?
}

fn check_cancel(cancel: &CancellationToken) -> NimbusResult<()> {
    if cancel.is_cancelled() {
        return Err(NimbusError::Canceled);
    }
    Ok(())
}

fn decode_b64(value: &str, what: &str) -> NimbusResult<Vec<u8>> {
    B64.decode(value)
        .map_err(|e| NimbusError::local_state(format!("stored {what} is not base64: {e}")))
}

// --- contents ---------------------------------------------------------------

/// Creates (or re-opens) the remote revision and obtains upload links for
/// every block still to be uploaded.
pub struct ContentsCreatorOperation {
    ctx: Arc<UploadContext>,
}

impl ContentsCreatorOperation {
    pub fn new(ctx: Arc<UploadContext>) -> Self {
        Self { ctx }
    }

    async fn create_content(&self, cancel: &CancellationToken) -> NimbusResult<RevisionSecrets> {
        let ctx = &self.ctx;
        let draft = ctx.draft()?;
        let keys = ctx.keys.clone();
        let xattrs = ctx.xattrs.clone();
        let signer = ctx.signer.clone();
        let file = draft.file.clone();
        let size = draft.revision.size;
        let mtime = draft.revision.modification_time;
        let sha1 = draft.revision.content_digest.clone();

        let (node_key, content_keys, xattr) = blocking(move || {
            let (node_key, content_keys) = keys.generate_content_keys(&file, &signer)?;
            let xattr = xattrs.create(size, mtime, sha1, &node_key, &signer)?;
            Ok((node_key, content_keys, xattr))
        })
        .await?;

        let file = ctx.store.update_draft(ctx.upload_id, |d| {
            d.file.content_key_packet = Some(B64.encode(&content_keys.key_packet));
            d.file.content_key_packet_signature = Some(B64.encode(&content_keys.key_packet_signature));
            d.revision.xattr = Some(xattr);
            Ok(d.file.clone())
        })?;

        let creator = ctx.cloud.creator.clone();
        let timeout = ctx.timeouts.request;
        let created = with_retry(ctx.policy, cancel, "create revision", || {
            with_timeout(timeout, "create revision", creator.create_revision(&file))
        })
        .await?;

        ctx.store.update_draft(ctx.upload_id, |d| {
            d.file.node_id = Some(created.node_id.clone());
            d.revision.id = Some(created.revision_id.clone());
            Ok(())
        })?;
        tracing::info!(
            upload_id = %ctx.upload_id,
            node_id = %created.node_id,
            revision_id = %created.revision_id,
            "revision created"
        );

        Ok(RevisionSecrets {
            node_key,
            content_key: content_keys.content_key.clone(),
        })
    }

    /// Re-derive the keys of a revision created by an earlier attempt.
    async fn reopen_content(&self, packet: String) -> NimbusResult<RevisionSecrets> {
        let ctx = &self.ctx;
        let draft = ctx.draft()?;
        let keys = ctx.keys.clone();
        let signer = ctx.signer.clone();
        let packet = decode_b64(&packet, "content key packet")?;
        blocking(move || {
            let node_key = keys.unlock_node_key(&draft.file, &signer)?;
            let content_key = keys.decrypt_content_key(&packet, &node_key)?;
            Ok(RevisionSecrets {
                node_key,
                content_key,
            })
        })
        .await
    }

    async fn request_links(
        &self,
        identifier: &UploadingFileIdentifier,
        cancel: &CancellationToken,
    ) -> NimbusResult<()> {
        let ctx = &self.ctx;
        let pending: Vec<(u32, u64)> = ctx
            .store
            .blocks(ctx.upload_id)?
            .into_iter()
            .filter(|b| !b.is_uploaded)
            .map(|b| (b.index, b.clear_size))
            .collect();
        let thumbnail_size = ctx
            .draft()?
            .revision
            .thumbnail
            .filter(|t| !t.is_uploaded)
            .map(|t| t.data.len() as u64);
        if pending.is_empty() && thumbnail_size.is_none() {
            tracing::debug!(upload_id = %ctx.upload_id, "all blocks already uploaded");
            return Ok(());
        }

        let creator = ctx.cloud.creator.clone();
        let timeout = ctx.timeouts.request;
        let links = with_retry(ctx.policy, cancel, "request upload links", || {
            with_timeout(
                timeout,
                "request upload links",
                creator.request_upload_links(identifier, &pending, thumbnail_size),
            )
        })
        .await?;

        for (index, link) in links.blocks {
            ctx.store.update_block(ctx.upload_id, index, |b| {
                b.upload_url = Some(link.url.clone());
                b.upload_token = Some(link.token.clone());
                Ok(())
            })?;
        }
        if let Some(link) = links.thumbnail {
            ctx.store.update_draft(ctx.upload_id, |d| {
                if let Some(thumb) = d.revision.thumbnail.as_mut() {
                    thumb.upload_url = Some(link.url.clone());
                    thumb.upload_token = Some(link.token.clone());
                }
                Ok(())
            })?;
        }
        tracing::debug!(upload_id = %ctx.upload_id, blocks = pending.len(), "upload links stored");
        Ok(())
    }
}

#[async_trait]
impl UploadOperation for ContentsCreatorOperation {
    fn label(&self) -> String {
        format!("contents[{}]", self.ctx.upload_id)
    }

    async fn run(&self, cancel: CancellationToken) -> NimbusResult<()> {
        let ctx = &self.ctx;
        check_cancel(&cancel)?;
        tracing::info!(upload_id = %ctx.upload_id, "content creation started");

        let draft = ctx.draft()?;
        let secrets = match (draft.identifier(), draft.file.content_key_packet.clone()) {
            (Some(_), Some(packet)) => self.reopen_content(packet).await?,
            _ => self.create_content(&cancel).await?,
        };
        // A second run on the same context keeps the first secrets.
        let _ = ctx.secrets.set(secrets);

        let identifier = ctx.draft()?.identifier().ok_or_else(|| {
            NimbusError::local_state(format!("draft {}: revision was not created", ctx.upload_id))
        })?;
        check_cancel(&cancel)?;
        self.request_links(&identifier, &cancel).await?;

        ctx.store.update_draft(ctx.upload_id, |d| {
            d.revision.state = RevisionState::Uploading;
            Ok(())
        })?;
        ctx.transition(UploadState::UploadingBlocks)
    }
}

// --- blocks -----------------------------------------------------------------

struct PreparedBlock {
    data: Vec<u8>,
    sha256: String,
    clear_digest: String,
    enc_signature: String,
}

/// Read, encrypt, hash and PUT one block. Serial within the block.
pub struct BlockUploadOperation {
    ctx: Arc<UploadContext>,
    index: u32,
}

impl BlockUploadOperation {
    pub fn new(ctx: Arc<UploadContext>, index: u32) -> Self {
        Self { ctx, index }
    }

    async fn prepare(&self, block: &BlockRecord) -> NimbusResult<PreparedBlock> {
        let ctx = &self.ctx;
        let index = self.index;
        let draft = ctx.draft()?;
        let range = ctx
            .planner
            .range(draft.revision.size, index)
            .filter(|r| r.len == block.clear_size)
            .ok_or_else(|| {
                NimbusError::local_state(format!(
                    "draft {}: block {index} does not match the block plan",
                    ctx.upload_id
                ))
            })?;

        let secrets = ctx.secrets()?;
        let session_key = ctx.keys.session_key(&secrets.content_key, index)?;
        let node_key = secrets.node_key.clone();
        let address_key = ctx.signer.address_key.clone();
        let resource = ctx.keys.resource().clone();
        let source = draft.source;

        blocking(move || {
            let clear = BlockReader::new(source)
                .read(range)
                .map_err(|e| NimbusError::local_state(format!("{e:#}")))?;
            let encrypted = encrypt_block(&session_key, index, &clear)?;
            let clear_digest = sha256_hex(&clear);
            let signature = resource.encrypt_and_sign(clear_digest.as_bytes(), &node_key, &address_key)?;
            Ok(PreparedBlock {
                data: encrypted.data,
                sha256: B64.encode(encrypted.sha256),
                clear_digest,
                enc_signature: B64.encode(signature),
            })
        })
        .await
    }
}

#[async_trait]
impl UploadOperation for BlockUploadOperation {
    fn label(&self) -> String {
        format!("block[{}:{}]", self.ctx.upload_id, self.index)
    }

    async fn run(&self, cancel: CancellationToken) -> NimbusResult<()> {
        let ctx = &self.ctx;
        let index = self.index;
        let block = ctx.store.block(ctx.upload_id, index).ok_or_else(|| {
            NimbusError::local_state(format!("draft {}: block {index} not found", ctx.upload_id))
        })?;
        if block.is_uploaded {
            tracing::debug!(upload_id = %ctx.upload_id, index, "block already uploaded, skipping");
            return Ok(());
        }
        check_cancel(&cancel)?;

        let link = match (&block.upload_url, &block.upload_token) {
            (Some(url), Some(token)) => UploadLink {
                url: url.clone(),
                token: token.clone(),
            },
            _ => {
                return Err(NimbusError::local_state(format!(
                    "draft {}: block {index} has no upload link",
                    ctx.upload_id
                )))
            }
        };

        let prepared = self.prepare(&block).await?;
        check_cancel(&cancel)?;

        let uploader = ctx.cloud.blocks.clone();
        let timeout = ctx.timeouts.block;
        with_retry(ctx.policy, &cancel, "block upload", || {
            with_timeout(
                timeout,
                "block upload",
                uploader.put_block(&link, prepared.data.clone(), &prepared.sha256),
            )
        })
        .await?;

        ctx.store.update_block(ctx.upload_id, index, |b| {
            b.sha256 = Some(prepared.sha256.clone());
            b.clear_digest = Some(prepared.clear_digest.clone());
            b.enc_signature = Some(prepared.enc_signature.clone());
            b.is_uploaded = true;
            Ok(())
        })?;
        tracing::debug!(upload_id = %ctx.upload_id, index, bytes = block.clear_size, "block uploaded");

        if let Some(completed) = ctx.progress.advance(block.clear_size) {
            ctx.events.emit(UploadEvent::Progress {
                upload_id: ctx.upload_id,
                completed_bytes: completed,
                total_bytes: ctx.progress.total(),
            });
        }
        ctx.events.emit(UploadEvent::BlockUploaded {
            upload_id: ctx.upload_id,
            index,
        });
        Ok(())
    }
}

// --- thumbnail --------------------------------------------------------------

pub struct ThumbnailUploadOperation {
    ctx: Arc<UploadContext>,
}

impl ThumbnailUploadOperation {
    pub fn new(ctx: Arc<UploadContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl UploadOperation for ThumbnailUploadOperation {
    fn label(&self) -> String {
        format!("thumbnail[{}]", self.ctx.upload_id)
    }

    async fn run(&self, cancel: CancellationToken) -> NimbusResult<()> {
        let ctx = &self.ctx;
        let Some(thumb) = ctx.draft()?.revision.thumbnail else {
            return Ok(());
        };
        if thumb.is_uploaded {
            return Ok(());
        }
        check_cancel(&cancel)?;
        let (Some(url), Some(token)) = (thumb.upload_url, thumb.upload_token) else {
            return Err(NimbusError::local_state(format!(
                "draft {}: thumbnail has no upload link",
                ctx.upload_id
            )));
        };
        let link = UploadLink { url, token };

        let key = ctx.keys.thumbnail_key(&ctx.secrets()?.content_key)?;
        let data = thumb.data;
        let (encrypted, sha256) = blocking(move || {
            let encrypted = encrypt_standalone(&key, &data)?;
            let sha256 = B64.encode(nimbus_chunks::sha256(&encrypted));
            Ok((encrypted, sha256))
        })
        .await?;
        check_cancel(&cancel)?;

        let uploader = ctx.cloud.blocks.clone();
        let timeout = ctx.timeouts.block;
        with_retry(ctx.policy, &cancel, "thumbnail upload", || {
            with_timeout(timeout, "thumbnail upload", uploader.put_block(&link, encrypted.clone(), &sha256))
        })
        .await?;

        ctx.store.update_draft(ctx.upload_id, |d| {
            if let Some(t) = d.revision.thumbnail.as_mut() {
                t.sha256 = Some(sha256.clone());
                t.is_uploaded = true;
            }
            Ok(())
        })?;
        tracing::debug!(upload_id = %ctx.upload_id, "thumbnail uploaded");
        Ok(())
    }
}

// --- commit -----------------------------------------------------------------

/// Refuse to commit anything that disagrees with the block plan.
fn check_against_plan(
    upload_id: UploadId,
    size: u64,
    plan: &[u64],
    blocks: &[BlockRecord],
) -> NimbusResult<()> {
    let fail = |what: String| Err(NimbusError::local_state(format!("draft {upload_id}: {what}")));
    if blocks.len() != plan.len() {
        return fail(format!("{} blocks recorded, plan has {}", blocks.len(), plan.len()));
    }
    for (i, (block, planned)) in blocks.iter().zip(plan).enumerate() {
        if block.index as usize != i {
            return fail(format!("block {} recorded at position {i}", block.index));
        }
        if block.clear_size != *planned {
            return fail(format!(
                "block {i} is {} bytes, plan says {planned}",
                block.clear_size
            ));
        }
        if size > 0 && block.clear_size == 0 {
            return fail(format!("block {i} is empty in a non-empty file"));
        }
        if !block.is_uploaded || block.sha256.is_none() || block.enc_signature.is_none() {
            return fail(format!("block {i} is not uploaded"));
        }
    }
    Ok(())
}

/// Commits the revision once every block (and the thumbnail) has landed.
pub struct RevisionCommitterOperation {
    ctx: Arc<UploadContext>,
}

impl RevisionCommitterOperation {
    pub fn new(ctx: Arc<UploadContext>) -> Self {
        Self { ctx }
    }

    fn build_commit(&self) -> NimbusResult<(UploadingFileIdentifier, RevisionCommit)> {
        let ctx = &self.ctx;
        let draft = ctx.draft()?;
        let identifier = draft.identifier().ok_or_else(|| {
            NimbusError::local_state(format!("draft {}: no remote revision to commit", ctx.upload_id))
        })?;
        let blocks = ctx.store.blocks(ctx.upload_id)?;
        let plan = ctx
            .planner
            .plan(draft.revision.size)
            .map_err(|e| NimbusError::local_state(format!("draft {}: {e:#}", ctx.upload_id)))?;
        check_against_plan(ctx.upload_id, draft.revision.size, &plan, &blocks)?;

        let thumbnail_sha256 = match &draft.revision.thumbnail {
            Some(t) => match (&t.sha256, t.is_uploaded) {
                (Some(sha), true) => Some(sha.clone()),
                _ => {
                    return Err(NimbusError::local_state(format!(
                        "draft {}: thumbnail is not uploaded",
                        ctx.upload_id
                    )))
                }
            },
            None => None,
        };

        let mut manifest = Vec::with_capacity(32 * (blocks.len() + 1));
        if let Some(sha) = &thumbnail_sha256 {
            manifest.extend(decode_b64(sha, "thumbnail hash")?);
        }
        let mut committed = Vec::with_capacity(blocks.len());
        for b in blocks {
            let (Some(sha256), Some(enc_signature)) = (b.sha256, b.enc_signature) else {
                return Err(NimbusError::local_state("block hash missing after plan check"));
            };
            manifest.extend(decode_b64(&sha256, "block hash")?);
            committed.push(CommittedBlock {
                index: b.index,
                size: b.clear_size,
                sha256,
                enc_signature,
            });
        }
        let signature = ctx
            .keys
            .resource()
            .sign(&manifest, ctx.signer.address_key.as_bytes())?;

        let xattr = draft.revision.xattr.clone().ok_or_else(|| {
            NimbusError::local_state(format!("draft {}: extended attributes missing", ctx.upload_id))
        })?;

        Ok((
            identifier,
            RevisionCommit {
                blocks: committed,
                thumbnail_sha256,
                manifest_signature: B64.encode(signature),
                signature_email: draft.file.signature_email,
                xattr,
                content_digest: draft.revision.content_digest,
            },
        ))
    }

    /// A retried commit may find its revision already active. That only
    /// counts as success when the active revision of the draft's own node
    /// decrypts with this draft's keys and carries its digest and block
    /// layout.
    async fn confirm_existing(
        &self,
        identifier: &UploadingFileIdentifier,
        commit: &RevisionCommit,
    ) -> NimbusResult<()> {
        let ctx = &self.ctx;
        let conflict = |what: String| -> NimbusError {
            ValidationError::ConflictingRevision(format!("{}: {what}", identifier.revision_id)).into()
        };

        let remote = with_timeout(
            ctx.timeouts.request,
            "check uploaded revision",
            ctx.cloud.checker.check_uploaded_revision(identifier),
        )
        .await?;
        let Some(xattr) = remote else {
            return Err(conflict("reported as committed but not active".into()));
        };

        let draft = ctx.draft()?;
        let xattrs = ctx.xattrs.clone();
        let node_key = ctx.secrets()?.node_key.clone();
        let verifier = ctx.signer.address_key.clone();
        let attrs = blocking(move || Ok(xattrs.decrypt(&xattr, &node_key, &verifier)))
            .await?
            .map_err(|e| conflict(format!("extended attributes unreadable: {e}")))?;

        let remote_sha1 = attrs.common.digests.map(|d| d.sha1);
        if remote_sha1 != commit.content_digest {
            return Err(conflict("content digest differs".into()));
        }
        let plan = ctx
            .planner
            .plan(draft.revision.size)
            .map_err(|e| NimbusError::local_state(format!("draft {}: {e:#}", ctx.upload_id)))?;
        if attrs.common.size != draft.revision.size || attrs.common.block_sizes != plan {
            return Err(conflict("block layout differs".into()));
        }
        tracing::info!(upload_id = %ctx.upload_id, "revision was already committed");
        Ok(())
    }
}

#[async_trait]
impl UploadOperation for RevisionCommitterOperation {
    fn label(&self) -> String {
        format!("commit[{}]", self.ctx.upload_id)
    }

    async fn run(&self, cancel: CancellationToken) -> NimbusResult<()> {
        let ctx = &self.ctx;
        check_cancel(&cancel)?;
        ctx.transition(UploadState::CommittingRevision)?;
        ctx.store.update_draft(ctx.upload_id, |d| {
            d.revision.state = RevisionState::Committing;
            Ok(())
        })?;

        let (identifier, commit) = self.build_commit()?;
        check_cancel(&cancel)?;

        let committer = ctx.cloud.committer.clone();
        let timeout = ctx.timeouts.request;
        let outcome = with_retry(ctx.policy, &cancel, "commit revision", || {
            with_timeout(timeout, "commit revision", committer.commit_revision(&identifier, &commit))
        })
        .await?;

        let verification_pending = match outcome {
            CommitOutcome::Accepted {
                verification_pending,
            } => verification_pending,
            CommitOutcome::AlreadyExists => {
                self.confirm_existing(&identifier, &commit).await?;
                false
            }
        };

        ctx.store.update_draft(ctx.upload_id, |d| {
            d.revision.state = RevisionState::Active;
            Ok(())
        })?;
        let _ = ctx.verification_pending.set(verification_pending);
        tracing::info!(
            upload_id = %ctx.upload_id,
            revision_id = %identifier.revision_id,
            blocks = commit.blocks.len(),
            verification_pending,
            "revision committed"
        );
        Ok(())
    }
}
