//! One pass of a draft through the upload stages, from `queued` to a
//! committed revision.

use std::sync::Arc;

use nimbus_core::types::{RevisionState, UploadState, UploadingFileIdentifier};
use nimbus_core::{NimbusError, NimbusResult};
use tokio_util::sync::CancellationToken;

use crate::graph::{OperationGraph, UploadOperation};
use crate::operations::{
    blocking, BlockUploadOperation, ContentsCreatorOperation, RevisionCommitterOperation,
    ThumbnailUploadOperation, UploadContext,
};
use crate::retry::with_timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The target file already had this content; no blocks were uploaded.
    FastPath { identifier: UploadingFileIdentifier },
    Committed {
        identifier: UploadingFileIdentifier,
        verification_pending: bool,
    },
}

impl PipelineOutcome {
    pub fn identifier(&self) -> &UploadingFileIdentifier {
        match self {
            PipelineOutcome::FastPath { identifier } | PipelineOutcome::Committed { identifier, .. } => {
                identifier
            }
        }
    }
}

/// Whole-file SHA-1 over the planned bytes, computed once and stored on the
/// revision. Every pass first checks the source still has the planned
/// length; blocks, xattrs and the digest all describe that many bytes.
async fn ensure_digest(ctx: &UploadContext) -> NimbusResult<String> {
    let draft = ctx
        .store
        .get(ctx.upload_id)
        .ok_or_else(|| NimbusError::local_state(format!("draft {} not found", ctx.upload_id)))?;
    let upload_id = ctx.upload_id;
    let size = draft.revision.size;
    let cached = draft.revision.content_digest;
    let computed = cached.is_none();
    let source = draft.source;
    let digest = blocking(move || {
        let len = nimbus_chunks::source_len(&source).map_err(|e| NimbusError::local_state(format!("{e:#}")))?;
        if len != size {
            return Err(NimbusError::local_state(format!(
                "draft {upload_id}: source is {len} bytes, {size} were planned at import"
            )));
        }
        match cached {
            Some(digest) => Ok(digest),
            None => nimbus_chunks::digest_source(&source, size)
                .map_err(|e| NimbusError::local_state(format!("{e:#}"))),
        }
    })
    .await?;
    if computed {
        ctx.store.update_draft(ctx.upload_id, |d| {
            d.revision.content_digest = Some(digest.clone());
            Ok(())
        })?;
    }
    Ok(digest)
}

/// Ask the server whether the file this draft targets (same name under the
/// same folder) already holds exactly this content. Failures only cost the
/// shortcut.
async fn find_existing(ctx: &UploadContext, sha1: &str) -> Option<UploadingFileIdentifier> {
    let draft = ctx.store.get(ctx.upload_id)?;
    let found = with_timeout(
        ctx.timeouts.request,
        "find revision by digest",
        ctx.cloud.checker.find_by_digest(
            &draft.file.share_id,
            &draft.file.parent_id,
            &draft.file.name,
            sha1,
        ),
    )
    .await;
    match found {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(upload_id = %ctx.upload_id, error = %e, "dedup lookup failed, uploading normally");
            None
        }
    }
}

fn build_graph(ctx: &Arc<UploadContext>) -> NimbusResult<OperationGraph> {
    let mut graph = OperationGraph::new();
    let contents = graph.add(Arc::new(ContentsCreatorOperation::new(ctx.clone())), &[])?;

    let mut fan_in = Vec::new();
    for block in ctx.store.blocks(ctx.upload_id)? {
        let op: Arc<dyn UploadOperation> = Arc::new(BlockUploadOperation::new(ctx.clone(), block.index));
        fan_in.push(graph.add(op, &[contents])?);
    }
    let has_thumbnail = ctx
        .store
        .get(ctx.upload_id)
        .is_some_and(|d| d.revision.thumbnail.is_some());
    if has_thumbnail {
        fan_in.push(graph.add(Arc::new(ThumbnailUploadOperation::new(ctx.clone())), &[contents])?);
    }
    if fan_in.is_empty() {
        fan_in.push(contents);
    }
    graph.add(Arc::new(RevisionCommitterOperation::new(ctx.clone())), &fan_in)?;
    Ok(graph)
}

/// Drive a queued draft to a committed revision.
///
/// Leaves the draft in the last stage it reached; the caller decides where
/// it goes next (done, verifying, paused, interrupted, failed, canceled).
pub async fn run_pipeline(
    ctx: Arc<UploadContext>,
    max_concurrent_blocks: usize,
    cancel: CancellationToken,
) -> NimbusResult<PipelineOutcome> {
    ctx.transition(UploadState::CreatingContent)?;

    let digest = ensure_digest(&ctx).await?;
    let fresh = ctx
        .store
        .get(ctx.upload_id)
        .is_some_and(|d| d.file.node_id.is_none());
    if fresh {
        if let Some(existing) = find_existing(&ctx, &digest).await {
            ctx.store.update_draft(ctx.upload_id, |d| {
                d.file.node_id = Some(existing.node_id.clone());
                d.revision.id = Some(existing.revision_id.clone());
                d.revision.state = RevisionState::Active;
                Ok(())
            })?;
            ctx.transition(UploadState::CommittingRevision)?;
            tracing::info!(
                upload_id = %ctx.upload_id,
                revision_id = %existing.revision_id,
                "content already on server, skipping block upload"
            );
            return Ok(PipelineOutcome::FastPath { identifier: existing });
        }
    }
    if cancel.is_cancelled() {
        return Err(NimbusError::Canceled);
    }

    let already: u64 = ctx
        .store
        .blocks(ctx.upload_id)?
        .iter()
        .filter(|b| b.is_uploaded)
        .map(|b| b.clear_size)
        .sum();
    if already > 0 {
        ctx.progress.advance(already);
        tracing::info!(upload_id = %ctx.upload_id, bytes = already, "resuming after uploaded blocks");
    }

    let graph = build_graph(&ctx)?;
    let (result, report) = graph.run(max_concurrent_blocks, cancel).await;
    tracing::debug!(
        upload_id = %ctx.upload_id,
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        cancelled = report.cancelled.len(),
        "operation graph finished"
    );
    result?;

    let identifier = ctx
        .store
        .get(ctx.upload_id)
        .and_then(|d| d.identifier())
        .ok_or_else(|| NimbusError::local_state(format!("draft {}: committed without identifier", ctx.upload_id)))?;
    Ok(PipelineOutcome::Committed {
        identifier,
        verification_pending: ctx.verification_pending().unwrap_or(false),
    })
}
