//! Turns local files into queued drafts, persisted in fixed-size batches.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_chunks::{source_len, BlockPlanner};
use nimbus_core::types::{
    BlockRecord, FileDraft, FileRecord, NodeId, RevisionRecord, RevisionState, ShareId,
    ThumbnailRecord, UploadId, UploadSource, UploadState,
};
use nimbus_core::{NimbusError, NimbusResult, ValidationError};
use nimbus_crypto::{EncryptionResource, SignersKit};

use crate::operations::blocking;
use crate::store::DraftStore;

const MAX_NAME_BYTES: usize = 255;

#[derive(Debug, Clone)]
pub struct LocalFile {
    pub source: UploadSource,
    pub name: String,
    pub mime_type: String,
    pub modification_time: DateTime<Utc>,
    pub thumbnail: Option<Vec<u8>>,
}

/// A draft ready to persist, with its planned blocks.
#[derive(Debug, Clone)]
pub struct NewDraft {
    pub draft: FileDraft,
    pub blocks: Vec<BlockRecord>,
}

/// Persists one batch of drafts. Results line up with the input.
#[async_trait]
pub trait DraftImportStorage: Send + Sync {
    async fn persist_batch(&self, batch: Vec<NewDraft>) -> Vec<NimbusResult<UploadId>>;
}

#[async_trait]
impl DraftImportStorage for DraftStore {
    async fn persist_batch(&self, batch: Vec<NewDraft>) -> Vec<NimbusResult<UploadId>> {
        batch
            .into_iter()
            .map(|new| self.insert(new.draft, new.blocks))
            .collect()
    }
}

#[derive(Debug)]
pub struct ImportFailure {
    pub name: String,
    pub error: NimbusError,
}

#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub succeeded: Vec<UploadId>,
    pub failed: Vec<ImportFailure>,
}

pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\0')
        || name.len() > MAX_NAME_BYTES
        || name == "."
        || name == ".."
    {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub struct SegmentedFileDraftImporter {
    storage: Arc<dyn DraftImportStorage>,
    resource: Arc<dyn EncryptionResource>,
    planner: BlockPlanner,
    batch_size: usize,
    client_uid: String,
}

impl SegmentedFileDraftImporter {
    pub fn new(
        storage: Arc<dyn DraftImportStorage>,
        resource: Arc<dyn EncryptionResource>,
        planner: BlockPlanner,
        batch_size: usize,
        client_uid: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            resource,
            planner,
            batch_size: batch_size.max(1),
            client_uid: client_uid.into(),
        }
    }

    async fn prepare(
        &self,
        file: LocalFile,
        share: &ShareId,
        parent: &NodeId,
        signer: &SignersKit,
    ) -> NimbusResult<NewDraft> {
        validate_name(&file.name)?;
        let size = source_len(&file.source).map_err(|e| NimbusError::local_state(format!("{e:#}")))?;

        let blocks = self
            .planner
            .plan(size)
            .map_err(|e| NimbusError::local_state(format!("{}: {e:#}", file.name)))?
            .into_iter()
            .enumerate()
            .map(|(i, len)| BlockRecord::planned(i as u32, len))
            .collect();

        let resource = self.resource.clone();
        let kit = signer.clone();
        let material = blocking(move || Ok(resource.generate_node_key(&kit)?)).await?;

        let draft = FileDraft {
            upload_id: UploadId::new(),
            file: FileRecord {
                node_id: None,
                share_id: share.clone(),
                parent_id: parent.clone(),
                name: file.name,
                mime_type: file.mime_type,
                client_uid: self.client_uid.clone(),
                signature_email: signer.email.clone(),
                node_key: material.locked_key,
                node_passphrase: material.encrypted_passphrase,
                node_passphrase_signature: material.passphrase_signature,
                content_key_packet: None,
                content_key_packet_signature: None,
            },
            revision: RevisionRecord {
                id: None,
                state: RevisionState::Draft,
                size,
                modification_time: file.modification_time,
                content_digest: None,
                xattr: None,
                thumbnail: file.thumbnail.map(ThumbnailRecord::new),
            },
            source: file.source,
            state: UploadState::Queued,
            last_error: None,
        };
        Ok(NewDraft { draft, blocks })
    }

    /// Import `files` into `parent`, signed by `signer`. Per-file failures
    /// are collected; later batches still run.
    pub async fn import(
        &self,
        files: Vec<LocalFile>,
        share: &ShareId,
        parent: &NodeId,
        signer: &SignersKit,
    ) -> NimbusResult<ImportOutcome> {
        if files.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }
        let total = files.len();
        let mut outcome = ImportOutcome::default();
        let mut files = files.into_iter().peekable();
        let mut batch_no = 0;

        while files.peek().is_some() {
            batch_no += 1;
            let mut ready = Vec::with_capacity(self.batch_size);
            let mut names = Vec::with_capacity(self.batch_size);
            for file in files.by_ref().take(self.batch_size) {
                let name = file.name.clone();
                match self.prepare(file, share, parent, signer).await {
                    Ok(new) => {
                        names.push(name);
                        ready.push(new);
                    }
                    Err(error) => {
                        tracing::warn!(name = %name, error = %error, "file rejected at import");
                        outcome.failed.push(ImportFailure { name, error });
                    }
                }
            }
            if ready.is_empty() {
                continue;
            }

            let persisted = self.storage.persist_batch(ready).await;
            tracing::debug!(batch = batch_no, drafts = persisted.len(), "draft batch persisted");
            for (name, result) in names.into_iter().zip(persisted) {
                match result {
                    Ok(id) => outcome.succeeded.push(id),
                    Err(error) => outcome.failed.push(ImportFailure { name, error }),
                }
            }
        }

        tracing::info!(
            files = total,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "import finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        assert!(validate_name("report.pdf").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("nul\0byte").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(&"x".repeat(255)).is_ok());
        assert!(validate_name(&"x".repeat(256)).is_err());
    }
}
