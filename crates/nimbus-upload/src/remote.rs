//! Remote collaborators the pipeline talks to. Every call is fallible and
//! may suspend; timeouts and retries are applied by the caller.

use std::sync::Arc;

use async_trait::async_trait;
use nimbus_core::types::{FileRecord, NodeId, RevisionId, ShareId, UploadingFileIdentifier};
use nimbus_core::NimbusResult;
use nimbus_crypto::BlockToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRevision {
    pub node_id: NodeId,
    pub revision_id: RevisionId,
}

/// Server-issued, time-limited upload target for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLink {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Default)]
pub struct UploadLinks {
    /// `(index, link)` for every requested block
    pub blocks: Vec<(u32, UploadLink)>,
    pub thumbnail: Option<UploadLink>,
}

/// One block as declared in the commit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBlock {
    pub index: u32,
    pub size: u64,
    /// base64 SHA-256 of the ciphertext
    pub sha256: String,
    pub enc_signature: String,
}

#[derive(Debug, Clone)]
pub struct RevisionCommit {
    pub blocks: Vec<CommittedBlock>,
    pub thumbnail_sha256: Option<String>,
    /// Signature over the concatenated ciphertext hashes (base64)
    pub manifest_signature: String,
    pub signature_email: String,
    pub xattr: String,
    /// Whole-file SHA-1 (hex), indexed server-side for dedup
    pub content_digest: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Revision is active; the server may still ask for verification.
    Accepted { verification_pending: bool },
    /// The revision was already committed (e.g. a retried commit).
    AlreadyExists,
}

/// `GET .../revisions/{id}/verification`
#[derive(Debug, Clone)]
pub struct VerificationData {
    /// base64
    pub verification_code: String,
    /// base64 content key packet
    pub content_key_packet: String,
}

#[async_trait]
pub trait CloudContentCreator: Send + Sync {
    /// Create the node (if new) and a draft revision for it.
    async fn create_revision(&self, file: &FileRecord) -> NimbusResult<CreatedRevision>;

    async fn request_upload_links(
        &self,
        id: &UploadingFileIdentifier,
        blocks: &[(u32, u64)],
        thumbnail_size: Option<u64>,
    ) -> NimbusResult<UploadLinks>;
}

#[async_trait]
pub trait BlockUploader: Send + Sync {
    async fn put_block(&self, link: &UploadLink, data: Vec<u8>, sha256: &str) -> NimbusResult<()>;
}

#[async_trait]
pub trait UploadedRevisionChecker: Send + Sync {
    /// Active revision of the file called `name` under `parent`, if its
    /// content has this SHA-1. Other files with the same content never match.
    async fn find_by_digest(
        &self,
        share: &ShareId,
        parent: &NodeId,
        name: &str,
        sha1: &str,
    ) -> NimbusResult<Option<UploadingFileIdentifier>>;

    /// Extended attributes of `id`, or `None` while it is not the active
    /// revision of its node.
    async fn check_uploaded_revision(&self, id: &UploadingFileIdentifier) -> NimbusResult<Option<String>>;
}

#[async_trait]
pub trait CloudRevisionCommitter: Send + Sync {
    async fn commit_revision(
        &self,
        id: &UploadingFileIdentifier,
        commit: &RevisionCommit,
    ) -> NimbusResult<CommitOutcome>;

    async fn confirm_verification(
        &self,
        id: &UploadingFileIdentifier,
        tokens: &[BlockToken],
    ) -> NimbusResult<()>;
}

#[async_trait]
pub trait CloudFileCleaner: Send + Sync {
    /// Delete a node that never reached an active revision.
    async fn delete_uploading_file(&self, share: &ShareId, node: &NodeId) -> NimbusResult<()>;
}

#[async_trait]
pub trait VerificationDataSource: Send + Sync {
    async fn fetch_verification_data(
        &self,
        id: &UploadingFileIdentifier,
    ) -> NimbusResult<VerificationData>;

    /// Ciphertext of a block as stored, or `None` if the server has no content.
    async fn fetch_block(
        &self,
        id: &UploadingFileIdentifier,
        index: u32,
        url: &str,
    ) -> NimbusResult<Option<Vec<u8>>>;
}

/// The full set of remote endpoints, usually one backend behind all of them.
#[derive(Clone)]
pub struct CloudServices {
    pub creator: Arc<dyn CloudContentCreator>,
    pub blocks: Arc<dyn BlockUploader>,
    pub checker: Arc<dyn UploadedRevisionChecker>,
    pub committer: Arc<dyn CloudRevisionCommitter>,
    pub cleaner: Arc<dyn CloudFileCleaner>,
    pub verification: Arc<dyn VerificationDataSource>,
}

impl CloudServices {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: CloudContentCreator
            + BlockUploader
            + UploadedRevisionChecker
            + CloudRevisionCommitter
            + CloudFileCleaner
            + VerificationDataSource
            + 'static,
    {
        Self {
            creator: backend.clone(),
            blocks: backend.clone(),
            checker: backend.clone(),
            committer: backend.clone(),
            cleaner: backend.clone(),
            verification: backend,
        }
    }
}
