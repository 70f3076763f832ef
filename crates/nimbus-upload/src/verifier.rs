//! Post-commit verification: download each block as stored, prove it
//! decrypts with the revision's content key, and return a proof token.
//!
//! A verifier belongs to a single verification attempt. The verification
//! info is fetched once and shared by every block of that attempt; a new
//! attempt builds a new verifier.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use futures::future::join_all;
use nimbus_core::types::UploadingFileIdentifier;
use nimbus_core::{NimbusError, NimbusResult, VerificationError};
use nimbus_crypto::{decrypt_block, derive_block_token, BlockToken, ContentKey, ContentKeyResource, SignersKit};
use tokio::sync::OnceCell;

use crate::operations::blocking;
use crate::remote::VerificationDataSource;
use crate::retry::{with_timeout, Timeouts};
use crate::store::DraftStore;

pub struct VerificationInfo {
    pub verification_code: Vec<u8>,
    pub content_key: ContentKey,
}

impl std::fmt::Debug for VerificationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationInfo")
            .field("verification_code_len", &self.verification_code.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiableBlock {
    pub identifier: UploadingFileIdentifier,
    pub index: u32,
}

/// Resolves verification info: one remote call plus local key unlocking.
#[derive(Clone)]
pub struct VerificationInfoRepository {
    store: Arc<DraftStore>,
    source: Arc<dyn VerificationDataSource>,
    keys: ContentKeyResource,
    signer: SignersKit,
    timeouts: Timeouts,
}

impl VerificationInfoRepository {
    pub fn new(
        store: Arc<DraftStore>,
        source: Arc<dyn VerificationDataSource>,
        keys: ContentKeyResource,
        signer: SignersKit,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            store,
            source,
            keys,
            signer,
            timeouts,
        }
    }

    pub async fn fetch(&self, identifier: &UploadingFileIdentifier) -> NimbusResult<VerificationInfo> {
        let file = self
            .store
            .find_by_identifier(identifier)
            .and_then(|id| self.store.get(id))
            .map(|d| d.file)
            .ok_or(VerificationError::MissingFile)?;

        let data = with_timeout(
            self.timeouts.request,
            "fetch verification data",
            self.source.fetch_verification_data(identifier),
        )
        .await?;

        let invalid = |what: &str, e: String| VerificationError::InvalidResponse(format!("{what}: {e}"));
        let verification_code = B64
            .decode(&data.verification_code)
            .map_err(|e| invalid("verification code", e.to_string()))?;
        let packet = B64
            .decode(&data.content_key_packet)
            .map_err(|e| invalid("content key packet", e.to_string()))?;

        let keys = self.keys.clone();
        let signer = self.signer.clone();
        let content_key = blocking(move || {
            let node_key = keys.unlock_node_key(&file, &signer)?;
            keys.decrypt_content_key(&packet, &node_key).map_err(|e| {
                NimbusError::from(VerificationError::InvalidResponse(format!("content key packet: {e}")))
            })
        })
        .await?;

        tracing::debug!(revision_id = %identifier.revision_id, "verification info fetched");
        Ok(VerificationInfo {
            verification_code,
            content_key,
        })
    }
}

#[derive(Debug, Default)]
pub struct VerificationReport {
    /// Tokens for every block that verified, in index order
    pub tokens: Vec<BlockToken>,
    /// Blocks that did not verify, in index order
    pub failures: Vec<(u32, NimbusError)>,
}

impl VerificationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_indices(&self) -> Vec<u32> {
        self.failures.iter().map(|(i, _)| *i).collect()
    }
}

pub struct UploadVerifier {
    repository: VerificationInfoRepository,
    info: OnceCell<Arc<VerificationInfo>>,
}

impl UploadVerifier {
    pub fn new(repository: VerificationInfoRepository) -> Self {
        Self {
            repository,
            info: OnceCell::new(),
        }
    }

    async fn info(&self, identifier: &UploadingFileIdentifier) -> NimbusResult<Arc<VerificationInfo>> {
        self.info
            .get_or_try_init(|| async { self.repository.fetch(identifier).await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Verify one block and return its proof token.
    pub async fn verify(&self, block: &VerifiableBlock) -> NimbusResult<BlockToken> {
        let info = self.info(&block.identifier).await?;
        let repo = &self.repository;
        let index = block.index;

        let upload_id = repo
            .store
            .find_by_identifier(&block.identifier)
            .ok_or(VerificationError::MissingFile)?;
        let url = repo
            .store
            .block(upload_id, index)
            .and_then(|b| b.upload_url)
            .ok_or(VerificationError::MissingBlock(index))?;

        let data = with_timeout(
            repo.timeouts.block,
            "fetch block",
            repo.source.fetch_block(&block.identifier, index, &url),
        )
        .await?
        .ok_or(VerificationError::MissingBlockContent(index))?;

        let session_key = repo.keys.session_key(&info.content_key, index)?;
        let data = blocking(move || {
            decrypt_block(&session_key, index, &data).map_err(|e| {
                NimbusError::from(VerificationError::Undecryptable {
                    index,
                    reason: e.to_string(),
                })
            })?;
            Ok(data)
        })
        .await?;

        Ok(derive_block_token(index, &info.verification_code, &data))
    }

    /// Verify every block of the revision. A failed block never stops its
    /// siblings; only a failed initialization fails the whole pass.
    pub async fn verify_all(&self, identifier: &UploadingFileIdentifier) -> NimbusResult<VerificationReport> {
        let upload_id = self
            .repository
            .store
            .find_by_identifier(identifier)
            .ok_or(VerificationError::MissingFile)?;
        self.info(identifier).await?;

        let blocks: Vec<VerifiableBlock> = self
            .repository
            .store
            .blocks(upload_id)?
            .into_iter()
            .map(|b| VerifiableBlock {
                identifier: identifier.clone(),
                index: b.index,
            })
            .collect();

        let results = join_all(blocks.iter().map(|b| self.verify(b))).await;
        let mut report = VerificationReport::default();
        for (block, result) in blocks.iter().zip(results) {
            match result {
                Ok(token) => report.tokens.push(token),
                Err(e) => {
                    tracing::warn!(
                        revision_id = %identifier.revision_id,
                        index = block.index,
                        error = %e,
                        "block failed verification"
                    );
                    report.failures.push((block.index, e));
                }
            }
        }
        Ok(report)
    }
}
