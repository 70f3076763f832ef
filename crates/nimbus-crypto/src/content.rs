//! Content-key scheme for one node: one content key per revision, every
//! block key derived from it, so verification needs a single key fetch.

use std::sync::Arc;

use nimbus_core::types::FileRecord;

use crate::error::CryptoError;
use crate::keys::{derive_session_key, derive_thumbnail_key, ContentKey, NodeKey, SessionKey};
use crate::resource::{EncryptionResource, RevisionContentKeys, SignersKit};

#[derive(Clone)]
pub struct ContentKeyResource {
    resource: Arc<dyn EncryptionResource>,
}

impl ContentKeyResource {
    pub fn new(resource: Arc<dyn EncryptionResource>) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &Arc<dyn EncryptionResource> {
        &self.resource
    }

    /// Decrypt the node passphrase with the signer's address key, then
    /// unlock the node key with it.
    pub fn unlock_node_key(&self, file: &FileRecord, signer: &SignersKit) -> Result<NodeKey, CryptoError> {
        let passphrase = self.resource.decrypt_node_passphrase(
            &file.node_passphrase,
            &file.node_passphrase_signature,
            &signer.address_key,
        )?;
        self.resource.unlock_node_key(&file.node_key, &passphrase)
    }

    /// Fresh content key for a new revision. Fails with a key derivation
    /// error when the node key cannot be unlocked.
    pub fn generate_content_keys(
        &self,
        file: &FileRecord,
        signer: &SignersKit,
    ) -> Result<(NodeKey, RevisionContentKeys), CryptoError> {
        let node_key = self
            .unlock_node_key(file, signer)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let keys = self.resource.generate_content_keys(&node_key)?;
        Ok((node_key, keys))
    }

    pub fn decrypt_content_key(&self, packet: &[u8], node_key: &NodeKey) -> Result<ContentKey, CryptoError> {
        self.resource.decrypt_content_key_packet(packet, node_key)
    }

    pub fn session_key(&self, content_key: &ContentKey, index: u32) -> Result<SessionKey, CryptoError> {
        derive_session_key(content_key, index)
    }

    pub fn thumbnail_key(&self, content_key: &ContentKey) -> Result<SessionKey, CryptoError> {
        derive_thumbnail_key(content_key)
    }
}

impl std::fmt::Debug for ContentKeyResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKeyResource").finish_non_exhaustive()
    }
}
