//! Extended attributes: signed, encrypted revision metadata
//!
//! Cleartext layout (JSON):
//! ```text
//! {"Common": {"ModificationTime": "2024-05-01T10:00:00Z", "Size": 10000000,
//!             "BlockSizes": [4194304, 4194304, 1611392], "Digests": {"SHA1": "…"}}}
//! ```

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::{DateTime, Utc};
use nimbus_chunks::BlockPlanner;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::keys::{AddressKey, NodeKey};
use crate::resource::{EncryptionResource, SignersKit};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtendedAttributes {
    pub common: CommonAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonAttributes {
    pub modification_time: DateTime<Utc>,
    pub size: u64,
    pub block_sizes: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digests: Option<Digests>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    #[serde(rename = "SHA1")]
    pub sha1: String,
}

impl ExtendedAttributes {
    /// Build the attribute set for a file. Block sizes come from the same
    /// planner the block operations slice with.
    pub fn new(
        planner: &BlockPlanner,
        size: u64,
        modification_time: DateTime<Utc>,
        sha1: Option<String>,
    ) -> Result<Self, CryptoError> {
        let block_sizes = planner
            .plan(size)
            .map_err(|e| CryptoError::Encrypt(format!("xattr block sizes: {e:#}")))?;
        Ok(Self {
            common: CommonAttributes {
                modification_time: truncate_to_seconds(modification_time),
                size,
                block_sizes,
                digests: sha1.map(|sha1| Digests { sha1 }),
            },
        })
    }
}

/// Extended attributes carry second precision.
pub fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

#[derive(Clone)]
pub struct ExtendedAttributesCreator {
    resource: Arc<dyn EncryptionResource>,
    planner: BlockPlanner,
}

impl ExtendedAttributesCreator {
    pub fn new(resource: Arc<dyn EncryptionResource>, planner: BlockPlanner) -> Self {
        Self { resource, planner }
    }

    /// Encrypt to the node key and sign with the signer. Returns base64.
    pub fn create(
        &self,
        size: u64,
        modification_time: DateTime<Utc>,
        sha1: Option<String>,
        node_key: &NodeKey,
        signer: &SignersKit,
    ) -> Result<String, CryptoError> {
        let attrs = ExtendedAttributes::new(&self.planner, size, modification_time, sha1)?;
        self.encrypt(&attrs, node_key, &signer.address_key)
    }

    pub fn encrypt(
        &self,
        attrs: &ExtendedAttributes,
        node_key: &NodeKey,
        signer: &AddressKey,
    ) -> Result<String, CryptoError> {
        let json = serde_json::to_vec(attrs)
            .map_err(|e| CryptoError::Encrypt(format!("xattr serialization: {e}")))?;
        let sealed = self.resource.encrypt_and_sign(&json, node_key, signer)?;
        Ok(B64.encode(sealed))
    }

    pub fn decrypt(
        &self,
        blob: &str,
        node_key: &NodeKey,
        verifier: &AddressKey,
    ) -> Result<ExtendedAttributes, CryptoError> {
        let sealed = B64
            .decode(blob)
            .map_err(|e| CryptoError::Decrypt(format!("xattr base64 decode: {e}")))?;
        let json = self.resource.decrypt_and_verify(&sealed, node_key, verifier)?;
        serde_json::from_slice(&json)
            .map_err(|e| CryptoError::Decrypt(format!("xattr deserialization: {e}")))
    }
}
