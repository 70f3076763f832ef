//! The encryption capability the upload pipeline is written against.
//!
//! `EncryptionResource` is synchronous and CPU-bound; callers run it on
//! blocking threads. `LocalEncryptionResource` is a self-contained
//! implementation over XChaCha20-Poly1305, Argon2id and keyed BLAKE3.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::kdf::{derive_passphrase_key, random_salt, split_salt, KdfParams};
use crate::keys::{open, random_key, seal, unwrap_key, wrap_key, AddressKey, ContentKey, NodeKey};
use crate::KEY_SIZE;

const SIGNATURE_SIZE: usize = 32;

/// Identity that signs everything a draft produces.
#[derive(Debug, Clone)]
pub struct SignersKit {
    pub address_id: String,
    pub email: String,
    pub address_key: AddressKey,
}

/// Freshly generated key material for a new node, in its stored form.
#[derive(Debug, Clone)]
pub struct NodeKeyMaterial {
    /// Node key locked with its passphrase (base64)
    pub locked_key: String,
    /// Passphrase encrypted to the signer's address key (base64)
    pub encrypted_passphrase: String,
    pub passphrase_signature: String,
}

#[derive(Debug, Clone)]
pub struct RevisionContentKeys {
    pub content_key: ContentKey,
    /// Content key wrapped by the node key
    pub key_packet: Vec<u8>,
    pub key_packet_signature: Vec<u8>,
}

pub trait EncryptionResource: Send + Sync {
    fn generate_node_key(&self, signer: &SignersKit) -> Result<NodeKeyMaterial, CryptoError>;

    fn decrypt_node_passphrase(
        &self,
        encrypted: &str,
        signature: &str,
        address_key: &AddressKey,
    ) -> Result<SecretString, CryptoError>;

    fn unlock_node_key(&self, locked: &str, passphrase: &SecretString) -> Result<NodeKey, CryptoError>;

    fn generate_content_keys(&self, node_key: &NodeKey) -> Result<RevisionContentKeys, CryptoError>;

    fn decrypt_content_key_packet(&self, packet: &[u8], node_key: &NodeKey) -> Result<ContentKey, CryptoError>;

    fn encrypt_and_sign(
        &self,
        cleartext: &[u8],
        recipient: &NodeKey,
        signer: &AddressKey,
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt_and_verify(
        &self,
        ciphertext: &[u8],
        recipient: &NodeKey,
        verifier: &AddressKey,
    ) -> Result<Vec<u8>, CryptoError>;

    fn sign(&self, data: &[u8], signer: &[u8; KEY_SIZE]) -> Result<Vec<u8>, CryptoError>;

    fn verify(&self, data: &[u8], signature: &[u8], verifier: &[u8; KEY_SIZE]) -> Result<(), CryptoError>;
}

#[derive(Debug, Clone, Default)]
pub struct LocalEncryptionResource {
    kdf: KdfParams,
}

impl LocalEncryptionResource {
    pub fn new(kdf: KdfParams) -> Self {
        Self { kdf }
    }
}

fn keyed_signature(key: &[u8; KEY_SIZE], data: &[u8]) -> blake3::Hash {
    blake3::keyed_hash(key, data)
}

fn decode_b64(s: &str, what: &str) -> Result<Vec<u8>, CryptoError> {
    B64.decode(s)
        .map_err(|e| CryptoError::MalformedKeyPacket(format!("{what}: base64 decode: {e}")))
}

impl EncryptionResource for LocalEncryptionResource {
    fn generate_node_key(&self, signer: &SignersKit) -> Result<NodeKeyMaterial, CryptoError> {
        let mut raw_passphrase = random_key();
        let passphrase = SecretString::from(B64.encode(raw_passphrase));
        raw_passphrase.zeroize();

        let node_key = NodeKey::generate();
        let salt = random_salt();
        let lock = derive_passphrase_key(&passphrase, &salt, &self.kdf)?;
        let mut locked = salt.to_vec();
        locked.extend(wrap_key(lock.as_bytes(), node_key.as_bytes())?);

        let secret = passphrase.expose_secret().as_bytes();
        let encrypted = seal(signer.address_key.as_bytes(), secret, &[])?;
        let signature = self.sign(secret, signer.address_key.as_bytes())?;

        Ok(NodeKeyMaterial {
            locked_key: B64.encode(locked),
            encrypted_passphrase: B64.encode(encrypted),
            passphrase_signature: B64.encode(signature),
        })
    }

    fn decrypt_node_passphrase(
        &self,
        encrypted: &str,
        signature: &str,
        address_key: &AddressKey,
    ) -> Result<SecretString, CryptoError> {
        let sealed = decode_b64(encrypted, "node passphrase")?;
        let signature = decode_b64(signature, "node passphrase signature")?;
        let mut plain = open(address_key.as_bytes(), &sealed, &[])
            .map_err(|e| CryptoError::Unlock(format!("node passphrase: {e}")))?;
        self.verify(&plain, &signature, address_key.as_bytes())?;
        let text = String::from_utf8(plain.clone())
            .map_err(|_| CryptoError::Unlock("node passphrase is not UTF-8".into()));
        plain.zeroize();
        Ok(SecretString::from(text?))
    }

    fn unlock_node_key(&self, locked: &str, passphrase: &SecretString) -> Result<NodeKey, CryptoError> {
        let raw = decode_b64(locked, "locked node key")?;
        let (salt, wrapped) = split_salt(&raw)?;
        let lock = derive_passphrase_key(passphrase, &salt, &self.kdf)?;
        let bytes = unwrap_key(lock.as_bytes(), wrapped)
            .map_err(|e| CryptoError::Unlock(format!("node key: {e}")))?;
        Ok(NodeKey::from_bytes(bytes))
    }

    fn generate_content_keys(&self, node_key: &NodeKey) -> Result<RevisionContentKeys, CryptoError> {
        let content_key = ContentKey::generate();
        let key_packet = wrap_key(node_key.as_bytes(), content_key.as_bytes())?;
        let key_packet_signature = self.sign(content_key.as_bytes(), node_key.as_bytes())?;
        Ok(RevisionContentKeys {
            content_key,
            key_packet,
            key_packet_signature,
        })
    }

    fn decrypt_content_key_packet(&self, packet: &[u8], node_key: &NodeKey) -> Result<ContentKey, CryptoError> {
        let bytes = unwrap_key(node_key.as_bytes(), packet).map_err(|e| match e {
            CryptoError::MalformedKeyPacket(m) => CryptoError::MalformedKeyPacket(m),
            other => CryptoError::MalformedKeyPacket(other.to_string()),
        })?;
        Ok(ContentKey::from_bytes(bytes))
    }

    fn encrypt_and_sign(
        &self,
        cleartext: &[u8],
        recipient: &NodeKey,
        signer: &AddressKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let signature = keyed_signature(signer.as_bytes(), cleartext);
        let mut payload = Vec::with_capacity(SIGNATURE_SIZE + cleartext.len());
        payload.extend_from_slice(signature.as_bytes());
        payload.extend_from_slice(cleartext);
        seal(recipient.as_bytes(), &payload, &[])
    }

    fn decrypt_and_verify(
        &self,
        ciphertext: &[u8],
        recipient: &NodeKey,
        verifier: &AddressKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = open(recipient.as_bytes(), ciphertext, &[])?;
        if payload.len() < SIGNATURE_SIZE {
            return Err(CryptoError::Signature("signed payload truncated".into()));
        }
        let (signature, cleartext) = payload.split_at(SIGNATURE_SIZE);
        self.verify(cleartext, signature, verifier.as_bytes())?;
        Ok(cleartext.to_vec())
    }

    fn sign(&self, data: &[u8], signer: &[u8; KEY_SIZE]) -> Result<Vec<u8>, CryptoError> {
        Ok(keyed_signature(signer, data).as_bytes().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8], verifier: &[u8; KEY_SIZE]) -> Result<(), CryptoError> {
        let sig: [u8; SIGNATURE_SIZE] = signature
            .try_into()
            .map_err(|_| CryptoError::Signature(format!("signature is {} bytes", signature.len())))?;
        // blake3::Hash equality is constant-time
        if keyed_signature(verifier, data) == blake3::Hash::from(sig) {
            Ok(())
        } else {
            Err(CryptoError::Signature("signature mismatch".into()))
        }
    }
}

#[cfg(test)]
pub(crate) fn test_signer() -> SignersKit {
    SignersKit {
        address_id: "addr-1".into(),
        email: "alice@example.com".into(),
        address_key: AddressKey::from_bytes([5u8; KEY_SIZE]),
    }
}

#[cfg(test)]
pub(crate) fn test_resource() -> LocalEncryptionResource {
    LocalEncryptionResource::new(crate::kdf::fast_params())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_key_unlocks_with_decrypted_passphrase() {
        let resource = test_resource();
        let signer = test_signer();
        let material = resource.generate_node_key(&signer).unwrap();

        let passphrase = resource
            .decrypt_node_passphrase(
                &material.encrypted_passphrase,
                &material.passphrase_signature,
                &signer.address_key,
            )
            .unwrap();
        resource.unlock_node_key(&material.locked_key, &passphrase).unwrap();
    }

    #[test]
    fn wrong_passphrase_fails_to_unlock() {
        let resource = test_resource();
        let material = resource.generate_node_key(&test_signer()).unwrap();
        let res = resource.unlock_node_key(&material.locked_key, &SecretString::from("nope"));
        assert!(matches!(res, Err(CryptoError::Unlock(_))));
    }

    #[test]
    fn wrong_address_key_cannot_read_passphrase() {
        let resource = test_resource();
        let material = resource.generate_node_key(&test_signer()).unwrap();
        let res = resource.decrypt_node_passphrase(
            &material.encrypted_passphrase,
            &material.passphrase_signature,
            &AddressKey::from_bytes([6u8; KEY_SIZE]),
        );
        assert!(matches!(res, Err(CryptoError::Unlock(_))));
    }

    #[test]
    fn content_key_packet_roundtrip() {
        let resource = test_resource();
        let node = NodeKey::generate();
        let keys = resource.generate_content_keys(&node).unwrap();
        let back = resource.decrypt_content_key_packet(&keys.key_packet, &node).unwrap();
        assert_eq!(back.as_bytes(), keys.content_key.as_bytes());
        resource
            .verify(keys.content_key.as_bytes(), &keys.key_packet_signature, node.as_bytes())
            .unwrap();
    }

    #[test]
    fn content_key_packet_under_other_node_is_malformed() {
        let resource = test_resource();
        let keys = resource.generate_content_keys(&NodeKey::generate()).unwrap();
        let res = resource.decrypt_content_key_packet(&keys.key_packet, &NodeKey::generate());
        assert!(matches!(res, Err(CryptoError::MalformedKeyPacket(_))));
    }

    #[test]
    fn encrypt_and_sign_detects_wrong_signer() {
        let resource = test_resource();
        let node = NodeKey::generate();
        let signer = test_signer();
        let ct = resource.encrypt_and_sign(b"meta", &node, &signer.address_key).unwrap();

        assert_eq!(
            resource.decrypt_and_verify(&ct, &node, &signer.address_key).unwrap(),
            b"meta"
        );
        let res = resource.decrypt_and_verify(&ct, &node, &AddressKey::from_bytes([1u8; KEY_SIZE]));
        assert!(matches!(res, Err(CryptoError::Signature(_))));
    }
}
