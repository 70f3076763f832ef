//! Content block envelope
//!
//! Encrypted block format (binary):
//! ```text
//! [4 bytes: "NBK1"][4 bytes: block index, big-endian][24 bytes: nonce][N bytes: ciphertext][16 bytes: tag]
//! AAD = "NBK1" || index
//! ```
//!
//! The prefix is stripped before decryption; the AAD binds each block to its
//! position, so a server returning block 2's bytes for block 3 fails to open.

use crate::error::CryptoError;
use crate::keys::{open, seal, SessionKey};
use crate::{NONCE_SIZE, TAG_SIZE};

pub const BLOCK_MAGIC: &[u8; 4] = b"NBK1";
pub const PREFIX_SIZE: usize = 8;

/// Ciphertext of one block plus the hash the server checks it against.
#[derive(Debug, Clone)]
pub struct EncryptedBlock {
    pub data: Vec<u8>,
    pub sha256: [u8; 32],
}

fn prefix(index: u32) -> [u8; PREFIX_SIZE] {
    let mut p = [0u8; PREFIX_SIZE];
    p[..4].copy_from_slice(BLOCK_MAGIC);
    p[4..].copy_from_slice(&index.to_be_bytes());
    p
}

pub fn encrypt_block(key: &SessionKey, index: u32, plaintext: &[u8]) -> Result<EncryptedBlock, CryptoError> {
    let header = prefix(index);
    let sealed = seal(key.as_bytes(), plaintext, &header)?;

    let mut data = Vec::with_capacity(PREFIX_SIZE + sealed.len());
    data.extend_from_slice(&header);
    data.extend_from_slice(&sealed);
    let sha256 = nimbus_chunks::sha256(&data);
    Ok(EncryptedBlock { data, sha256 })
}

/// Validate and remove the envelope prefix, returning the sealed payload.
pub fn strip_block_prefix(data: &[u8], index: u32) -> Result<&[u8], CryptoError> {
    if data.len() < PREFIX_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Decrypt(format!(
            "block {index} too short: {} bytes",
            data.len()
        )));
    }
    let (head, rest) = data.split_at(PREFIX_SIZE);
    if &head[..4] != BLOCK_MAGIC {
        return Err(CryptoError::Decrypt(format!("block {index} has unknown envelope")));
    }
    let stored = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
    if stored != index {
        return Err(CryptoError::Decrypt(format!(
            "block envelope says index {stored}, expected {index}"
        )));
    }
    Ok(rest)
}

pub fn decrypt_block(key: &SessionKey, index: u32, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sealed = strip_block_prefix(data, index)?;
    open(key.as_bytes(), sealed, &prefix(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_session_key, ContentKey};
    use proptest::prelude::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let content = ContentKey::generate();
        let key = derive_session_key(&content, 3).unwrap();
        let block = encrypt_block(&key, 3, b"hello, encrypted world!").unwrap();

        assert_eq!(&block.data[..4], BLOCK_MAGIC);
        assert_eq!(block.sha256, nimbus_chunks::sha256(&block.data));
        assert_eq!(decrypt_block(&key, 3, &block.data).unwrap(), b"hello, encrypted world!");
    }

    #[test]
    fn test_wrong_index_rejected() {
        let key = SessionKey::generate();
        let block = encrypt_block(&key, 1, b"data").unwrap();
        assert!(decrypt_block(&key, 2, &block.data).is_err());
    }

    #[test]
    fn test_tampered_index_fails_auth() {
        let key = SessionKey::generate();
        let mut data = encrypt_block(&key, 1, b"data").unwrap().data;
        data[7] = 2;
        assert!(decrypt_block(&key, 2, &data).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let block = encrypt_block(&SessionKey::generate(), 0, b"data").unwrap();
        assert!(decrypt_block(&SessionKey::generate(), 0, &block.data).is_err());
    }

    #[test]
    fn test_empty_block() {
        let key = SessionKey::generate();
        let block = encrypt_block(&key, 0, b"").unwrap();
        assert_eq!(block.data.len(), PREFIX_SIZE + NONCE_SIZE + TAG_SIZE);
        assert!(decrypt_block(&key, 0, &block.data).unwrap().is_empty());
    }

    #[test]
    fn test_nonces_differ() {
        let key = SessionKey::generate();
        let a = encrypt_block(&key, 0, b"same").unwrap();
        let b = encrypt_block(&key, 0, b"same").unwrap();
        assert_ne!(a.data, b.data, "encryption must not be deterministic");
    }

    proptest! {
        #[test]
        fn block_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..=8192), index in 0u32..1000) {
            let key = SessionKey::generate();
            let block = encrypt_block(&key, index, &data).unwrap();
            prop_assert_eq!(decrypt_block(&key, index, &block.data).unwrap(), data);
        }
    }
}
