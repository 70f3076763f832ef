//! Key types, HKDF derivation, and key wrapping

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

const BLOCK_SESSION_INFO: &[u8] = b"nimbus-block-session";
const THUMBNAIL_INFO: &[u8] = b"nimbus-thumbnail";

macro_rules! secret_key {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }

            /// Fresh random key.
            pub fn generate() -> Self {
                Self::from_bytes(random_key())
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key!(
    /// Private key of one node. Stored only in locked form.
    NodeKey
);
secret_key!(
    /// Per-revision symmetric key; every block key derives from it.
    ContentKey
);
secret_key!(
    /// Key for exactly one block (or the thumbnail) of a revision.
    SessionKey
);
secret_key!(
    /// Private key of the signing address.
    AddressKey
);
secret_key!(
    /// Stretched node passphrase; wraps the node key.
    PassphraseKey
);

pub(crate) fn random_key() -> [u8; KEY_SIZE] {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Session key for block `index`. Keys of different blocks are
/// independent: knowing one reveals nothing about its siblings.
pub fn derive_session_key(content: &ContentKey, index: u32) -> Result<SessionKey, CryptoError> {
    let mut info = Vec::with_capacity(BLOCK_SESSION_INFO.len() + 4);
    info.extend_from_slice(BLOCK_SESSION_INFO);
    info.extend_from_slice(&index.to_be_bytes());
    Ok(SessionKey::from_bytes(hkdf_derive(content.as_bytes(), &info)?))
}

pub fn derive_thumbnail_key(content: &ContentKey) -> Result<SessionKey, CryptoError> {
    Ok(SessionKey::from_bytes(hkdf_derive(
        content.as_bytes(),
        THUMBNAIL_INFO,
    )?))
}

/// XChaCha20-Poly1305 with a random nonce.
///
/// Output: `[24-byte nonce][ciphertext][16-byte tag]`
pub(crate) fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Inverse of [`seal`].
pub(crate) fn open(key: &[u8; KEY_SIZE], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Decrypt(format!(
            "ciphertext too short: {} bytes (minimum {})",
            sealed.len(),
            NONCE_SIZE + TAG_SIZE
        )));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.into());

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt("invalid key or corrupted data".into()))
}

/// Wrap (encrypt) a key under another key.
///
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn wrap_key(wrapping: &[u8; KEY_SIZE], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, CryptoError> {
    seal(wrapping, key, &[])
}

/// Unwrap (decrypt) a key produced by [`wrap_key`].
pub fn unwrap_key(wrapping: &[u8; KEY_SIZE], wrapped: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    if wrapped.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        return Err(CryptoError::MalformedKeyPacket(format!(
            "wrapped key is {} bytes (expected {})",
            wrapped.len(),
            NONCE_SIZE + KEY_SIZE + TAG_SIZE
        )));
    }

    let mut plaintext = open(wrapping, wrapped, &[])?;
    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(key_bytes)
}
