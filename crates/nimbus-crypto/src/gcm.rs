//! Standalone symmetric format used for thumbnails
//!
//! ```text
//! [16 bytes: IV][N bytes: ciphertext][16 bytes: GCM tag]
//! ```

use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit},
    aes::Aes256,
    AesGcm, Nonce,
};
use rand::RngCore;

use crate::error::CryptoError;
use crate::keys::SessionKey;
use crate::TAG_SIZE;

pub const IV_SIZE: usize = 16;

type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub fn encrypt_standalone(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm16::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Encrypt(format!("creating AES-256-GCM cipher: {e}")))?;

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    // aes-gcm appends the tag: ciphertext || tag
    let ct_with_tag = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), plaintext)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let mut out = Vec::with_capacity(IV_SIZE + ct_with_tag.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ct_with_tag);
    Ok(out)
}

pub fn decrypt_standalone(key: &SessionKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < IV_SIZE + TAG_SIZE {
        return Err(CryptoError::Decrypt(format!(
            "standalone ciphertext too short: {} bytes",
            data.len()
        )));
    }
    let cipher = Aes256Gcm16::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Decrypt(format!("creating AES-256-GCM cipher: {e}")))?;
    let (iv, ct_with_tag) = data.split_at(IV_SIZE);

    cipher
        .decrypt(Nonce::<U16>::from_slice(iv), ct_with_tag)
        .map_err(|_| CryptoError::Decrypt("AES-256-GCM decryption failed (wrong key?)".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_layout() {
        let key = SessionKey::generate();
        let sealed = encrypt_standalone(&key, b"thumbnail bytes").unwrap();
        assert_eq!(sealed.len(), IV_SIZE + 15 + TAG_SIZE);
        assert_eq!(decrypt_standalone(&key, &sealed).unwrap(), b"thumbnail bytes");
    }

    #[test]
    fn flipped_tag_bit_fails() {
        let key = SessionKey::generate();
        let mut sealed = encrypt_standalone(&key, b"x").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(decrypt_standalone(&key, &sealed).is_err());
    }

    #[test]
    fn short_input_fails() {
        let key = SessionKey::generate();
        assert!(decrypt_standalone(&key, &[0u8; 20]).is_err());
    }
}
