use nimbus_core::NimbusError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("cannot unlock key: {0}")]
    Unlock(String),

    #[error("malformed key packet: {0}")]
    MalformedKeyPacket(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("signature verification failed: {0}")]
    Signature(String),
}

impl From<CryptoError> for NimbusError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyDerivation(_) | CryptoError::Unlock(_) => {
                NimbusError::KeyDerivation(e.to_string())
            }
            other => NimbusError::Crypto(other.to_string()),
        }
    }
}
