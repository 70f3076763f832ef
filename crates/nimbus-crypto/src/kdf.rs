//! Argon2id stretching of node passphrases.
//!
//! A locked node key is stored as `salt || wrap(Argon2id(passphrase, salt), node_key)`.

use argon2::{Algorithm, Argon2, Params, Version};
use nimbus_core::config::CryptoConfig;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::error::CryptoError;
use crate::keys::PassphraseKey;
use crate::KEY_SIZE;

pub const SALT_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::from(&CryptoConfig::default())
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(c: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: c.mem_cost_kib,
            time_cost: c.time_cost,
            parallelism: c.parallelism,
        }
    }
}

impl KdfParams {
    fn hasher(&self) -> Result<Argon2<'static>, CryptoError> {
        let params = Params::new(self.mem_cost_kib, self.time_cost, self.parallelism, Some(KEY_SIZE))
            .map_err(|e| CryptoError::KeyDerivation(format!("Argon2id parameters {self:?}: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Split a locked key blob into its salt and the wrapped remainder.
pub(crate) fn split_salt(locked: &[u8]) -> Result<([u8; SALT_SIZE], &[u8]), CryptoError> {
    if locked.len() <= SALT_SIZE {
        return Err(CryptoError::MalformedKeyPacket(format!(
            "locked node key is {} bytes",
            locked.len()
        )));
    }
    let (head, rest) = locked.split_at(SALT_SIZE);
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(head);
    Ok((salt, rest))
}

pub fn derive_passphrase_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> Result<PassphraseKey, CryptoError> {
    let mut out = [0u8; KEY_SIZE];
    params
        .hasher()?
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::KeyDerivation(format!("Argon2id: {e}")))?;
    Ok(PassphraseKey::from_bytes(out))
}

#[cfg(test)]
pub(crate) fn fast_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_passphrase_and_salt_reproduce_the_lock() {
        let pass = SecretString::from("node-passphrase");
        let salt = random_salt();
        let a = derive_passphrase_key(&pass, &salt, &fast_params()).unwrap();
        let b = derive_passphrase_key(&pass, &salt, &fast_params()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        let other = derive_passphrase_key(&SecretString::from("other"), &salt, &fast_params()).unwrap();
        assert_ne!(a.as_bytes(), other.as_bytes());
    }

    #[test]
    fn zero_cost_parameters_are_key_derivation_errors() {
        let params = KdfParams {
            mem_cost_kib: 1,
            time_cost: 0,
            parallelism: 0,
        };
        let err = derive_passphrase_key(&SecretString::from("x"), &[0u8; SALT_SIZE], &params).unwrap_err();
        assert!(matches!(err, CryptoError::KeyDerivation(_)));
    }

    #[test]
    fn salt_is_split_off_locked_blob() {
        let mut blob = vec![7u8; SALT_SIZE];
        blob.extend_from_slice(b"wrapped");
        let (salt, rest) = split_salt(&blob).unwrap();
        assert_eq!(salt, [7u8; SALT_SIZE]);
        assert_eq!(rest, b"wrapped");

        assert!(matches!(
            split_salt(&[0u8; SALT_SIZE]),
            Err(CryptoError::MalformedKeyPacket(_))
        ));
    }

    #[test]
    fn defaults_follow_crypto_config() {
        assert_eq!(KdfParams::default(), KdfParams::from(&CryptoConfig::default()));
    }
}
