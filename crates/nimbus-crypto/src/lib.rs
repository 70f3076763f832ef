//! nimbus-crypto: content keys, block envelopes, and verification material
//!
//! Key hierarchy for one node:
//! ```text
//! Address Key (signer identity)
//!   └── Node Passphrase (random, encrypted + signed to the address key)
//!         └── Node Key (locked with Argon2id(passphrase, salt))
//!               └── Content Key (per revision, shipped as a key packet wrapped by the node key)
//!                     ├── Block Session Key i  = HKDF(content key, "nimbus-block-session" || i)
//!                     └── Thumbnail Key        = HKDF(content key, "nimbus-thumbnail")
//! ```
//!
//! Content blocks use the XChaCha20-Poly1305 envelope in `block`; thumbnails
//! use the standalone AES-GCM format in `gcm`.

pub mod block;
pub mod content;
pub mod error;
pub mod gcm;
pub mod kdf;
pub mod keys;
pub mod resource;
pub mod verification;
pub mod xattr;

pub use block::{decrypt_block, encrypt_block, strip_block_prefix, EncryptedBlock};
pub use content::ContentKeyResource;
pub use error::CryptoError;
pub use kdf::{derive_passphrase_key, KdfParams};
pub use keys::{AddressKey, ContentKey, NodeKey, PassphraseKey, SessionKey};
pub use resource::{
    EncryptionResource, LocalEncryptionResource, NodeKeyMaterial, RevisionContentKeys, SignersKit,
};
pub use verification::{derive_block_token, BlockToken};
pub use xattr::{ExtendedAttributes, ExtendedAttributesCreator};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 / GCM authentication tag
pub const TAG_SIZE: usize = 16;
