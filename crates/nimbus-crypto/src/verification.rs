//! Proof-of-possession tokens produced by post-commit verification

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockToken {
    pub index: u32,
    pub token: String,
}

/// `base64(code XOR ciphertext[..code.len()])`, zero-padding short ciphertext.
///
/// `ciphertext` is the envelope exactly as stored on the server. Only call
/// this after the block has decrypted successfully.
pub fn derive_block_token(index: u32, verification_code: &[u8], ciphertext: &[u8]) -> BlockToken {
    let bytes: Vec<u8> = verification_code
        .iter()
        .enumerate()
        .map(|(i, c)| c ^ ciphertext.get(i).copied().unwrap_or(0))
        .collect();
    BlockToken {
        index,
        token: B64.encode(bytes),
    }
}
