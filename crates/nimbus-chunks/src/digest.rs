//! Content digests
//!
//! SHA-1 fingerprints the whole cleartext (stored in the extended attributes
//! and used as the dedup key); SHA-256 covers individual blocks.

use anyhow::{bail, Context, Result};
use nimbus_core::types::UploadSource;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::io::Read;

/// Incremental SHA-1 accumulator.
#[derive(Clone, Default)]
pub struct DigestBuilder {
    hasher: Sha1,
    len: u64,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes absorbed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lowercase hex SHA-1 (40 chars).
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// SHA-1 of exactly the first `len` bytes of a source, the bytes the block
/// plan covers. A source shorter than `len` is an error.
pub fn digest_source(source: &UploadSource, len: u64) -> Result<String> {
    let mut builder = DigestBuilder::new();
    match source {
        UploadSource::Memory { bytes } => {
            let Some(prefix) = usize::try_from(len).ok().and_then(|n| bytes.get(..n)) else {
                bail!("digest of {len} bytes past end of {}-byte source", bytes.len());
            };
            builder.add(prefix);
        }
        UploadSource::Path { path } => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening file for digest: {}", path.display()))?;
            let mut reader = file.take(len);
            let mut buf = vec![0u8; 64 * 1024]; // 64KB read buffer
            loop {
                let n = reader.read(&mut buf).with_context(|| "reading for digest")?;
                if n == 0 {
                    break;
                }
                builder.add(&buf[..n]);
            }
        }
    }
    if builder.len() != len {
        bail!("source ended after {} of {len} bytes", builder.len());
    }
    Ok(builder.finish())
}
