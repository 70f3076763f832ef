//! nimbus-chunks: fixed-size block planning, content digests, and block reading
//!
//! # Overview
//! - `planner`: splits a file size into block lengths; the single source of
//!   truth for both the extended attributes and the block upload operations
//! - `digest`: incremental SHA-1 (whole-file fingerprint) and SHA-256 helpers
//! - `reader`: reads one block's cleartext out of an upload source

pub mod digest;
pub mod planner;
pub mod reader;

pub use digest::{digest_source, sha256, sha256_hex, DigestBuilder};
pub use planner::{BlockPlanner, BlockRange};
pub use reader::{source_len, BlockReader};
