//! nimbus-upload: encrypted chunked upload pipeline with post-commit verification
//!
//! Flow for one draft:
//! ```text
//! importer ──► DraftStore (queued)
//!                 │
//! FileUploader ── slot + circuit breaker ──► pipeline
//!                 │   dedup lookup (name + SHA-1) ──hit──► done
//!                 ▼
//!          OperationGraph:  contents ─┬─► block 0 ─┐
//!                                     ├─► block 1 ─┼─► commit
//!                                     ├─► …       ─┤
//!                                     └─► thumb   ─┘
//!                 │
//!                 ▼
//!          UploadVerifier (background) ──► confirm_verification ──► done
//! ```

pub mod events;
pub mod graph;
pub mod importer;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod operations;
pub mod pipeline;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod store;
pub mod uploader;
pub mod verifier;

pub use events::{EventBus, UploadEvent};
pub use importer::{DraftImportStorage, ImportOutcome, LocalFile, SegmentedFileDraftImporter};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryCloud;
pub use remote::CloudServices;
pub use store::DraftStore;
pub use uploader::{FileUploader, UploadHandle, UploadOutcome};
pub use verifier::{UploadVerifier, VerificationReport};
