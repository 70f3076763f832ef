use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Stable local identity of one upload, assigned at import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        UploadId(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! remote_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

remote_id!(NodeId);
remote_id!(ShareId);
remote_id!(RevisionId);

/// Identifies the specific remote revision being uploaded or verified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadingFileIdentifier {
    pub node_id: NodeId,
    pub share_id: ShareId,
    pub revision_id: RevisionId,
}

/// Lifecycle of a draft.
///
/// ```text
/// queued → creating_content → uploading_blocks → committing_revision → verifying → done
///             └─────── paused / interrupted / failed ───────┘
/// canceled: reachable from every non-terminal state
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Queued,
    CreatingContent,
    UploadingBlocks,
    CommittingRevision,
    Verifying,
    Done,
    Paused,
    Interrupted,
    Failed,
    Canceled,
}

impl UploadState {
    /// States in which upload work is actively running.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            UploadState::CreatingContent
                | UploadState::UploadingBlocks
                | UploadState::CommittingRevision
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Done | UploadState::Canceled)
    }

    /// States from which `resume` picks the draft back up.
    pub fn is_resumable(self) -> bool {
        matches!(self, UploadState::Paused | UploadState::Interrupted)
    }

    pub fn can_transition_to(self, next: UploadState) -> bool {
        use UploadState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Done | Canceled, _) => false,
            (_, Canceled) => true,
            (Queued, CreatingContent) => true,
            (CreatingContent, UploadingBlocks | CommittingRevision) => true,
            (UploadingBlocks, CommittingRevision) => true,
            (CommittingRevision, Verifying | Done) => true,
            (Verifying, Done) => true,
            (Queued | CreatingContent | UploadingBlocks | CommittingRevision, Paused | Interrupted) => {
                true
            }
            (CreatingContent | UploadingBlocks | CommittingRevision, Failed) => true,
            (Paused | Interrupted | Failed, Queued) => true,
            // A paused draft can still be interrupted by process shutdown.
            (Paused, Interrupted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadState::Queued => "queued",
            UploadState::CreatingContent => "creating_content",
            UploadState::UploadingBlocks => "uploading_blocks",
            UploadState::CommittingRevision => "committing_revision",
            UploadState::Verifying => "verifying",
            UploadState::Done => "done",
            UploadState::Paused => "paused",
            UploadState::Interrupted => "interrupted",
            UploadState::Failed => "failed",
            UploadState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Where the cleartext of a draft is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadSource {
    Path { path: PathBuf },
    Memory { bytes: Vec<u8> },
}

/// Remote lifecycle of a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionState {
    #[default]
    Draft,
    Uploading,
    Committing,
    Active,
}

/// One block of a revision. Mutated only by the operation owning its index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// 0-based position within the revision
    pub index: u32,
    /// Plaintext length in bytes
    pub clear_size: u64,
    /// SHA-256 of the plaintext (hex), set once encrypted
    pub clear_digest: Option<String>,
    /// SHA-256 of the uploaded ciphertext (base64), required by the server
    pub sha256: Option<String>,
    /// Signature over the plaintext, encrypted to the node key (base64)
    pub enc_signature: Option<String>,
    /// Server-issued, time-limited upload target
    pub upload_url: Option<String>,
    pub upload_token: Option<String>,
    pub is_uploaded: bool,
}

impl BlockRecord {
    pub fn planned(index: u32, clear_size: u64) -> Self {
        Self {
            index,
            clear_size,
            clear_digest: None,
            sha256: None,
            enc_signature: None,
            upload_url: None,
            upload_token: None,
            is_uploaded: false,
        }
    }
}

/// Optional preview image uploaded alongside the content blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailRecord {
    /// Cleartext image bytes
    pub data: Vec<u8>,
    pub sha256: Option<String>,
    pub upload_url: Option<String>,
    pub upload_token: Option<String>,
    pub is_uploaded: bool,
}

impl ThumbnailRecord {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            sha256: None,
            upload_url: None,
            upload_token: None,
            is_uploaded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub id: Option<RevisionId>,
    pub state: RevisionState,
    /// Total cleartext size in bytes
    pub size: u64,
    pub modification_time: DateTime<Utc>,
    /// SHA-1 of the whole cleartext (hex)
    pub content_digest: Option<String>,
    /// Encrypted + signed extended attributes (base64)
    pub xattr: Option<String>,
    pub thumbnail: Option<ThumbnailRecord>,
}

/// Local + remote record of the node being uploaded, with its key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub node_id: Option<NodeId>,
    pub share_id: ShareId,
    pub parent_id: NodeId,
    pub name: String,
    pub mime_type: String,
    /// Identifies drafts created by this client installation
    pub client_uid: String,
    pub signature_email: String,
    /// Locked node private key (armored)
    pub node_key: String,
    /// Node passphrase encrypted to the signer (armored)
    pub node_passphrase: String,
    pub node_passphrase_signature: String,
    /// Content key encrypted to the node key (base64)
    pub content_key_packet: Option<String>,
    pub content_key_packet_signature: Option<String>,
}

/// A file queued for or undergoing upload. The aggregate root of the
/// upload pipeline; its blocks are stored beside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDraft {
    pub upload_id: UploadId,
    pub file: FileRecord,
    pub revision: RevisionRecord,
    pub source: UploadSource,
    pub state: UploadState,
    pub last_error: Option<String>,
}

impl FileDraft {
    /// The remote identity of this draft, once content creation has run.
    pub fn identifier(&self) -> Option<UploadingFileIdentifier> {
        Some(UploadingFileIdentifier {
            node_id: self.file.node_id.clone()?,
            share_id: self.file.share_id.clone(),
            revision_id: self.revision.id.clone()?,
        })
    }
}
