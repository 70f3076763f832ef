use thiserror::Error;

pub type NimbusResult<T> = Result<T, NimbusError>;

/// Coarse classification used for retry decisions and user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Crypto,
    Network,
    Validation,
    LocalState,
    Verification,
    Canceled,
    Config,
    Internal,
}

#[derive(Debug, Error)]
pub enum NimbusError {
    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    /// Timeouts, connection loss and other failures worth retrying.
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("local state error: {0}")]
    LocalState(String),

    #[error("verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("operation canceled")]
    Canceled,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Non-retryable rejections from the server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("conflicting revision: {0}")]
    ConflictingRevision(String),

    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("no files to import")]
    EmptyBatch,
}

/// Failures of the post-commit verification protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("file record missing for verification")]
    MissingFile,

    #[error("invalid verification response: {0}")]
    InvalidResponse(String),

    #[error("block {0} missing")]
    MissingBlock(u32),

    #[error("content of block {0} missing")]
    MissingBlockContent(u32),

    #[error("block {index} failed to decrypt: {reason}")]
    Undecryptable { index: u32, reason: String },
}

impl NimbusError {
    pub fn local_state(msg: impl Into<String>) -> Self {
        NimbusError::LocalState(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        NimbusError::Transient(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            NimbusError::KeyDerivation(_) | NimbusError::Crypto(_) => ErrorKind::Crypto,
            NimbusError::Transient(_) | NimbusError::Server { .. } => ErrorKind::Network,
            NimbusError::Validation(_) => ErrorKind::Validation,
            NimbusError::LocalState(_) | NimbusError::Io(_) => ErrorKind::LocalState,
            NimbusError::Verification(_) => ErrorKind::Verification,
            NimbusError::Canceled => ErrorKind::Canceled,
            NimbusError::Config(_) => ErrorKind::Config,
            NimbusError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failing call may be retried in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NimbusError::Transient(_))
            || matches!(self, NimbusError::Server { status, .. } if *status >= 500)
    }

    /// Whether the error indicates a server-side outage (5xx).
    pub fn is_server_outage(&self) -> bool {
        matches!(self, NimbusError::Server { status, .. } if *status >= 500)
    }

    /// Human-readable text for the upload failure banner.
    pub fn user_message(&self) -> String {
        match self {
            NimbusError::KeyDerivation(_) | NimbusError::Crypto(_) => {
                "Your keys could not be unlocked. Sign in again to continue uploading.".into()
            }
            NimbusError::Transient(_) => {
                "Connection lost. The upload will continue when you're back online.".into()
            }
            NimbusError::Server { .. } => {
                "The server is having trouble. Uploads will resume shortly.".into()
            }
            NimbusError::Validation(ValidationError::QuotaExceeded) => {
                "Not enough storage space to upload this file.".into()
            }
            NimbusError::Validation(ValidationError::InvalidName(name)) => {
                format!("\"{name}\" is not a valid file name.")
            }
            NimbusError::Validation(ValidationError::ConflictingRevision(_)) => {
                "This file was changed elsewhere. Retry the upload.".into()
            }
            NimbusError::Validation(ValidationError::Rejected(msg)) => msg.clone(),
            NimbusError::Validation(ValidationError::EmptyBatch) => "No files were selected.".into(),
            NimbusError::LocalState(_) | NimbusError::Io(_) => {
                "The upload could not be prepared on this device.".into()
            }
            NimbusError::Verification(_) => {
                "The uploaded file could not be verified.".into()
            }
            NimbusError::Canceled => "Upload canceled.".into(),
            NimbusError::Config(_) | NimbusError::Other(_) => {
                "Something went wrong while uploading.".into()
            }
        }
    }
}
