//! Typed upload events, broadcast to any number of subscribers.

use nimbus_core::types::{UploadId, UploadState, UploadingFileIdentifier};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    StateChanged {
        upload_id: UploadId,
        from: UploadState,
        to: UploadState,
    },
    Progress {
        upload_id: UploadId,
        completed_bytes: u64,
        total_bytes: u64,
    },
    BlockUploaded {
        upload_id: UploadId,
        index: u32,
    },
    Committed {
        upload_id: UploadId,
        identifier: UploadingFileIdentifier,
        fast_path: bool,
    },
    Failed {
        upload_id: UploadId,
        state: UploadState,
        error: String,
        user_message: String,
    },
    Verified {
        upload_id: UploadId,
        identifier: UploadingFileIdentifier,
        blocks: usize,
    },
    VerificationFailed {
        upload_id: UploadId,
        identifier: UploadingFileIdentifier,
        failed_blocks: Vec<u32>,
        error: String,
    },
}

impl UploadEvent {
    pub fn upload_id(&self) -> UploadId {
        match self {
            UploadEvent::StateChanged { upload_id, .. }
            | UploadEvent::Progress { upload_id, .. }
            | UploadEvent::BlockUploaded { upload_id, .. }
            | UploadEvent::Committed { upload_id, .. }
            | UploadEvent::Failed { upload_id, .. }
            | UploadEvent::Verified { upload_id, .. }
            | UploadEvent::VerificationFailed { upload_id, .. } => *upload_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }

    /// Fire and forget; having no subscribers is not an error.
    pub fn emit(&self, event: UploadEvent) {
        tracing::trace!(?event, "upload event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
