use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Byte progress of one draft. Once canceled it stops reporting, whether
/// or not in-flight requests have actually stopped.
#[derive(Debug)]
pub struct UploadProgress {
    total: u64,
    completed: AtomicU64,
    canceled: AtomicBool,
}

impl UploadProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            completed: AtomicU64::new(0),
            canceled: AtomicBool::new(false),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Record `bytes` more; `None` if progress was canceled.
    pub fn advance(&self, bytes: u64) -> Option<u64> {
        if self.is_canceled() {
            return None;
        }
        Some(self.completed.fetch_add(bytes, Ordering::SeqCst) + bytes)
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed() as f64 / self.total as f64
    }
}
