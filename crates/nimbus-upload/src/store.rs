//! Local draft store, the persistence seam of the pipeline.
//!
//! Each draft (File + Revision rows) sits behind its own mutex; each of its
//! blocks has an independent mutex so concurrent block operations never
//! contend on the parent row. Mutations are transactional: the closure works
//! on a copy that replaces the stored row only when it returns `Ok`.
//!
//! With a backing path the store is mirrored to JSON after every committed
//! mutation, written atomically via temp file + rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nimbus_core::types::{BlockRecord, FileDraft, UploadId, UploadState, UploadingFileIdentifier};
use nimbus_core::{NimbusError, NimbusResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

struct DraftEntry {
    seq: u64,
    draft: Mutex<FileDraft>,
    blocks: RwLock<Vec<Arc<Mutex<BlockRecord>>>>,
}

/// On-disk form of one draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedDraft {
    draft: FileDraft,
    blocks: Vec<BlockRecord>,
}

pub struct DraftStore {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<UploadId, Arc<DraftEntry>>>,
    next_seq: AtomicU64,
    flush_lock: Mutex<()>,
}

impl DraftStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
        }
    }

    /// Load or create a store at the given path.
    /// If the file doesn't exist, starts empty.
    pub fn open(path: &Path) -> NimbusResult<Self> {
        let store = Self {
            path: Some(path.to_path_buf()),
            ..Self::in_memory()
        };
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                NimbusError::local_state(format!("reading draft store {}: {e}", path.display()))
            })?;
            let persisted: Vec<PersistedDraft> = serde_json::from_str(&content).map_err(|e| {
                NimbusError::local_state(format!("parsing draft store {}: {e}", path.display()))
            })?;
            let mut entries = store.entries.write();
            for p in persisted {
                let id = p.draft.upload_id;
                entries.insert(id, store.make_entry(p.draft, p.blocks));
            }
            drop(entries);
            tracing::debug!(path = %path.display(), drafts = store.len(), "draft store loaded");
        }
        Ok(store)
    }

    fn make_entry(&self, draft: FileDraft, blocks: Vec<BlockRecord>) -> Arc<DraftEntry> {
        Arc::new(DraftEntry {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            draft: Mutex::new(draft),
            blocks: RwLock::new(blocks.into_iter().map(|b| Arc::new(Mutex::new(b))).collect()),
        })
    }

    fn entry(&self, id: UploadId) -> NimbusResult<Arc<DraftEntry>> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| NimbusError::local_state(format!("draft {id} not found")))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn insert(&self, draft: FileDraft, blocks: Vec<BlockRecord>) -> NimbusResult<UploadId> {
        let id = draft.upload_id;
        {
            let mut entries = self.entries.write();
            if entries.contains_key(&id) {
                return Err(NimbusError::local_state(format!("draft {id} already exists")));
            }
            entries.insert(id, self.make_entry(draft, blocks));
        }
        self.persist()?;
        Ok(id)
    }

    pub fn get(&self, id: UploadId) -> Option<FileDraft> {
        let entry = self.entries.read().get(&id).cloned()?;
        let draft = entry.draft.lock().clone();
        Some(draft)
    }

    pub fn state(&self, id: UploadId) -> Option<UploadState> {
        let entry = self.entries.read().get(&id).cloned()?;
        let state = entry.draft.lock().state;
        Some(state)
    }

    /// Blocks in index order.
    pub fn blocks(&self, id: UploadId) -> NimbusResult<Vec<BlockRecord>> {
        let entry = self.entry(id)?;
        let blocks = entry.blocks.read();
        let mut out: Vec<BlockRecord> = blocks.iter().map(|b| b.lock().clone()).collect();
        out.sort_by_key(|b| b.index);
        Ok(out)
    }

    pub fn block(&self, id: UploadId, index: u32) -> Option<BlockRecord> {
        let entry = self.entries.read().get(&id).cloned()?;
        let cell = entry
            .blocks
            .read()
            .iter()
            .find(|b| b.lock().index == index)
            .cloned()?;
        let block = cell.lock().clone();
        Some(block)
    }

    /// Transactional update of the File/Revision rows of one draft.
    pub fn update_draft<R>(
        &self,
        id: UploadId,
        f: impl FnOnce(&mut FileDraft) -> NimbusResult<R>,
    ) -> NimbusResult<R> {
        let entry = self.entry(id)?;
        let result = {
            let mut guard = entry.draft.lock();
            let mut working = guard.clone();
            let r = f(&mut working)?;
            *guard = working;
            r
        };
        self.persist()?;
        Ok(result)
    }

    /// Validated state transition. Returns the previous state.
    pub fn transition(&self, id: UploadId, next: UploadState) -> NimbusResult<UploadState> {
        self.update_draft(id, |d| {
            let prev = d.state;
            if !prev.can_transition_to(next) {
                return Err(NimbusError::local_state(format!(
                    "draft {id}: illegal transition {prev} -> {next}"
                )));
            }
            d.state = next;
            Ok(prev)
        })
    }

    /// Transactional update of a single block row.
    pub fn update_block<R>(
        &self,
        id: UploadId,
        index: u32,
        f: impl FnOnce(&mut BlockRecord) -> NimbusResult<R>,
    ) -> NimbusResult<R> {
        let entry = self.entry(id)?;
        let cell = entry
            .blocks
            .read()
            .iter()
            .find(|b| b.lock().index == index)
            .cloned()
            .ok_or_else(|| NimbusError::local_state(format!("draft {id}: block {index} not found")))?;
        let result = {
            let mut guard = cell.lock();
            let mut working = guard.clone();
            let r = f(&mut working)?;
            *guard = working;
            r
        };
        self.persist()?;
        Ok(result)
    }

    /// Drafts currently in any of `states`, oldest first.
    pub fn ids_in_states(&self, states: &[UploadState]) -> Vec<UploadId> {
        let entries: Vec<Arc<DraftEntry>> = self.entries.read().values().cloned().collect();
        let mut matching: Vec<(u64, UploadId)> = entries
            .iter()
            .filter_map(|e| {
                let d = e.draft.lock();
                states.contains(&d.state).then_some((e.seq, d.upload_id))
            })
            .collect();
        matching.sort();
        matching.into_iter().map(|(_, id)| id).collect()
    }

    /// The draft uploading (or having uploaded) this remote revision.
    pub fn find_by_identifier(&self, identifier: &UploadingFileIdentifier) -> Option<UploadId> {
        let entries: Vec<Arc<DraftEntry>> = self.entries.read().values().cloned().collect();
        entries.iter().find_map(|e| {
            let d = e.draft.lock();
            (d.identifier().as_ref() == Some(identifier)).then_some(d.upload_id)
        })
    }

    fn persist(&self) -> NimbusResult<()> {
        if self.path.is_some() {
            self.flush()?;
        }
        Ok(())
    }

    /// Write the whole store to disk using an atomic write (write then rename).
    pub fn flush(&self) -> NimbusResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.flush_lock.lock();

        let mut entries: Vec<Arc<DraftEntry>> = self.entries.read().values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        let snapshot: Vec<PersistedDraft> = entries
            .iter()
            .map(|e| PersistedDraft {
                draft: e.draft.lock().clone(),
                blocks: e.blocks.read().iter().map(|b| b.lock().clone()).collect(),
            })
            .collect();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                NimbusError::local_state(format!("creating store dir {}: {e}", parent.display()))
            })?;
        }
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| NimbusError::local_state(format!("serializing draft store: {e}")))?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| {
            NimbusError::local_state(format!("writing draft store temp {}: {e}", tmp_path.display()))
        })?;
        std::fs::rename(&tmp_path, path).map_err(|e| {
            NimbusError::local_state(format!("renaming draft store {}: {e}", path.display()))
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for DraftStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DraftStore")
            .field("path", &self.path)
            .field("drafts", &self.len())
            .finish()
    }
}
