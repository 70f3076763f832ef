//! Block object transport: one object per uploaded block envelope.
//!
//! Keys are `{prefix}/{revision_id}/{index}`.

use anyhow::{Context, Result};
use opendal::Operator;

#[derive(Clone, Debug)]
pub struct BlockObjectStore {
    op: Operator,
    prefix: String,
}

impl BlockObjectStore {
    pub fn new(op: Operator, prefix: impl Into<String>) -> Self {
        Self {
            op,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    pub fn revision_dir(&self, revision_id: &str) -> String {
        format!("{}/{}/", self.prefix, revision_id)
    }

    pub fn block_key(&self, revision_id: &str, index: u32) -> String {
        format!("{}{}", self.revision_dir(revision_id), index)
    }

    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.op
            .write(key, data)
            .await
            .with_context(|| format!("writing block object {key}"))?;
        tracing::debug!(key, "block object stored");
        Ok(())
    }

    /// `None` when the object does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.op.read(key).await {
            Ok(buf) => Ok(Some(buf.to_vec())),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading block object {key}")),
        }
    }

    /// Remove every block object of a revision. Returns how many were deleted.
    pub async fn delete_revision(&self, revision_id: &str) -> Result<usize> {
        let dir = self.revision_dir(revision_id);
        let entries = match self.op.list_with(&dir).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("listing {dir}")),
        };
        let mut deleted = 0;
        for entry in entries {
            if entry.metadata().is_dir() {
                continue;
            }
            self.op
                .delete(entry.path())
                .await
                .with_context(|| format!("deleting {}", entry.path()))?;
            deleted += 1;
        }
        tracing::debug!(revision_id, deleted, "revision block objects removed");
        Ok(deleted)
    }
}
