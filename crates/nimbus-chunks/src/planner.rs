//! Fixed-size block planning
//!
//! A file of `total` bytes is cut into `ceil(total / max)` blocks, every
//! block exactly `max` bytes except the last. Zero-length files still
//! upload one empty block, which the server requires.

use anyhow::{bail, Result};

/// Byte range of one block within the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub index: u32,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlanner {
    max_block_size: u64,
}

impl BlockPlanner {
    pub fn new(max_block_size: u64) -> Result<Self> {
        if max_block_size == 0 {
            bail!("max block size must be > 0");
        }
        Ok(Self { max_block_size })
    }

    pub fn max_block_size(&self) -> u64 {
        self.max_block_size
    }

    /// Number of blocks `total` bytes plan into. Fails when the count does
    /// not fit a `u32` block index.
    pub fn block_count(&self, total: u64) -> Result<u32> {
        let count = total.div_ceil(self.max_block_size).max(1);
        match u32::try_from(count) {
            Ok(count) => Ok(count),
            Err(_) => bail!(
                "{total} bytes need {count} blocks of {} bytes, more than {} allowed",
                self.max_block_size,
                u32::MAX
            ),
        }
    }

    /// Raw partition: empty for `total == 0`.
    pub fn split(&self, total: u64) -> Result<Vec<u64>> {
        self.block_count(total)?;
        let max = self.max_block_size;
        let rem = total % max;
        let mut sizes = vec![max; (total / max) as usize];
        if rem > 0 {
            sizes.push(rem);
        }
        Ok(sizes)
    }

    /// Block sizes as sent to the server: a zero-length file is one empty block.
    pub fn plan(&self, total: u64) -> Result<Vec<u64>> {
        if total == 0 {
            return Ok(vec![0]);
        }
        self.split(total)
    }

    pub fn ranges(&self, total: u64) -> Result<Vec<BlockRange>> {
        let mut offset = 0;
        Ok(self
            .plan(total)?
            .into_iter()
            .enumerate()
            .map(|(i, len)| {
                let range = BlockRange {
                    index: i as u32,
                    offset,
                    len,
                };
                offset += len;
                range
            })
            .collect())
    }

    /// Range of a single block, or `None` if `index` is past the end.
    pub fn range(&self, total: u64, index: u32) -> Option<BlockRange> {
        let offset = (index as u64).checked_mul(self.max_block_size)?;
        if offset >= total && !(total == 0 && index == 0) {
            return None;
        }
        let len = (total - offset).min(self.max_block_size);
        Some(BlockRange { index, offset, len })
    }
}
