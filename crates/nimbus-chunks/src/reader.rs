use anyhow::{bail, Context, Result};
use nimbus_core::types::UploadSource;
use std::io::{Read, Seek, SeekFrom};

use crate::planner::BlockRange;

/// Total cleartext length of a source.
pub fn source_len(source: &UploadSource) -> Result<u64> {
    match source {
        UploadSource::Memory { bytes } => Ok(bytes.len() as u64),
        UploadSource::Path { path } => Ok(std::fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?
            .len()),
    }
}

/// Reads single blocks of cleartext. Each read opens the file afresh so
/// block operations never share a cursor.
#[derive(Debug, Clone)]
pub struct BlockReader {
    source: UploadSource,
}

impl BlockReader {
    pub fn new(source: UploadSource) -> Self {
        Self { source }
    }

    pub fn read(&self, range: BlockRange) -> Result<Vec<u8>> {
        match &self.source {
            UploadSource::Memory { bytes } => {
                let start = range.offset as usize;
                let end = start + range.len as usize;
                if end > bytes.len() {
                    bail!(
                        "block {} [{start}..{end}) past end of {}-byte source",
                        range.index,
                        bytes.len()
                    );
                }
                Ok(bytes[start..end].to_vec())
            }
            UploadSource::Path { path } => {
                let mut file = std::fs::File::open(path)
                    .with_context(|| format!("opening {}", path.display()))?;
                file.seek(SeekFrom::Start(range.offset))
                    .with_context(|| format!("seeking to block {}", range.index))?;
                let mut buf = vec![0u8; range.len as usize];
                tracing::trace!(path = %path.display(), index = range.index, offset = range.offset, "reading block");
                file.read_exact(&mut buf).with_context(|| {
                    format!(
                        "reading block {} of {} (file changed since planning?)",
                        range.index,
                        path.display()
                    )
                })?;
                Ok(buf)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::BlockPlanner;
    use std::io::Write;

    #[test]
    fn blocks_reassemble_file() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        let source = UploadSource::Path {
            path: file.path().to_path_buf(),
        };

        let total = source_len(&source).unwrap();
        assert_eq!(total, 10_000);

        let planner = BlockPlanner::new(4096).unwrap();
        let reader = BlockReader::new(source);
        let mut out = Vec::new();
        for r in planner.ranges(total).unwrap() {
            let block = reader.read(r).unwrap();
            assert_eq!(block.len() as u64, r.len);
            out.extend(block);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn truncated_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"short").unwrap();
        let reader = BlockReader::new(UploadSource::Path {
            path: file.path().to_path_buf(),
        });
        let res = reader.read(BlockRange {
            index: 0,
            offset: 0,
            len: 100,
        });
        assert!(res.is_err());
    }

    #[test]
    fn empty_block_reads_empty() {
        let reader = BlockReader::new(UploadSource::Memory { bytes: vec![] });
        let block = reader
            .read(BlockRange {
                index: 0,
                offset: 0,
                len: 0,
            })
            .unwrap();
        assert!(block.is_empty());
    }
}
