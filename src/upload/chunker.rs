//! Adaptive chunk sizing and lazy chunk production.

use crate::config::MultipartConfig;
use crate::error::{Error, Result};
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// One contiguous byte range of an upload payload. `end == total` on the
/// final chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChunk {
    pub data: Bytes,
    pub start: u64,
    pub end: u64,
}

/// Picks a chunk size for a payload of `total` bytes.
///
/// Payloads that cannot fit in `max_chunk_count` maximal chunks are rejected.
/// Small payloads use the minimum chunk size; anything larger spreads evenly
/// across the allowed chunk count.
pub fn select_chunk_size(total: u64, config: &MultipartConfig) -> Result<u64> {
    let limit = config.max_chunk_count * config.max_chunk_size;
    if total > limit {
        return Err(Error::FileTooLarge { size: total, limit });
    }
    if total < config.max_chunk_count * config.min_chunk_size {
        Ok(config.min_chunk_size)
    } else {
        Ok(total / (config.max_chunk_count + 1))
    }
}

enum ChunkSource {
    File(File),
    Bytes(Bytes),
}

/// A finite, non-restartable chunk sequence over one payload.
///
/// A zero-byte source yields exactly one zero-length chunk, so empty
/// attributes stay representable on the wire.
pub struct FileChunker {
    source: ChunkSource,
    total: u64,
    chunk_size: u64,
    offset: u64,
    done: bool,
}

impl FileChunker {
    pub fn for_file(file: File, total: u64, chunk_size: u64) -> Self {
        FileChunker {
            source: ChunkSource::File(file),
            total,
            chunk_size,
            offset: 0,
            done: false,
        }
    }

    pub fn for_bytes(data: Bytes, chunk_size: u64) -> Self {
        let total = data.len() as u64;
        FileChunker {
            source: ChunkSource::Bytes(data),
            total,
            chunk_size,
            offset: 0,
            done: false,
        }
    }

    /// Next chunk in order, `None` once the payload is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<FileChunk>> {
        if self.done {
            return Ok(None);
        }
        let start = self.offset;
        let want = self.chunk_size.min(self.total - start) as usize;
        let data = match &mut self.source {
            ChunkSource::Bytes(bytes) => bytes.slice(start as usize..start as usize + want),
            ChunkSource::File(file) => {
                let mut buf = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        return Err(Error::FileUpload {
                            path: "<chunked upload>".into(),
                            reason: format!(
                                "file truncated during upload: expected {} bytes at offset {}, got {}",
                                want, start, filled
                            ),
                        });
                    }
                    filled += n;
                }
                Bytes::from(buf)
            }
        };
        self.offset = start + data.len() as u64;
        if self.offset >= self.total {
            self.done = true;
        }
        Ok(Some(FileChunk {
            data,
            start,
            end: self.offset,
        }))
    }
}
