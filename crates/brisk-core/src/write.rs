//! Outgoing byte queue.
//!
//! Each connection owns an ordered queue of chunks.  A chunk is either owned
//! bytes or a file range; file ranges are drained with positioned reads in
//! bounded steps so one large download cannot monopolize the task.

use std::collections::VecDeque;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

/// One queued unit of output.
pub enum OutChunk {
    /// Owned bytes, written as-is.
    Data(Bytes),
    /// A half-open range of a file, copied to the socket via `pread`.
    File {
        file: Arc<std::fs::File>,
        offset: u64,
        len: u64,
    },
}

impl OutChunk {
    pub(crate) fn remaining(&self) -> usize {
        match self {
            OutChunk::Data(b) => b.len(),
            OutChunk::File { len, .. } => usize::try_from(*len).unwrap_or(usize::MAX),
        }
    }
}

/// Step size for file-range copies.
const FILE_COPY_STEP: usize = 32 * 1024;

pub(crate) struct WriteQueue {
    chunks: VecDeque<OutChunk>,
}

impl WriteQueue {
    pub fn new() -> Self {
        WriteQueue {
            chunks: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Enqueue a chunk.  The backpressure gauge was already charged when the
    /// write command was sent, so only the drain side touches it here.
    pub fn push_preaccounted(&mut self, chunk: OutChunk) {
        self.chunks.push_back(chunk);
    }

    /// Write one step from the head chunk.  Returns `true` when the queue is
    /// fully drained afterwards.  Partial socket writes advance the head in
    /// place and leave the rest queued.
    pub async fn write_step<W>(&mut self, sock: &mut W, queued: &AtomicUsize) -> io::Result<bool>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let Some(head) = self.chunks.front_mut() else {
            return Ok(true);
        };
        match head {
            OutChunk::Data(bytes) => {
                let n = sock.write(bytes).await?;
                if n == 0 {
                    return Err(io::ErrorKind::WriteZero.into());
                }
                let _ = bytes.split_to(n);
                queued.fetch_sub(n, Ordering::Relaxed);
                if bytes.is_empty() {
                    self.chunks.pop_front();
                }
            }
            OutChunk::File { file, offset, len } => {
                let step = FILE_COPY_STEP.min(usize::try_from(*len).unwrap_or(FILE_COPY_STEP));
                let mut buf = vec![0u8; step];
                // Positioned read keeps the fd's own cursor untouched, so the
                // same file can back several queued ranges.
                let n = file.read_at(&mut buf, *offset)?;
                if n == 0 {
                    // Range ran past EOF; drop what cannot be served.
                    queued.fetch_sub(usize::try_from(*len).unwrap_or(0), Ordering::Relaxed);
                    self.chunks.pop_front();
                } else {
                    sock.write_all(&buf[..n]).await?;
                    *offset += n as u64;
                    *len -= n as u64;
                    queued.fetch_sub(n, Ordering::Relaxed);
                    if *len == 0 {
                        self.chunks.pop_front();
                    }
                }
            }
        }
        Ok(self.chunks.is_empty())
    }
}
