//! Standard input shared by all instances.
//!
//! The coordinator's stdin is read once into a [`FanoutBuffer`]. Every
//! instance gets its own [`FanoutReader`] that replays the whole input from
//! the beginning, independently of how fast the other instances consume it.

use crate::error::{is_disconnect, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Default)]
struct Buffered {
    chunks: Vec<Bytes>,
    closed: bool,
}

/// Append-only input buffer with any number of independent readers.
#[derive(Debug, Clone)]
pub struct FanoutBuffer {
    state: Arc<watch::Sender<Buffered>>,
}

impl Default for FanoutBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutBuffer {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Buffered::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// A buffer that already holds all of `data`.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let buffer = Self::new();
        buffer.push(data.into());
        buffer.close();
        buffer
    }

    /// Append a chunk and wake the readers.
    pub fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.state.send_modify(|state| state.chunks.push(chunk));
    }

    /// Mark the end of input.
    pub fn close(&self) {
        self.state.send_modify(|state| state.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Total bytes buffered so far.
    pub fn len(&self) -> usize {
        self.state.borrow().chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A reader starting at the beginning of the input.
    pub fn reader(&self) -> FanoutReader {
        FanoutReader {
            state: self.state.subscribe(),
            next: 0,
        }
    }

    /// Copy `source` into the buffer until it ends, then close the buffer.
    ///
    /// The buffer is closed on errors too, so readers never wait forever.
    pub async fn pump<R: AsyncRead + Unpin>(&self, mut source: R) -> Result<u64> {
        let mut total = 0u64;
        let result = loop {
            let mut chunk = vec![0u8; CHUNK_SIZE];
            match source.read(&mut chunk).await {
                Ok(0) => break Ok(total),
                Ok(n) => {
                    chunk.truncate(n);
                    total += n as u64;
                    self.push(Bytes::from(chunk));
                }
                Err(e) => break Err(e.into()),
            }
        };
        self.close();
        debug!("Standard input finished after {} bytes", total);
        result
    }
}

/// One instance's view of a [`FanoutBuffer`].
#[derive(Debug)]
pub struct FanoutReader {
    state: watch::Receiver<Buffered>,
    next: usize,
}

impl FanoutReader {
    /// The next chunk, waiting for it if needed. `None` once the input is
    /// closed and fully read.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        let next = self.next;
        // If the buffer itself is gone, whatever was pushed is all there is.
        let _ = self
            .state
            .wait_for(|state| state.chunks.len() > next || state.closed)
            .await;
        let chunk = self.state.borrow().chunks.get(next).cloned();
        if chunk.is_some() {
            self.next += 1;
        }
        chunk
    }

    /// Write the whole input to `sink` and close it.
    ///
    /// A sink that stops accepting data (the instance exited or closed its
    /// stdin) ends the copy without an error.
    pub async fn copy_to<W: AsyncWrite + Unpin>(mut self, mut sink: W) -> Result<u64> {
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk().await {
            match sink.write_all(&chunk).await {
                Ok(()) => written += chunk.len() as u64,
                Err(e) if is_disconnect(&e) => return Ok(written),
                Err(e) => return Err(e.into()),
            }
        }
        match sink.shutdown().await {
            Err(e) if !is_disconnect(&e) => Err(e.into()),
            _ => Ok(written),
        }
    }
}
