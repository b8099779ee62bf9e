//! In-process byte conduit connecting two pipeline stages.
//!
//! A link is a bounded [`sync_channel`] of byte chunks: a writer that gets ahead of
//! its reader blocks once `capacity` chunks are in flight. The writer must call
//! [`LinkWriter::finish`] to signal a clean end of stream; dropping or aborting it
//! makes the reader fail instead, so a truncated stream is never mistaken for a
//! complete one.

use crate::backup::cancel::{CancelSignal, CANCEL_POLL_INTERVAL};
use crate::backup::finish::Abort;
use std::fmt::Display;
use std::io::{self, BufRead, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Default number of chunks buffered in a link before the writer blocks
pub static DEFAULT_LINK_CAPACITY: usize = 16;
/// Default size of a chunk handed from writer to reader
pub static DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("upstream stage aborted: {0}")]
    UpstreamAborted(Arc<str>),
    #[error("downstream stage closed the link")]
    DownstreamClosed,
    #[error("pipeline cancelled")]
    Cancelled,
}

impl From<LinkError> for io::Error {
    fn from(value: LinkError) -> Self {
        // Never ErrorKind::Interrupted: io::copy retries those forever.
        let kind = match value {
            LinkError::DownstreamClosed => io::ErrorKind::BrokenPipe,
            LinkError::UpstreamAborted(_) | LinkError::Cancelled => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

#[derive(Debug, Default)]
struct LinkShared {
    aborted: OnceLock<Arc<str>>,
}

/// Creates a link holding at most `capacity` chunks of up to `chunk_size` bytes.
pub fn stream_link(
    capacity: usize,
    chunk_size: usize,
    cancel: CancelSignal,
) -> (LinkWriter, LinkReader) {
    let (tx, rx) = sync_channel(capacity.max(1));
    let shared = Arc::new(LinkShared::default());
    let chunk_size = chunk_size.max(1);
    let writer = LinkWriter {
        tx: Some(tx),
        buffer: Vec::with_capacity(chunk_size),
        chunk_size,
        shared: shared.clone(),
        cancel: cancel.clone(),
        state: WriterState::Open,
    };
    let reader = LinkReader {
        rx,
        shared,
        cancel,
        current: Vec::new(),
        offset: 0,
        eof: false,
    };
    (writer, reader)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Finished,
    Aborted,
}

#[derive(Debug)]
pub struct LinkWriter {
    tx: Option<SyncSender<Vec<u8>>>,
    buffer: Vec<u8>,
    chunk_size: usize,
    shared: Arc<LinkShared>,
    cancel: CancelSignal,
    state: WriterState,
}

impl LinkWriter {
    fn ensure_open(&self) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(LinkError::Cancelled.into());
        }
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Finished | WriterState::Aborted => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to a closed link",
            )),
        }
    }

    fn send_chunk(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;
        let data = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        self.tx
            .as_ref()
            .ok_or(LinkError::DownstreamClosed)?
            .send(data)
            .map_err(|_| LinkError::DownstreamClosed.into())
    }

    /// Flushes buffered bytes and signals a clean end of stream to the reader.
    pub fn finish(mut self) -> io::Result<()> {
        self.ensure_open()?;
        self.send_chunk()?;
        self.state = WriterState::Finished;
        self.tx.take();
        Ok(())
    }
}

impl Abort for LinkWriter {
    /// Marks the stream as failed. Never blocks, even when the link is full.
    fn abort(&mut self, reason: &dyn Display) {
        if self.state != WriterState::Open {
            return;
        }
        self.state = WriterState::Aborted;
        self.buffer.clear();
        let _ = self.shared.aborted.set(reason.to_string().into());
        self.tx.take();
    }
}

impl Write for LinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;

        let mut offset = 0;
        while offset < buf.len() {
            if self.buffer.len() == self.chunk_size {
                self.send_chunk()?;
            }

            let remaining = self.chunk_size - self.buffer.len();
            let to_copy = remaining.min(buf.len() - offset);
            self.buffer.extend_from_slice(&buf[offset..offset + to_copy]);
            offset += to_copy;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_chunk()
    }
}

impl Drop for LinkWriter {
    fn drop(&mut self) {
        self.abort(&"writer dropped before finishing the stream");
    }
}

#[derive(Debug)]
pub struct LinkReader {
    rx: Receiver<Vec<u8>>,
    shared: Arc<LinkShared>,
    cancel: CancelSignal,
    current: Vec<u8>,
    offset: usize,
    eof: bool,
}

impl LinkReader {
    fn check_upstream(&self) -> io::Result<()> {
        if let Some(reason) = self.shared.aborted.get() {
            return Err(LinkError::UpstreamAborted(reason.clone()).into());
        }
        if self.cancel.is_cancelled() {
            return Err(LinkError::Cancelled.into());
        }
        Ok(())
    }

    /// Returns `false` once the writer has finished and every byte was consumed.
    fn ensure_buffer(&mut self) -> io::Result<bool> {
        loop {
            if self.offset < self.current.len() {
                return Ok(true);
            }
            if self.eof {
                return Ok(false);
            }
            self.check_upstream()?;

            match self.rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(data) => {
                    self.current = data;
                    self.offset = 0;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.check_upstream()?;
                    self.eof = true;
                    self.current.clear();
                    self.offset = 0;
                }
            }
        }
    }
}

impl Read for LinkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let available = self.fill_buf()?;
        let to_copy = available.len().min(buf.len());
        buf[..to_copy].copy_from_slice(&available[..to_copy]);
        self.consume(to_copy);
        Ok(to_copy)
    }
}

impl BufRead for LinkReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if !self.ensure_buffer()? {
            return Ok(&[]);
        }
        Ok(&self.current[self.offset..])
    }

    fn consume(&mut self, amt: usize) {
        self.offset = (self.offset + amt).min(self.current.len());
    }
}
