//! Asynchronous file streaming with a bounded read buffer.
//!
//! The file itself is owned by a background task that only ever reads when
//! asked to. [`AsyncFileResponse`] asks it for at most the free space left in
//! its buffer, so memory stays at one buffer per response no matter how slowly
//! the client drains the socket.
//!
//! Two offsets are tracked:
//!
//! - `file_offset`: bytes already handed to the connection. Only when this
//!   reaches the file length is the response done.
//! - `read_offset`: position of the reader in the file. It may lead
//!   `file_offset` by at most the buffer capacity.
//!
//! A connection may ask for fewer bytes than remain, and may get fewer than it
//! asked for. It never gets more: range and chunk framing depend on that.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::http::mime;

/// Default buffer capacity per response.
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing requested yet.
    Idle,
    /// A fill is outstanding with the reader task.
    Reading,
    /// Buffered bytes are being handed over.
    Delivering,
    /// Every byte has been handed to the connection.
    Done,
    Aborted,
}

#[derive(Debug)]
struct Fill {
    seek: Option<u64>,
    max: usize,
}

#[derive(Debug)]
struct Reader {
    fills: mpsc::Sender<Fill>,
    chunks: mpsc::Receiver<io::Result<Bytes>>,
    task: JoinHandle<()>,
}

#[derive(Debug)]
pub struct AsyncFileResponse {
    path: Option<PathBuf>,
    content_type: Option<String>,
    file_length: u64,
    file_offset: u64,
    read_offset: u64,
    buffer: BytesMut,
    capacity: usize,
    pending_seek: Option<u64>,
    in_flight: bool,
    aborted: bool,
    reader: Option<Reader>,
}

impl AsyncFileResponse {
    /// Opens `path` for streaming. Blocks on the open and stat, so call it
    /// from a blocking context such as [`crate::host::Host::response_for`].
    /// Must be called from within a tokio runtime.
    pub fn open(path: impl AsRef<Path>, buffer_size: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let metadata = file.metadata()?;

        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }

        let mut response =
            Self::from_reader(tokio::fs::File::from_std(file), metadata.len(), buffer_size);
        response.content_type = Some(mime::content_type_for(path));
        response.path = Some(path.to_path_buf());

        tracing::trace!(path = %path.display(), length = metadata.len(), "Opened file response");

        Ok(response)
    }

    /// Streams `length` bytes from any seekable source.
    pub fn from_reader<R>(source: R, length: u64, buffer_size: usize) -> Self
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        Self {
            path: None,
            content_type: None,
            file_length: length,
            file_offset: 0,
            read_offset: 0,
            buffer: BytesMut::new(),
            capacity: buffer_size.max(1),
            pending_seek: None,
            in_flight: false,
            aborted: false,
            reader: Some(spawn_reader(source)),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_done(&self) -> bool {
        self.file_offset == self.file_length
    }

    pub fn state(&self) -> StreamState {
        if self.aborted {
            StreamState::Aborted
        } else if self.is_done() {
            StreamState::Done
        } else if self.in_flight {
            StreamState::Reading
        } else if self.read_offset == 0 && self.file_offset == 0 && self.buffer.is_empty() {
            StreamState::Idle
        } else {
            StreamState::Delivering
        }
    }

    /// Returns up to `len` bytes at the current offset.
    ///
    /// An empty result means the response is done or aborted.
    pub async fn read_data(&mut self, len: usize) -> io::Result<Bytes> {
        if self.aborted {
            return Ok(Bytes::new());
        }

        let remaining = self.file_length - self.file_offset;
        let want = (len as u64).min(remaining).min(self.capacity as u64) as usize;

        if want == 0 {
            if self.is_done() {
                self.release();
            }
            return Ok(Bytes::new());
        }

        while self.buffer.len() < want {
            self.request_fill()?;
            if !self.in_flight {
                break;
            }
            self.receive_fill().await?;
        }

        let n = want.min(self.buffer.len());
        let out = self.buffer.split_to(n).freeze();
        self.file_offset += n as u64;

        debug_assert!(out.len() <= len, "file response over-delivered");

        if self.is_done() {
            self.release();
        } else {
            // Prefetch so the next storage read overlaps the socket write.
            self.request_fill()?;
        }

        Ok(out)
    }

    /// Moves the delivery position to `offset`.
    ///
    /// Buffered bytes that still line up with the new position are kept,
    /// everything else is dropped and the reader seeks before its next fill.
    pub async fn set_offset(&mut self, offset: u64) -> io::Result<()> {
        if self.aborted {
            return Ok(());
        }
        if offset > self.file_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "offset beyond end of file",
            ));
        }

        if self.in_flight {
            self.receive_fill().await?;
        }

        let buffered_start = self.read_offset - self.buffer.len() as u64;

        if offset >= buffered_start && offset <= self.read_offset {
            self.buffer.advance((offset - buffered_start) as usize);
        } else {
            self.buffer.clear();
            self.read_offset = offset;
            self.pending_seek = Some(offset);
        }

        self.file_offset = offset;
        Ok(())
    }

    /// Stops the reader, closes the file and drops the buffer.
    pub fn abort(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.in_flight = false;
        self.buffer = BytesMut::new();
        if let Some(reader) = self.reader.take() {
            reader.task.abort();
        }
    }

    /// Asks the reader for as much as fits in the buffer. Does nothing while a
    /// fill is outstanding, the buffer is full or the file is fully read.
    fn request_fill(&mut self) -> io::Result<()> {
        if self.in_flight || self.aborted {
            return Ok(());
        }

        let room = (self.capacity - self.buffer.len()) as u64;
        let left = self.file_length - self.read_offset;
        let max = room.min(left) as usize;

        if max == 0 {
            return Ok(());
        }

        let reader = self.reader.as_ref().ok_or_else(reader_gone)?;
        reader
            .fills
            .try_send(Fill {
                seek: self.pending_seek.take(),
                max,
            })
            .map_err(|_| reader_gone())?;

        self.in_flight = true;
        Ok(())
    }

    async fn receive_fill(&mut self) -> io::Result<()> {
        let reader = self.reader.as_mut().ok_or_else(reader_gone)?;
        let chunk = reader.chunks.recv().await.ok_or_else(reader_gone)??;
        self.in_flight = false;

        if chunk.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file is shorter than its reported length",
            ));
        }

        self.read_offset += chunk.len() as u64;
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    fn release(&mut self) {
        self.buffer = BytesMut::new();
        // Dropping the fill sender ends the reader task, which closes the file.
        self.reader = None;
    }
}

impl Drop for AsyncFileResponse {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.task.abort();
        }
    }
}

fn reader_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "file reader has stopped")
}

fn spawn_reader<R>(mut source: R) -> Reader
where
    R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
{
    let (fills, mut fill_rx) = mpsc::channel::<Fill>(1);
    let (chunk_tx, chunks) = mpsc::channel(1);

    let task = tokio::spawn(async move {
        while let Some(fill) = fill_rx.recv().await {
            let result = read_chunk(&mut source, fill).await;
            let failed = result.is_err();
            if chunk_tx.send(result).await.is_err() || failed {
                break;
            }
        }
    });

    Reader {
        fills,
        chunks,
        task,
    }
}

async fn read_chunk<R>(source: &mut R, fill: Fill) -> io::Result<Bytes>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    if let Some(pos) = fill.seek {
        source.seek(SeekFrom::Start(pos)).await?;
    }

    let mut buf = BytesMut::zeroed(fill.max);
    let n = source.read(&mut buf[..]).await?;
    buf.truncate(n);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source(len: usize) -> (Vec<u8>, Cursor<Vec<u8>>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        (data.clone(), Cursor::new(data))
    }

    #[tokio::test]
    async fn starts_idle_and_ends_done() {
        let (data, cursor) = source(100);
        let mut f = AsyncFileResponse::from_reader(cursor, 100, 64);
        assert_eq!(f.state(), StreamState::Idle);

        let mut out = Vec::new();
        loop {
            let chunk = f.read_data(30).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }

        assert_eq!(out, data);
        assert_eq!(f.state(), StreamState::Done);
    }

    #[tokio::test]
    async fn buffer_never_exceeds_capacity() {
        let (_, cursor) = source(10_000);
        let mut f = AsyncFileResponse::from_reader(cursor, 10_000, 128);
        while !f.is_done() {
            f.read_data(7).await.unwrap();
            assert!(f.buffered_len() <= f.capacity());
            assert!(f.read_offset() - f.file_offset() <= f.capacity() as u64);
        }
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let (_, cursor) = source(50);
        let mut f = AsyncFileResponse::from_reader(cursor, 50, 16);
        f.read_data(10).await.unwrap();
        f.abort();
        f.abort();
        assert_eq!(f.state(), StreamState::Aborted);
        assert!(f.read_data(10).await.unwrap().is_empty());
        assert_eq!(f.buffered_len(), 0);
    }

    #[tokio::test]
    async fn truncated_source_is_an_error() {
        let (_, cursor) = source(10);
        let mut f = AsyncFileResponse::from_reader(cursor, 20, 64);
        let first = f.read_data(20).await;
        // Either the short chunk is delivered first or the EOF surfaces now.
        if let Ok(chunk) = first {
            assert_eq!(chunk.len(), 10);
            assert!(f.read_data(20).await.is_err());
        }
    }
}
