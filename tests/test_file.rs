use std::io::{self, Cursor, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use beacon::http::file::{AsyncFileResponse, StreamState};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

/// Seekable source that hands out at most `max` bytes per read.
struct Trickle {
    inner: Cursor<Vec<u8>>,
    max: usize,
}

impl AsyncRead for Trickle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut tmp = vec![0u8; self.max.min(buf.remaining())];
        let mut small = ReadBuf::new(&mut tmp);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut small))?;
        buf.put_slice(small.filled());
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for Trickle {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn trickle(data: &[u8], max: usize) -> AsyncFileResponse {
    let source = Trickle {
        inner: Cursor::new(data.to_vec()),
        max,
    };
    AsyncFileResponse::from_reader(source, data.len() as u64, 64)
}

#[tokio::test]
async fn test_short_reads_are_reassembled() {
    let data = pattern(1000);
    let mut f = trickle(&data, 7);

    let mut out = Vec::new();
    loop {
        let chunk = f.read_data(50).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        assert!(chunk.len() <= 50);
        out.extend_from_slice(&chunk);
    }

    assert_eq!(out, data);
    assert!(f.is_done());
    assert_eq!(f.state(), StreamState::Done);
}

#[tokio::test]
async fn test_never_delivers_more_than_asked() {
    let data = pattern(300);
    let mut f = trickle(&data, 100);

    for want in [1usize, 3, 64, 200, 5] {
        let chunk = f.read_data(want).await.unwrap();
        assert!(chunk.len() <= want);
    }
}

#[tokio::test]
async fn test_set_offset_forward_and_back() {
    let data = pattern(1000);
    let mut f = trickle(&data, 16);

    let first = f.read_data(10).await.unwrap();
    assert_eq!(&first[..], &data[..first.len()]);

    f.set_offset(500).await.unwrap();
    assert_eq!(f.file_offset(), 500);
    let chunk = f.read_data(20).await.unwrap();
    assert!(!chunk.is_empty());
    assert_eq!(&chunk[..], &data[500..500 + chunk.len()]);

    f.set_offset(5).await.unwrap();
    let chunk = f.read_data(20).await.unwrap();
    assert_eq!(&chunk[..], &data[5..5 + chunk.len()]);
}

#[tokio::test]
async fn test_set_offset_within_buffer_keeps_data() {
    let data = pattern(200);
    let mut f = trickle(&data, 200);

    let chunk = f.read_data(10).await.unwrap();
    assert_eq!(chunk.len(), 10);

    f.set_offset(12).await.unwrap();
    let chunk = f.read_data(4).await.unwrap();
    assert_eq!(&chunk[..], &data[12..16]);
}

#[tokio::test]
async fn test_set_offset_past_end_fails() {
    let data = pattern(10);
    let mut f = trickle(&data, 10);
    assert!(f.set_offset(11).await.is_err());
    assert!(f.set_offset(10).await.is_ok());
    assert!(f.is_done());
}

#[tokio::test]
async fn test_open_real_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.txt");
    std::fs::write(&path, b"hello, file").unwrap();

    let mut f = AsyncFileResponse::open(&path, 4).unwrap();
    assert_eq!(f.file_length(), 11);
    assert_eq!(f.content_type(), Some("text/plain"));
    assert_eq!(f.path(), Some(path.as_path()));

    let mut out = Vec::new();
    while !f.is_done() {
        let chunk = f.read_data(100).await.unwrap();
        assert!(chunk.len() <= 4);
        out.extend_from_slice(&chunk);
    }
    assert_eq!(out, b"hello, file");
}

#[tokio::test]
async fn test_open_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(AsyncFileResponse::open(dir.path(), 16).is_err());
}

#[tokio::test]
async fn test_abort_mid_stream() {
    let data = pattern(1000);
    let mut f = trickle(&data, 8);
    f.read_data(10).await.unwrap();
    f.abort();

    assert!(f.is_aborted());
    assert!(f.read_data(10).await.unwrap().is_empty());
    // Seeking an aborted response is a no-op.
    assert!(f.set_offset(0).await.is_ok());
}

#[tokio::test]
async fn test_drop_without_reading() {
    let data = pattern(100);
    let f = trickle(&data, 8);
    drop(f);
}
