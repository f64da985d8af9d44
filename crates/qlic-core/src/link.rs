//! The underlying transport seam.
//!
//! QLIC assumes an ordered, reliable byte duplex underneath: in production
//! a BLE L2CAP channel, in tests an in-memory pipe. The protocol engine
//! never touches the medium directly; everything goes through [`Link`].

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// An ordered reliable byte duplex.
///
/// Implementations must preserve byte order and deliver every byte exactly
/// once; QLIC carries no retransmission or reordering machinery of its own.
#[async_trait]
pub trait Link: Send + Sync {
    /// Write all of `bytes` to the peer.
    async fn write_all(&self, bytes: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the link; the peer's next read returns `Ok(0)`.
    async fn close(&self) -> io::Result<()>;
}

/// In-memory [`Link`] for tests, built on a bounded duplex pipe.
pub struct MemoryLink {
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<Option<WriteHalf<DuplexStream>>>,
}

impl MemoryLink {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
        }
    }
}

/// Create a connected pair of in-memory links with `capacity` bytes of
/// buffering in each direction.
#[must_use]
pub fn memory_pair(capacity: usize) -> (MemoryLink, MemoryLink) {
    let (a, b) = tokio::io::duplex(capacity);
    (MemoryLink::new(a), MemoryLink::new(b))
}

#[async_trait]
impl Link for MemoryLink {
    async fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write_all(bytes).await,
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(mut writer) = writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_cross_the_pipe_in_order() {
        let (a, b) = memory_pair(256);
        a.write_all(b"first").await.unwrap();
        a.write_all(b"second").await.unwrap();

        let mut buf = [0u8; 32];
        let mut got = Vec::new();
        while got.len() < 11 {
            let n = b.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"firstsecond");
    }

    #[tokio::test]
    async fn close_surfaces_as_eof() {
        let (a, b) = memory_pair(64);
        a.write_all(b"bye").await.unwrap();
        a.close().await.unwrap();

        let mut buf = [0u8; 8];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"bye");
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (a, _b) = memory_pair(64);
        a.close().await.unwrap();
        assert!(a.write_all(b"late").await.is_err());
    }
}
