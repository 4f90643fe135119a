//! Byte-stream transport contract
//!
//! The engine only needs an ordered, reliable duplex byte stream per
//! connection. Runtime crates implement [`Transport`] for their sockets;
//! tests implement it over in-memory pipes.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;

/// Key for [`Transport::extra_info`] returning the remote address
pub const PEER_ADDRESS: &str = "peername";
/// Key for [`Transport::extra_info`] returning the local address
pub const LOCAL_ADDRESS: &str = "sockname";

#[async_trait]
pub trait Transport: Send {
    /// Appends whatever bytes are available to `buffer`.
    ///
    /// Returns the number of bytes read, 0 once the peer has closed.
    async fn read(&mut self, buffer: &mut BytesMut) -> io::Result<usize>;

    /// Reads until `buffer` holds `len` more bytes.
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] if the peer closes first.
    async fn read_exactly(&mut self, buffer: &mut BytesMut, len: usize) -> io::Result<()> {
        let target = buffer.len() + len;
        while buffer.len() < target {
            if self.read(buffer).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed with {} of {} bytes read", len - (target - buffer.len()), len),
                ));
            }
        }
        Ok(())
    }

    /// Queues `bytes` for sending.
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Waits until queued bytes are handed to the peer.
    async fn drain(&mut self) -> io::Result<()>;

    /// Starts closing the stream. Pending reads end immediately.
    async fn close(&mut self) -> io::Result<()>;

    /// Waits until the stream is fully closed.
    async fn wait_closed(&mut self) -> io::Result<()>;

    /// Introspection by key, see [`PEER_ADDRESS`] and [`LOCAL_ADDRESS`].
    fn extra_info(&self, key: &str) -> Option<String>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.extra_info(PEER_ADDRESS)?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Serves canned chunks, then EOF
    struct Scripted {
        chunks: VecDeque<&'static [u8]>,
        written: Vec<u8>,
        closed: bool,
    }

    impl Scripted {
        fn new(chunks: &[&'static [u8]]) -> Self {
            Self {
                chunks: chunks.iter().copied().collect(),
                written: Vec::new(),
                closed: false,
            }
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn read(&mut self, buffer: &mut BytesMut) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) if !self.closed => {
                    buffer.extend_from_slice(chunk);
                    Ok(chunk.len())
                }
                _ => Ok(0),
            }
        }

        async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.written.extend_from_slice(bytes);
            Ok(())
        }

        async fn drain(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> io::Result<()> {
            self.closed = true;
            Ok(())
        }

        async fn wait_closed(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn extra_info(&self, key: &str) -> Option<String> {
            (key == PEER_ADDRESS).then(|| "127.0.0.1:1883".to_owned())
        }
    }

    #[tokio::test]
    async fn test_read_exactly_across_chunks() {
        let mut transport = Scripted::new(&[b"\x30\x05", b"\x00\x01", b"a"]);
        let mut buffer = BytesMut::new();
        transport.read_exactly(&mut buffer, 4).await.unwrap();
        assert!(buffer.len() >= 4);
        assert_eq!(&buffer[..4], b"\x30\x05\x00\x01");
    }

    #[tokio::test]
    async fn test_read_exactly_end_of_stream() {
        let mut transport = Scripted::new(&[b"\x30\x05"]);
        let mut buffer = BytesMut::new();
        let err = transport.read_exactly(&mut buffer, 7).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_after_close_is_eof() {
        let mut transport = Scripted::new(&[b"\xc0\x00"]);
        transport.close().await.unwrap();
        let mut buffer = BytesMut::new();
        assert_eq!(transport.read(&mut buffer).await.unwrap(), 0);
        transport.write(b"\xd0\x00").await.unwrap();
        assert_eq!(transport.written, b"\xd0\x00");
    }

    #[test]
    fn test_peer_addr_from_extra_info() {
        let transport = Scripted::new(&[]);
        assert_eq!(transport.peer_addr(), Some("127.0.0.1:1883".parse().unwrap()));
        assert_eq!(transport.extra_info(LOCAL_ADDRESS), None);
    }
}
