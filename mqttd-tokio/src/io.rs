//! Tokio stream transport and packet framing

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mqttd_core::protocol::{Packet, ProtocolVersion};
use mqttd_core::transport::{Transport, LOCAL_ADDRESS, PEER_ADDRESS};
use mqttd_core::SessionError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Smallest free space kept in the read buffer before each read
const READ_CHUNK: usize = 4096;

/// [`Transport`] over any Tokio byte stream.
///
/// Writes are buffered until [`Transport::drain`].
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    outgoing: BytesMut,
    closed: bool,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self::with_addresses(stream, None, None)
    }

    pub fn with_addresses(stream: S, peer: Option<SocketAddr>, local: Option<SocketAddr>) -> Self {
        Self {
            stream,
            peer,
            local,
            outgoing: BytesMut::new(),
            closed: false,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl StreamTransport<TcpStream> {
    pub fn tcp(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        // MQTT packets are small and latency-sensitive
        let _ = stream.set_nodelay(true);
        Self::with_addresses(stream, peer, local)
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buffer: &mut BytesMut) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        buffer.reserve(READ_CHUNK);
        self.stream.read_buf(buffer).await
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.outgoing.extend_from_slice(bytes);
        Ok(())
    }

    async fn drain(&mut self) -> io::Result<()> {
        if !self.outgoing.is_empty() {
            self.stream.write_all(&self.outgoing).await?;
            self.outgoing.clear();
        }
        self.stream.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let drained = self.drain().await;
        self.closed = true;
        self.stream.shutdown().await?;
        drained
    }

    async fn wait_closed(&mut self) -> io::Result<()> {
        if !self.closed {
            self.close().await?;
        }
        Ok(())
    }

    fn extra_info(&self, key: &str) -> Option<String> {
        match key {
            PEER_ADDRESS => self.peer.map(|addr| addr.to_string()),
            LOCAL_ADDRESS => self.local.map(|addr| addr.to_string()),
            _ => None,
        }
    }
}

/// Read one complete frame from the transport, undecoded.
///
/// Returns `Ok(None)` when the peer closes between packets. Bytes past the
/// frame stay in `buffer` for the next call, so cancelling this future
/// loses nothing.
pub async fn read_frame<T>(
    transport: &mut T,
    buffer: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Option<BytesMut>, SessionError>
where
    T: Transport + ?Sized,
{
    loop {
        if let Some(len) = Packet::frame_length(buffer, max_packet_size)? {
            return Ok(Some(buffer.split_to(len)));
        }
        if transport.read(buffer).await? == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            // peer went away mid-frame
            return Err(SessionError::EndOfStream);
        }
    }
}

/// Read and decode one packet, see [`read_frame`]
pub async fn read_packet<T>(
    transport: &mut T,
    buffer: &mut BytesMut,
    version: ProtocolVersion,
    max_packet_size: usize,
) -> Result<Option<Packet>, SessionError>
where
    T: Transport + ?Sized,
{
    let Some(frame) = read_frame(transport, buffer, max_packet_size).await? else {
        return Ok(None);
    };
    let (packet, _) = Packet::decode(&frame, version)?;
    Ok(Some(packet))
}

/// Encode a packet into Bytes for zero-copy transmission
pub fn encode_frame(packet: &Packet, version: ProtocolVersion) -> Bytes {
    packet.to_bytes(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqttd_core::protocol::packets::PublishPacket;
    use mqttd_core::protocol::{ProtocolError, QoS};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_packet_split_across_writes() {
        let (client, server) = duplex(64);
        let mut transport = StreamTransport::new(server);
        let mut client = StreamTransport::new(client);

        let publish = Packet::Publish(PublishPacket::new("a/b", &b"hello"[..], QoS::AtMostOnce, None, false));
        let bytes = encode_frame(&publish, ProtocolVersion::V311);
        let (head, tail) = (bytes.slice(..3), bytes.slice(3..));

        let writer = tokio::spawn(async move {
            client.write(&head).await.unwrap();
            client.drain().await.unwrap();
            tokio::task::yield_now().await;
            client.write(&tail).await.unwrap();
            client.write(&[0xC0, 0x00]).await.unwrap();
            client.drain().await.unwrap();
            client
        });

        let mut buffer = BytesMut::new();
        let first = read_packet(&mut transport, &mut buffer, ProtocolVersion::V311, 1024)
            .await
            .unwrap();
        assert_eq!(first, Some(publish));
        let second = read_packet(&mut transport, &mut buffer, ProtocolVersion::V311, 1024)
            .await
            .unwrap();
        assert_eq!(second, Some(Packet::PingReq));

        drop(writer.await.unwrap());
        let eof = read_packet(&mut transport, &mut buffer, ProtocolVersion::V311, 1024)
            .await
            .unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_read_packet_truncated_frame() {
        let (client, server) = duplex(64);
        let mut transport = StreamTransport::new(server);
        let mut client = StreamTransport::new(client);
        client.write(&[0x30, 0x0A, 0x00]).await.unwrap();
        client.drain().await.unwrap();
        drop(client);

        let mut buffer = BytesMut::new();
        let err = read_packet(&mut transport, &mut buffer, ProtocolVersion::V311, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::EndOfStream));
    }

    #[tokio::test]
    async fn test_read_packet_too_large() {
        let (client, server) = duplex(64);
        let mut transport = StreamTransport::new(server);
        let mut client = StreamTransport::new(client);
        client.write(&[0x30, 0xFF, 0x01]).await.unwrap();
        client.drain().await.unwrap();

        let mut buffer = BytesMut::new();
        let err = read_packet(&mut transport, &mut buffer, ProtocolVersion::V311, 128)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol {
                error: ProtocolError::PacketTooLarge { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_close_flushes_and_ends_reads() {
        let (client, server) = duplex(64);
        let mut transport = StreamTransport::new(server);
        let mut peer = client;

        transport.write(&[0xD0, 0x00]).await.unwrap();
        transport.close().await.unwrap();
        transport.wait_closed().await.unwrap();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, [0xD0, 0x00]);

        let mut buffer = BytesMut::new();
        assert_eq!(transport.read(&mut buffer).await.unwrap(), 0);
        assert!(transport.write(&[0xD0, 0x00]).await.is_err());
    }

    #[test]
    fn test_extra_info_addresses() {
        let (_client, server) = duplex(8);
        let peer: SocketAddr = "10.0.0.7:50000".parse().unwrap();
        let transport = StreamTransport::with_addresses(server, Some(peer), None);
        assert_eq!(transport.extra_info(PEER_ADDRESS).as_deref(), Some("10.0.0.7:50000"));
        assert_eq!(transport.peer_addr(), Some(peer));
        assert_eq!(transport.extra_info(LOCAL_ADDRESS), None);
        assert_eq!(transport.extra_info("cipher"), None);
    }
}
