#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use mqttd_tokio::protocol::packets::{
    ConnectPacket, PublishPacket, SubscribePacket, Subscription, UnsubscribePacket,
};
use mqttd_tokio::protocol::{Packet, ProtocolVersion, QoS, ReasonCode};
use mqttd_tokio::{read_packet, BrokerConfig, SessionError, MqttServer, MqttServerConfig, StreamTransport, Transport};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

pub fn test_broker_config() -> BrokerConfig {
    BrokerConfig {
        max_messages_per_second: 0,
        max_subscriptions_per_minute: 0,
        ..BrokerConfig::default()
    }
}

pub struct TestServer {
    pub server: Arc<MqttServer>,
    pub addr: SocketAddr,
    pub serving: JoinHandle<io::Result<()>>,
}

pub async fn start_server(broker: BrokerConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(MqttServer::with_config(MqttServerConfig {
        bind_addr: addr.to_string(),
        broker,
        shutdown_timeout: Duration::from_secs(1),
        ..MqttServerConfig::default()
    }));
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };
    TestServer { server, addr, serving }
}

/// Minimal MQTT client speaking through the crate's own codec
pub struct TestClient<S> {
    transport: StreamTransport<S>,
    buffer: BytesMut,
    pub version: ProtocolVersion,
}

impl TestClient<TcpStream> {
    pub async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self::over(stream, ProtocolVersion::V311)
    }

    /// Opens a connection and completes a successful CONNECT
    pub async fn connect(addr: SocketAddr, version: ProtocolVersion, client_id: &str) -> Self {
        Self::connect_with(addr, ConnectPacket::new(version, client_id, 60)).await
    }

    pub async fn connect_with(addr: SocketAddr, connect: ConnectPacket) -> Self {
        let mut client = Self::open(addr).await;
        client.handshake(connect).await;
        client
    }
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn over(stream: S, version: ProtocolVersion) -> Self {
        Self {
            transport: StreamTransport::new(stream),
            buffer: BytesMut::new(),
            version,
        }
    }

    pub async fn handshake(&mut self, connect: ConnectPacket) {
        self.version = connect.protocol_version;
        self.send(Packet::Connect(connect)).await;
        match self.recv().await {
            Some(Packet::ConnAck(connack)) => assert_eq!(connack.reason_code, ReasonCode::SUCCESS),
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.transport.write(&packet.to_bytes(self.version)).await.unwrap();
        self.transport.drain().await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.transport.write(bytes).await.unwrap();
        self.transport.drain().await.unwrap();
    }

    /// Next packet, `None` once the server closes
    pub async fn recv(&mut self) -> Option<Packet> {
        let read = read_packet(&mut self.transport, &mut self.buffer, self.version, usize::MAX);
        match tokio::time::timeout(RECV_TIMEOUT, read).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => panic!("read failed: {}", e),
            Err(_) => panic!("no packet within {:?}", RECV_TIMEOUT),
        }
    }

    /// Waits for the server to close; a reset counts as closed
    pub async fn expect_closed(&mut self) {
        let read = read_packet(&mut self.transport, &mut self.buffer, self.version, usize::MAX);
        match tokio::time::timeout(RECV_TIMEOUT, read).await {
            Ok(Ok(None)) | Ok(Err(SessionError::Transport { .. })) | Ok(Err(SessionError::EndOfStream)) => {}
            Ok(Ok(Some(packet))) => panic!("expected the server to close, got {:?}", packet),
            Ok(Err(e)) => panic!("read failed: {}", e),
            Err(_) => panic!("connection still open after {:?}", RECV_TIMEOUT),
        }
    }

    pub async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) {
        self.send(Packet::Subscribe(SubscribePacket::new(
            packet_id,
            vec![Subscription::new(filter, qos)],
        )))
        .await;
        match self.recv().await {
            Some(Packet::SubAck(suback)) => {
                assert_eq!(suback.packet_id, packet_id);
                assert!(!suback.reason_codes[0].is_error(), "subscribe refused: {}", suback.reason_codes[0]);
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    pub async fn unsubscribe(&mut self, packet_id: u16, filter: &str) -> Vec<ReasonCode> {
        self.send(Packet::Unsubscribe(UnsubscribePacket::new(packet_id, vec![filter.to_owned()])))
            .await;
        match self.recv().await {
            Some(Packet::UnsubAck(unsuback)) => unsuback.reason_codes,
            other => panic!("expected UNSUBACK, got {:?}", other),
        }
    }

    pub async fn publish(&mut self, publish: PublishPacket) {
        self.send(Packet::Publish(publish)).await;
    }

    /// Round-trips a PINGREQ; everything received before the PINGRESP is returned
    pub async fn sync(&mut self) -> Vec<Packet> {
        self.send(Packet::PingReq).await;
        let mut before = Vec::new();
        loop {
            match self.recv().await {
                Some(Packet::PingResp) => return before,
                Some(packet) => before.push(packet),
                None => panic!("connection closed while waiting for PINGRESP"),
            }
        }
    }

    pub async fn expect_publish(&mut self) -> PublishPacket {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    pub async fn expect_ack(&mut self) -> Packet {
        match self.recv().await {
            Some(packet @ (Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubRel(_) | Packet::PubComp(_))) => packet,
            other => panic!("expected an acknowledgement, got {:?}", other),
        }
    }

    /// Drops the connection without DISCONNECT
    pub fn abort(self) {
        drop(self.transport.into_inner());
    }
}

pub fn publish(topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) -> PublishPacket {
    PublishPacket::new(topic, payload, qos, packet_id, false)
}
