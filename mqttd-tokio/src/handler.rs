use crate::io::{encode_frame, read_frame};
use bytes::BytesMut;
use log::{debug, info, trace, warn};
use mqttd_core::protocol::Packet;
use mqttd_core::transport::{Transport, PEER_ADDRESS};
use mqttd_core::{Broker, Mailbox, Session, SessionError, SessionState};
use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub read_buffer_capacity: usize,
    /// How long a fresh connection may take to send CONNECT
    pub connect_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            read_buffer_capacity: 4096,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Session clock, following Tokio's (paused) time in tests
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

/// Get detailed packet info for logging
fn packet_details(packet: &Packet) -> String {
    match packet {
        Packet::Connect(c) => format!("client_id={}, version={}", c.client_id, c.protocol_version),
        Packet::ConnAck(c) => format!("rc={}", c.reason_code),
        Packet::Publish(p) => format!(
            "topic={}, qos={}, retain={}, dup={}, payload_len={}",
            p.topic_name,
            p.qos as u8,
            p.retain,
            p.dup,
            p.payload.len()
        ),
        Packet::PubAck(p) | Packet::PubRec(p) | Packet::PubRel(p) | Packet::PubComp(p) => {
            format!("packet_id={}, rc={}", p.packet_id, p.reason_code)
        }
        Packet::Subscribe(s) => format!("packet_id={}, filters={}", s.packet_id, s.subscriptions.len()),
        Packet::SubAck(s) => format!("packet_id={}", s.packet_id),
        Packet::Unsubscribe(u) => format!("packet_id={}, filters={}", u.packet_id, u.topic_filters.len()),
        Packet::UnsubAck(u) => format!("packet_id={}", u.packet_id),
        Packet::Disconnect(d) => format!("rc={}", d.reason_code),
        Packet::PingReq | Packet::PingResp => String::new(),
    }
}

fn log_packet(session: &Session, direction: &str, packet: &Packet) {
    let pkt_type = packet.packet_type().name();
    let details = packet_details(packet);
    if details.is_empty() {
        debug!("Session {}: {} {}", session.id(), direction, pkt_type);
    } else {
        debug!("Session {}: {} {} ({})", session.id(), direction, pkt_type, details);
    }
}

/// Encode and flush packets produced by the session
async fn send<T>(transport: &mut T, session: &Session, packets: Vec<Packet>) -> Result<(), SessionError>
where
    T: Transport + ?Sized,
{
    if packets.is_empty() {
        return Ok(());
    }
    for packet in &packets {
        log_packet(session, "Sending", packet);
        transport.write(&encode_frame(packet, session.version())).await?;
    }
    trace!("Session {}: flushing {} packets", session.id(), packets.len());
    transport.drain().await?;
    Ok(())
}

/// Handle a single MQTT client connection until it ends.
///
/// The session is closed on every exit path: its will fires when the end was
/// abnormal, and a final CONNACK or v5 DISCONNECT is written when the cause
/// calls for one. A peer closing the stream is a normal end.
pub async fn handle_connection<T>(mut transport: T, broker: Arc<Broker>, config: &HandlerConfig) -> Result<(), SessionError>
where
    T: Transport,
{
    let (mut session, mut mailbox) = Session::new(Arc::clone(&broker), now());
    let peer = transport
        .extra_info(PEER_ADDRESS)
        .unwrap_or_else(|| "unknown peer".to_owned());
    info!("Session {}: connection from {}", session.id(), peer);

    let mut buffer = BytesMut::with_capacity(config.read_buffer_capacity);
    let connect_deadline = Instant::now() + config.connect_timeout;
    let max_packet_size = broker.config().max_packet_size;
    let result = run(
        &mut transport,
        &mut session,
        &mut mailbox,
        &mut buffer,
        max_packet_size,
        connect_deadline,
    )
    .await;

    if let Some(last) = session.close(result.as_ref().err(), now()) {
        if let Err(e) = send(&mut transport, &session, vec![last]).await {
            debug!("Session {}: final packet not delivered: {}", session.id(), e);
        }
    }
    if let Err(e) = transport.close().await {
        trace!("Session {}: close error: {}", session.id(), e);
    }
    let _ = transport.wait_closed().await;
    info!("Session {} for {} cleanup complete", session.id(), peer);

    match result {
        Err(SessionError::EndOfStream) => Ok(()),
        other => other,
    }
}

async fn run<T>(
    transport: &mut T,
    session: &mut Session,
    mailbox: &mut Mailbox,
    buffer: &mut BytesMut,
    max_packet_size: usize,
    connect_deadline: Instant,
) -> Result<(), SessionError>
where
    T: Transport,
{
    loop {
        if session.is_closing() {
            return Ok(());
        }

        let deadline = match session.state() {
            SessionState::AwaitingConnect => Some(connect_deadline),
            _ => session.next_deadline().map(Instant::from_std),
        };
        let timer = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            read_result = read_frame(transport, buffer, max_packet_size) => {
                let Some(frame) = read_result? else {
                    info!("Session {} closed connection (EOF)", session.id());
                    return Err(SessionError::EndOfStream);
                };
                let packet = session.decode_frame(&frame)?;
                log_packet(session, "Received", &packet);
                let out = session.handle_packet(packet, now())?;
                send(transport, session, out).await?;
            }

            Some(event) = mailbox.recv() => {
                trace!("Session {}: outbound event", session.id());
                let out = session.handle_delivery(event, now())?;
                send(transport, session, out).await?;
            }

            _ = timer => {
                if session.state() == SessionState::AwaitingConnect {
                    warn!("Session {}: no CONNECT within the connect timeout", session.id());
                    return Ok(());
                }
                let out = session.poll(now())?;
                send(transport, session, out).await?;
            }
        }
    }
}
