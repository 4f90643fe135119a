//! Per-connection session state machine
//!
//! A [`Session`] performs no I/O. The driver feeds it decoded packets, mailbox
//! events and clock ticks, and writes back whatever packets it returns.
//!
//! ```text
//! AwaitingConnect ──CONNECT──▶ Connected ──DISCONNECT/EOF/timeout──▶ Disconnecting ──▶ Closed
//!        │                                                                              ▲
//!        └────────────────────────── refused CONNECT ───────────────────────────────────┘
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use nonzero_ext::nonzero;
use tokio::sync::mpsc;

use crate::broker::{Broker, Mailbox, MailboxSender, Outbound};
use crate::error::{BrokerError, ErrorKind, SessionError};
use crate::limits::{self, DirectLimiter};
use crate::message::{Delivery, Message};
use crate::protocol::packets::{
    AckPacket, ConnAckPacket, ConnectPacket, DisconnectPacket, LastWill, PublishPacket, SubAckPacket,
    SubscribePacket, UnsubAckPacket, UnsubscribePacket,
};
use crate::protocol::{Packet, PropertyId, ProtocolError, ProtocolVersion, QoS, ReasonCode};
use crate::topics::validate_topic_name;
use crate::SessionId;

/// Receive Maximum assumed when CONNECT carries none
const DEFAULT_RECEIVE_MAXIMUM: NonZeroU16 = nonzero!(65_535u16);

/// Session state machine
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    AwaitingConnect,
    Connected,
    /// Final packets are being flushed; the driver closes the transport next
    Disconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

/// An outbound QoS 1/2 message awaiting acknowledgement
#[derive(Debug)]
struct InFlight {
    publish: PublishPacket,
    stage: Stage,
    retries: u32,
    deadline: Instant,
}

pub struct Session {
    id: SessionId,
    broker: Arc<Broker>,
    state: SessionState,
    version: ProtocolVersion,
    client_id: String,
    keep_alive: u16,
    last_activity: Instant,
    will: Option<LastWill>,
    normal_disconnect: bool,
    /// A CONNECT frame arrived, whether or not it decoded
    connect_received: bool,
    /// Handed to the broker on CONNECT
    mailbox: Option<MailboxSender>,
    registered: bool,
    limiter: Option<DirectLimiter>,
    topic_aliases: HashMap<u16, String>,
    /// Inbound QoS 2 messages held until PUBREL
    awaiting_release: HashMap<u16, PublishPacket>,
    /// Fingerprint of the last QoS 1 message accepted per packet id, to spot DUP resends
    last_qos1: HashMap<u16, u64>,
    in_flight: BTreeMap<u16, InFlight>,
    pending: VecDeque<Delivery>,
    next_packet_id: u16,
    /// Client's Receive Maximum: outbound QoS 1/2 messages allowed in flight
    receive_maximum: NonZeroU16,
    max_outbound_packet: Option<usize>,
    shutting_down: bool,
}

impl Session {
    /// Creates a session awaiting CONNECT, with the mailbox the broker will feed.
    pub fn new(broker: Arc<Broker>, now: Instant) -> (Self, Mailbox) {
        let (sender, mailbox) = mpsc::unbounded_channel();
        let id = broker.next_session_id();
        let limiter = broker.limits().connection_limiter();
        let session = Self {
            id,
            broker,
            state: SessionState::AwaitingConnect,
            version: ProtocolVersion::V311,
            client_id: String::new(),
            keep_alive: 0,
            last_activity: now,
            will: None,
            normal_disconnect: false,
            connect_received: false,
            mailbox: Some(sender),
            registered: false,
            limiter,
            topic_aliases: HashMap::new(),
            awaiting_release: HashMap::new(),
            last_qos1: HashMap::new(),
            in_flight: BTreeMap::new(),
            pending: VecDeque::new(),
            next_packet_id: 1,
            receive_maximum: DEFAULT_RECEIVE_MAXIMUM,
            max_outbound_packet: None,
            shutting_down: false,
        };
        (session, mailbox)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Version packets are encoded and decoded with
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    /// Whether the driver should flush and close the transport
    pub fn is_closing(&self) -> bool {
        matches!(self.state, SessionState::Disconnecting | SessionState::Closed)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Decodes one complete frame from the client. A CONNECT's protocol level
    /// is adopted before its body is validated, so a malformed 5.0 CONNECT
    /// can still be refused with a 5.0 CONNACK.
    pub fn decode_frame(&mut self, frame: &[u8]) -> Result<Packet, SessionError> {
        if self.state == SessionState::AwaitingConnect {
            if let Some(version) = Packet::connect_version(frame) {
                self.connect_received = true;
                self.version = version;
            }
        }
        let (packet, _) = Packet::decode(frame, self.version)?;
        Ok(packet)
    }

    /// Processes one packet from the client, returning the packets to send back.
    pub fn handle_packet(&mut self, packet: Packet, now: Instant) -> Result<Vec<Packet>, SessionError> {
        self.last_activity = now;
        match self.state {
            SessionState::AwaitingConnect => match packet {
                Packet::Connect(connect) => {
                    self.connect_received = true;
                    self.handle_connect(connect)
                }
                _ => Err(SessionError::violation("first packet was not CONNECT")),
            },
            SessionState::Connected => self.handle_connected(packet, now),
            SessionState::Disconnecting | SessionState::Closed => Ok(Vec::new()),
        }
    }

    fn handle_connected(&mut self, packet: Packet, now: Instant) -> Result<Vec<Packet>, SessionError> {
        let mut out = Vec::new();
        match packet {
            Packet::Connect(_) => return Err(SessionError::violation("second CONNECT on a live session")),
            Packet::Publish(publish) => self.handle_publish(publish, now, &mut out)?,
            Packet::PubAck(ack) => self.handle_puback(ack, now, &mut out),
            Packet::PubRec(ack) => self.handle_pubrec(ack, now, &mut out),
            Packet::PubRel(ack) => self.handle_pubrel(ack, now, &mut out),
            Packet::PubComp(ack) => self.handle_pubcomp(ack, now, &mut out),
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe, now, &mut out),
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe, &mut out),
            Packet::PingReq => out.push(Packet::PingResp),
            Packet::Disconnect(disconnect) => self.handle_disconnect(disconnect),
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                return Err(SessionError::violation("client sent a server-only packet"));
            }
        }
        Ok(out)
    }

    // ===== CONNECT =====

    fn handle_connect(&mut self, connect: ConnectPacket) -> Result<Vec<Packet>, SessionError> {
        self.version = connect.protocol_version;
        let broker = Arc::clone(&self.broker);
        let config = broker.config();

        if !broker.is_accepting() {
            return Ok(self.refuse(ReasonCode::SERVER_UNAVAILABLE));
        }

        let mut assigned = false;
        let client_id = if connect.client_id.is_empty() {
            if !self.version.is_v5() && !connect.clean_start {
                return Ok(self.refuse(ReasonCode::CLIENT_IDENTIFIER_NOT_VALID));
            }
            assigned = true;
            format!("mqttd-{:016x}", self.id)
        } else {
            connect.client_id
        };

        let receive_maximum = match connect.properties.receive_maximum().map(NonZeroU16::new) {
            Some(Some(n)) => n,
            Some(None) => return Ok(self.refuse(ReasonCode::PROTOCOL_ERROR)),
            None => DEFAULT_RECEIVE_MAXIMUM,
        };

        if let Some(will) = &connect.will {
            if let Err(error) = validate_topic_name(&will.topic) {
                // 3.1.1 has no return code for this and closes without a CONNACK
                if self.version.is_v5() {
                    return Ok(self.refuse(ReasonCode::TOPIC_NAME_INVALID));
                }
                return Err(error.into());
            }
            if will.qos > config.max_qos {
                return Ok(self.refuse(ReasonCode::QOS_NOT_SUPPORTED));
            }
            if will.retain && !config.retained_enabled {
                return Ok(self.refuse(ReasonCode::RETAIN_NOT_SUPPORTED));
            }
        }

        let mut keep_alive = connect.keep_alive;
        let mut server_keep_alive = None;
        if self.version.is_v5() && keep_alive > config.max_keep_alive {
            keep_alive = config.max_keep_alive;
            server_keep_alive = Some(keep_alive);
        }

        self.client_id = client_id;
        self.keep_alive = keep_alive;
        self.will = connect.will;
        self.receive_maximum = receive_maximum;
        self.max_outbound_packet = connect
            .properties
            .get_u32(PropertyId::MaximumPacketSize)
            .map(|max| max as usize);

        if let Some(sender) = self.mailbox.take() {
            broker.register_session(self.id, &self.client_id, sender);
            self.registered = true;
        }
        self.state = SessionState::Connected;

        let mut connack = ConnAckPacket::accepted(false);
        if self.version.is_v5() {
            let properties = &mut connack.properties;
            if assigned {
                properties.set_string(PropertyId::AssignedClientIdentifier, self.client_id.clone());
            }
            if let Some(keep_alive) = server_keep_alive {
                properties.set_u16(PropertyId::ServerKeepAlive, keep_alive);
            }
            if config.receive_maximum != u16::MAX {
                properties.set_u16(PropertyId::ReceiveMaximum, config.receive_maximum);
            }
            if config.topic_alias_maximum > 0 {
                properties.set_u16(PropertyId::TopicAliasMaximum, config.topic_alias_maximum);
            }
            if config.max_qos != QoS::ExactlyOnce {
                properties.set_u8(PropertyId::MaximumQoS, config.max_qos as u8);
            }
            if !config.retained_enabled {
                properties.set_u8(PropertyId::RetainAvailable, 0);
            }
            properties.set_u32(
                PropertyId::MaximumPacketSize,
                config.max_packet_size.min(u32::MAX as usize) as u32,
            );
            properties.set_u8(PropertyId::SharedSubscriptionAvailable, 0);
        }

        info!(
            "Session {}: client {} connected ({}, keep alive {}s)",
            self.id, self.client_id, self.version, self.keep_alive
        );
        Ok(vec![Packet::ConnAck(connack)])
    }

    fn refuse(&mut self, reason: ReasonCode) -> Vec<Packet> {
        info!("Session {}: CONNECT refused: {}", self.id, reason);
        self.state = SessionState::Disconnecting;
        vec![Packet::ConnAck(ConnAckPacket::refused(reason))]
    }

    // ===== INBOUND PUBLISH =====

    fn handle_publish(
        &mut self,
        mut publish: PublishPacket,
        now: Instant,
        out: &mut Vec<Packet>,
    ) -> Result<(), SessionError> {
        let broker = Arc::clone(&self.broker);
        let config = broker.config();

        if self.version.is_v5() {
            self.resolve_topic_alias(&mut publish)?;
        }
        validate_topic_name(&publish.topic_name)?;

        if publish.qos > config.max_qos {
            return Err(SessionError::ProtocolViolation {
                reason: ReasonCode::QOS_NOT_SUPPORTED,
                detail: "PUBLISH QoS above the server maximum",
            });
        }
        if publish.retain && !config.retained_enabled && self.version.is_v5() {
            return Err(SessionError::ProtocolViolation {
                reason: ReasonCode::RETAIN_NOT_SUPPORTED,
                detail: "retained PUBLISH while retain is unavailable",
            });
        }

        let packet_id = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => 0,
            (_, Some(id)) => id,
            (_, None) => return Err(ProtocolError::MissingPacketId.into()),
        };

        match publish.qos {
            QoS::ExactlyOnce => {
                if let Some(held) = self.awaiting_release.get(&packet_id) {
                    if held.topic_name == publish.topic_name && held.payload == publish.payload {
                        trace!("Session {}: duplicate PUBLISH {} before PUBREL", self.id, packet_id);
                        out.push(Packet::PubRec(AckPacket::new(packet_id)));
                        return Ok(());
                    }
                    return Err(SessionError::ProtocolViolation {
                        reason: ReasonCode::PACKET_IDENTIFIER_IN_USE,
                        detail: "packet identifier reused before PUBREL",
                    });
                }
                if self.version.is_v5() && self.awaiting_release.len() >= usize::from(config.receive_maximum) {
                    return Err(SessionError::ProtocolViolation {
                        reason: ReasonCode::RECEIVE_MAXIMUM_EXCEEDED,
                        detail: "too many unreleased QoS 2 messages",
                    });
                }
            }
            QoS::AtLeastOnce if publish.dup => {
                let resent = self.last_qos1.get(&packet_id) == Some(&fingerprint(&publish));
                if resent {
                    trace!("Session {}: duplicate QoS 1 PUBLISH {}", self.id, packet_id);
                    out.push(Packet::PubAck(AckPacket::new(packet_id)));
                    return Ok(());
                }
            }
            _ => {}
        }

        if let Err(error) = self.check_rate() {
            return self.reject_publish(publish.qos, packet_id, error, out);
        }

        match publish.qos {
            QoS::AtMostOnce => self.forward(publish, now),
            QoS::AtLeastOnce => {
                self.last_qos1.insert(packet_id, fingerprint(&publish));
                self.forward(publish, now);
                out.push(Packet::PubAck(AckPacket::new(packet_id)));
            }
            QoS::ExactlyOnce => {
                self.awaiting_release.insert(packet_id, publish);
                out.push(Packet::PubRec(AckPacket::new(packet_id)));
            }
        }
        Ok(())
    }

    fn resolve_topic_alias(&mut self, publish: &mut PublishPacket) -> Result<(), SessionError> {
        let Some(alias) = publish.properties.topic_alias() else {
            return Ok(());
        };
        if alias == 0 || alias > self.broker.config().topic_alias_maximum {
            return Err(SessionError::ProtocolViolation {
                reason: ReasonCode::TOPIC_ALIAS_INVALID,
                detail: "topic alias outside the negotiated range",
            });
        }
        if publish.topic_name.is_empty() {
            match self.topic_aliases.get(&alias) {
                Some(topic) => publish.topic_name = topic.clone(),
                None => return Err(SessionError::violation("unknown topic alias without a topic")),
            }
        } else {
            self.topic_aliases.insert(alias, publish.topic_name.clone());
        }
        Ok(())
    }

    /// Per-connection bucket first, then the broker-wide one
    fn check_rate(&self) -> Result<(), BrokerError> {
        limits::check(self.limiter.as_ref(), limits::MESSAGES)?;
        self.broker.limits().check_publish()
    }

    fn reject_publish(
        &mut self,
        qos: QoS,
        packet_id: u16,
        error: BrokerError,
        out: &mut Vec<Packet>,
    ) -> Result<(), SessionError> {
        // 3.1.1 has no negative acknowledgement and dropping silently loses the message
        if !self.version.is_v5() {
            return Err(error.into());
        }
        warn!("Session {}: PUBLISH rejected: {}", self.id, error);
        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => out.push(Packet::PubAck(AckPacket::with_reason(
                packet_id,
                ReasonCode::QUOTA_EXCEEDED,
            ))),
            QoS::ExactlyOnce => out.push(Packet::PubRec(AckPacket::with_reason(
                packet_id,
                ReasonCode::QUOTA_EXCEEDED,
            ))),
        }
        Ok(())
    }

    fn forward(&self, publish: PublishPacket, now: Instant) {
        let message = Message::from_publish(publish, self.id, now);
        let topic = message.topic.clone();
        let routed = self.broker.dispatch(message);
        trace!("Session {}: PUBLISH on {} routed to {} sessions", self.id, topic, routed.len());
    }

    fn handle_pubrel(&mut self, ack: AckPacket, now: Instant, out: &mut Vec<Packet>) {
        match self.awaiting_release.remove(&ack.packet_id) {
            Some(publish) => {
                self.forward(publish, now);
                out.push(Packet::PubComp(AckPacket::new(ack.packet_id)));
            }
            None => {
                debug!("Session {}: PUBREL {} for no held message", self.id, ack.packet_id);
                out.push(Packet::PubComp(AckPacket::with_reason(
                    ack.packet_id,
                    ReasonCode::PACKET_IDENTIFIER_NOT_FOUND,
                )));
            }
        }
    }

    // ===== OUTBOUND DELIVERY =====

    /// Processes one mailbox event.
    pub fn handle_delivery(&mut self, outbound: Outbound, now: Instant) -> Result<Vec<Packet>, SessionError> {
        let mut out = Vec::new();
        match outbound {
            Outbound::Deliver(delivery) => {
                if self.state == SessionState::Connected {
                    self.deliver(delivery, now, &mut out);
                }
            }
            Outbound::Evicted => return Err(SessionError::Evicted),
            Outbound::Shutdown => {
                self.shutting_down = true;
                if self.in_flight.is_empty() {
                    self.finish_shutdown(&mut out);
                }
            }
        }
        Ok(out)
    }

    fn deliver(&mut self, delivery: Delivery, now: Instant, out: &mut Vec<Packet>) {
        if self.shutting_down {
            debug!("Session {}: shutting down, dropping message on {}", self.id, delivery.message.topic);
            return;
        }
        if delivery.qos == QoS::AtMostOnce {
            let packet = Packet::Publish(delivery.into_publish(None, now));
            if self.fits(&packet) {
                out.push(packet);
            }
            return;
        }
        if self.in_flight.len() >= usize::from(self.receive_maximum.get()) {
            self.pending.push_back(delivery);
            return;
        }
        self.send_tracked(delivery, now, out);
    }

    fn send_tracked(&mut self, delivery: Delivery, now: Instant, out: &mut Vec<Packet>) -> bool {
        let Some(packet_id) = self.allocate_packet_id() else {
            self.pending.push_front(delivery);
            return false;
        };
        let stage = if delivery.qos == QoS::AtLeastOnce {
            Stage::AwaitingPubAck
        } else {
            Stage::AwaitingPubRec
        };
        let publish = delivery.into_publish(Some(packet_id), now);
        let packet = Packet::Publish(publish.clone());
        if !self.fits(&packet) {
            return true;
        }
        // recorded before the PUBLISH leaves, so its ack always finds it
        self.in_flight.insert(
            packet_id,
            InFlight {
                publish,
                stage,
                retries: 0,
                deadline: now + self.broker.config().retry_delay(0),
            },
        );
        out.push(packet);
        true
    }

    /// Drops packets larger than the client's Maximum Packet Size
    fn fits(&self, packet: &Packet) -> bool {
        let Some(max) = self.max_outbound_packet else {
            return true;
        };
        let size = packet.to_bytes(self.version).len();
        if size > max {
            debug!("Session {}: dropping {} byte packet, client maximum is {}", self.id, size, max);
            return false;
        }
        true
    }

    fn allocate_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.in_flight.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn release_pending(&mut self, now: Instant, out: &mut Vec<Packet>) {
        while self.in_flight.len() < usize::from(self.receive_maximum.get()) {
            let Some(delivery) = self.pending.pop_front() else {
                break;
            };
            if !self.send_tracked(delivery, now, out) {
                break;
            }
        }
        if self.shutting_down && self.in_flight.is_empty() {
            self.finish_shutdown(out);
        }
    }

    fn finish_shutdown(&mut self, out: &mut Vec<Packet>) {
        if self.state != SessionState::Connected {
            return;
        }
        if self.version.is_v5() {
            out.push(Packet::Disconnect(DisconnectPacket::new(ReasonCode::SERVER_SHUTTING_DOWN)));
        }
        self.state = SessionState::Disconnecting;
    }

    fn in_flight_stage(&self, packet_id: u16) -> Option<Stage> {
        self.in_flight.get(&packet_id).map(|f| f.stage)
    }

    fn handle_puback(&mut self, ack: AckPacket, now: Instant, out: &mut Vec<Packet>) {
        if self.in_flight_stage(ack.packet_id) == Some(Stage::AwaitingPubAck) {
            self.in_flight.remove(&ack.packet_id);
            self.release_pending(now, out);
        } else {
            debug!("Session {}: PUBACK {} matches nothing in flight", self.id, ack.packet_id);
        }
    }

    fn handle_pubrec(&mut self, ack: AckPacket, now: Instant, out: &mut Vec<Packet>) {
        match self.in_flight_stage(ack.packet_id) {
            Some(Stage::AwaitingPubRec) if ack.reason_code.is_error() => {
                debug!("Session {}: PUBREC {} refused: {}", self.id, ack.packet_id, ack.reason_code);
                self.in_flight.remove(&ack.packet_id);
                self.release_pending(now, out);
            }
            Some(Stage::AwaitingPubRec) => {
                let first_retry = now + self.broker.config().retry_delay(0);
                if let Some(flight) = self.in_flight.get_mut(&ack.packet_id) {
                    flight.stage = Stage::AwaitingPubComp;
                    flight.retries = 0;
                    flight.deadline = first_retry;
                }
                out.push(Packet::PubRel(AckPacket::new(ack.packet_id)));
            }
            Some(Stage::AwaitingPubComp) => out.push(Packet::PubRel(AckPacket::new(ack.packet_id))),
            _ => out.push(Packet::PubRel(AckPacket::with_reason(
                ack.packet_id,
                ReasonCode::PACKET_IDENTIFIER_NOT_FOUND,
            ))),
        }
    }

    fn handle_pubcomp(&mut self, ack: AckPacket, now: Instant, out: &mut Vec<Packet>) {
        if self.in_flight_stage(ack.packet_id) == Some(Stage::AwaitingPubComp) {
            self.in_flight.remove(&ack.packet_id);
            self.release_pending(now, out);
        } else {
            debug!("Session {}: PUBCOMP {} matches nothing in flight", self.id, ack.packet_id);
        }
    }

    // ===== SUBSCRIPTIONS =====

    fn handle_subscribe(&mut self, subscribe: SubscribePacket, now: Instant, out: &mut Vec<Packet>) {
        let identifier = subscribe.subscription_identifier();
        let mut reason_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut retained = Vec::new();

        for subscription in &subscribe.subscriptions {
            match self
                .broker
                .subscribe(self.id, &subscription.filter, subscription.options, identifier, now)
            {
                Ok(subscribed) => {
                    reason_codes.push(ReasonCode::granted(subscribed.granted));
                    retained.extend(subscribed.retained);
                }
                Err(error) => {
                    warn!("Session {}: SUBSCRIBE {} failed: {}", self.id, subscription.filter, error);
                    reason_codes.push(match error {
                        BrokerError::RateLimited { .. } => ReasonCode::QUOTA_EXCEEDED,
                        BrokerError::InvalidTopicFilter { .. } => ReasonCode::TOPIC_FILTER_INVALID,
                        _ => ReasonCode::UNSPECIFIED_ERROR,
                    });
                }
            }
        }

        out.push(Packet::SubAck(SubAckPacket::new(subscribe.packet_id, reason_codes)));
        for delivery in retained {
            self.deliver(delivery, now, out);
        }
    }

    fn handle_unsubscribe(&mut self, unsubscribe: UnsubscribePacket, out: &mut Vec<Packet>) {
        let reason_codes = unsubscribe
            .topic_filters
            .iter()
            .map(|filter| match self.broker.unsubscribe(self.id, filter) {
                Ok(true) => ReasonCode::SUCCESS,
                Ok(false) => ReasonCode::NO_SUBSCRIPTION_EXISTED,
                Err(_) => ReasonCode::TOPIC_FILTER_INVALID,
            })
            .collect();
        out.push(Packet::UnsubAck(UnsubAckPacket::new(unsubscribe.packet_id, reason_codes)));
    }

    fn handle_disconnect(&mut self, disconnect: DisconnectPacket) {
        // 0x04 asks for the will to be published anyway
        self.normal_disconnect = disconnect.reason_code == ReasonCode::NORMAL_DISCONNECTION;
        info!(
            "Session {}: client {} disconnected ({})",
            self.id, self.client_id, disconnect.reason_code
        );
        self.state = SessionState::Disconnecting;
    }

    // ===== TIMERS =====

    fn keep_alive_deadline(&self) -> Option<Instant> {
        if self.state != SessionState::Connected || self.keep_alive == 0 {
            return None;
        }
        Some(self.last_activity + Duration::from_millis(u64::from(self.keep_alive) * 1500))
    }

    /// Earliest instant at which [`Session::poll`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let retransmit = self.in_flight.values().map(|f| f.deadline).min();
        match (self.keep_alive_deadline(), retransmit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Enforces keepalive and resends unacknowledged messages with DUP set.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<Packet>, SessionError> {
        if self.state != SessionState::Connected {
            return Ok(Vec::new());
        }
        if self.keep_alive_deadline().is_some_and(|deadline| now >= deadline) {
            return Err(SessionError::KeepAliveTimeout {
                keep_alive: self.keep_alive,
            });
        }

        let config = self.broker.config();
        let mut out = Vec::new();
        for (packet_id, flight) in self.in_flight.iter_mut() {
            if flight.deadline > now {
                continue;
            }
            if flight.retries >= config.max_retries {
                return Err(SessionError::RetriesExhausted { packet_id: *packet_id });
            }
            flight.retries += 1;
            flight.deadline = now + config.retry_delay(flight.retries);
            debug!("Session {}: resending {} (attempt {})", self.id, packet_id, flight.retries);
            match flight.stage {
                Stage::AwaitingPubAck | Stage::AwaitingPubRec => {
                    let mut publish = flight.publish.clone();
                    publish.dup = true;
                    out.push(Packet::Publish(publish));
                }
                Stage::AwaitingPubComp => out.push(Packet::PubRel(AckPacket::new(*packet_id))),
            }
        }
        Ok(out)
    }

    // ===== TEARDOWN =====

    /// Ends the session. Returns a last packet to send when the cause warrants
    /// one: a v5 DISCONNECT, or a CONNACK refusing an unsupported protocol level
    /// or a malformed 5.0 CONNECT.
    /// Publishes the will unless the client disconnected normally.
    pub fn close(&mut self, error: Option<&SessionError>, now: Instant) -> Option<Packet> {
        if self.state == SessionState::Closed {
            return None;
        }

        let packet = match error {
            Some(SessionError::Protocol {
                error: ProtocolError::UnsupportedProtocolLevel { .. },
            }) if self.state == SessionState::AwaitingConnect => Some(Packet::ConnAck(ConnAckPacket::refused(
                ReasonCode::UNSUPPORTED_PROTOCOL_VERSION,
            ))),
            Some(error)
                if self.state == SessionState::AwaitingConnect
                    && self.connect_received
                    && self.version.is_v5()
                    && matches!(error.kind(), ErrorKind::MalformedPacket | ErrorKind::ProtocolViolation) =>
            {
                error
                    .disconnect_reason()
                    .map(|reason| Packet::ConnAck(ConnAckPacket::refused(reason)))
            }
            Some(error) if self.state == SessionState::Connected && self.version.is_v5() => error
                .disconnect_reason()
                .map(|reason| Packet::Disconnect(DisconnectPacket::new(reason))),
            _ => None,
        };

        match error {
            Some(error) => info!("Session {}: closing: {} ({})", self.id, error, error.kind()),
            None => debug!("Session {}: closed", self.id),
        }

        self.state = SessionState::Closed;
        self.awaiting_release.clear();
        self.in_flight.clear();
        self.pending.clear();

        if self.registered {
            self.registered = false;
            self.broker.remove_session(self.id);
            if let Some(will) = self.will.take() {
                if !self.normal_disconnect {
                    info!("Session {}: publishing will on {}", self.id, will.topic);
                    self.broker.dispatch(Message::from_will(will, self.id, now));
                }
            }
        }
        packet
    }
}

/// Topic and payload hash identifying a resent QoS 1 PUBLISH without keeping
/// the payload alive
fn fingerprint(publish: &PublishPacket) -> u64 {
    let mut hasher = DefaultHasher::new();
    publish.topic_name.hash(&mut hasher);
    publish.payload.hash(&mut hasher);
    hasher.finish()
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.registered {
            self.broker.remove_session(self.id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("in_flight", &self.in_flight.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
