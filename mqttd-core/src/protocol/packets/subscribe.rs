use bytes::{BufMut, BytesMut};

use crate::protocol::packets::{require_packet_id, PacketEncoder};
use crate::protocol::properties::Properties;
use crate::protocol::qos::QoS;
use crate::protocol::utils::{read_string, read_u16, read_u8, write_string};
use crate::protocol::{PacketType, ProtocolError, ProtocolVersion};

/// When retained messages are sent for a new subscription (5.0)
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RetainHandling {
    #[default]
    SendOnSubscribe = 0,
    SendIfNewSubscription = 1,
    DoNotSend = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            ..Self::default()
        }
    }

    pub fn to_byte(self, version: ProtocolVersion) -> u8 {
        let mut byte = self.qos as u8;
        if version.is_v5() {
            byte |= (self.no_local as u8) << 2;
            byte |= (self.retain_as_published as u8) << 3;
            byte |= (self.retain_handling as u8) << 4;
        }
        byte
    }

    pub fn from_byte(byte: u8, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let reserved_mask = if version.is_v5() { 0b1100_0000 } else { 0b1111_1100 };
        if byte & reserved_mask != 0 {
            return Err(ProtocolError::InvalidSubscriptionOptions { options: byte });
        }
        let qos = QoS::from_u8(byte & 0b11)?;
        let retain_handling = match (byte >> 4) & 0b11 {
            0 => RetainHandling::SendOnSubscribe,
            1 => RetainHandling::SendIfNewSubscription,
            2 => RetainHandling::DoNotSend,
            _ => return Err(ProtocolError::InvalidSubscriptionOptions { options: byte }),
        };
        Ok(Self {
            qos,
            no_local: byte & 0b0100 != 0,
            retain_as_published: byte & 0b1000 != 0,
            retain_handling,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub options: SubscriptionOptions,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            options: SubscriptionOptions::new(qos),
        }
    }
}

/// Fixed Header
///   byte 1:  0x82                      (type=8, flags=0010)
///
/// Variable Header
///   Packet Identifier  (2 bytes)
///   Properties         (5.0 only)
///
/// Payload
///   one or more (Topic Filter, Subscription Options) pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
    pub properties: Properties,
}

impl SubscribePacket {
    pub fn new(packet_id: u16, subscriptions: Vec<Subscription>) -> Self {
        Self {
            packet_id,
            subscriptions,
            properties: Properties::new(),
        }
    }

    /// Subscription identifier (5.0) attached to every filter in this request
    pub fn subscription_identifier(&self) -> Option<u32> {
        self.properties.subscription_identifiers().first().copied()
    }
}

impl PacketEncoder for SubscribePacket {
    fn encode_body(&self, version: ProtocolVersion, buffer: &mut BytesMut) {
        buffer.put_u16(self.packet_id);
        if version.is_v5() {
            self.properties.encode(buffer);
        }
        for subscription in &self.subscriptions {
            write_string(&subscription.filter, buffer);
            buffer.put_u8(subscription.options.to_byte(version));
        }
    }

    fn decode_body(body: &[u8], _flags: u8, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let mut offset = 0;
        let packet_id = require_packet_id(read_u16(body, &mut offset)?)?;
        let properties = if version.is_v5() {
            Properties::decode(body, &mut offset)?
        } else {
            Properties::new()
        };

        let mut subscriptions = Vec::new();
        while offset < body.len() {
            let filter = read_string(body, &mut offset)?.to_owned();
            let options = SubscriptionOptions::from_byte(read_u8(body, &mut offset)?, version)?;
            subscriptions.push(Subscription { filter, options });
        }
        if subscriptions.is_empty() {
            return Err(ProtocolError::NoTopicFilters {
                packet_type: PacketType::Subscribe,
            });
        }

        Ok(Self {
            packet_id,
            subscriptions,
            properties,
        })
    }
}
