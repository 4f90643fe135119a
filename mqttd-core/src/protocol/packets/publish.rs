use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::packets::{ensure_consumed, require_packet_id, PacketEncoder};
use crate::protocol::properties::Properties;
use crate::protocol::qos::QoS;
use crate::protocol::utils::{read_string, read_u16, write_string};
use crate::protocol::{PacketType, ProtocolError, ProtocolVersion};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PublishFlags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishFlags {
    pub const fn to_nibble(self) -> u8 {
        let dup = if self.dup { 1u8 } else { 0u8 };
        let retain = if self.retain { 1u8 } else { 0u8 };
        (dup << 3) | ((self.qos as u8) << 1) | retain
    }

    pub fn from_nibble(nibble: u8) -> Result<Self, ProtocolError> {
        let qos = QoS::from_u8((nibble >> 1) & 0b11)?;
        let dup = (nibble & 0b1000) != 0;
        if dup && qos == QoS::AtMostOnce {
            return Err(ProtocolError::InvalidFixedHeaderFlags {
                packet_type: PacketType::Publish,
                flags: nibble,
            });
        }
        Ok(PublishFlags {
            dup,
            qos,
            retain: (nibble & 0b0001) != 0,
        })
    }
}

/// Fixed Header
///   byte 1:  0x3N                      (type=3, flags=DUP|QoS|RETAIN)
///   bytes :  Remaining Length (var-int)
///
/// Variable Header
///   Topic Name         (UTF-8 string, may be empty in 5.0 when a Topic Alias is set)
///   Packet Identifier  (2 bytes)       [if QoS > 0]
///   Properties         (5.0 only)
///
/// Payload
///   Application message, everything up to the end of the packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic_name: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    pub properties: Properties,
}

impl PublishPacket {
    pub fn new(
        topic_name: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        packet_id: Option<u16>,
        retain: bool,
    ) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id,
            payload: payload.into(),
            qos,
            dup: false,
            retain,
            properties: Properties::new(),
        }
    }

    pub fn flags(&self) -> PublishFlags {
        PublishFlags {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        }
    }
}

impl PacketEncoder for PublishPacket {
    fn encode_body(&self, version: ProtocolVersion, buffer: &mut BytesMut) {
        write_string(&self.topic_name, buffer);
        if self.qos != QoS::AtMostOnce {
            buffer.put_u16(self.packet_id.unwrap_or_default());
        }
        if version.is_v5() {
            self.properties.encode(buffer);
        }
        buffer.put_slice(&self.payload);
    }

    fn decode_body(body: &[u8], flags: u8, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let flags = PublishFlags::from_nibble(flags)?;
        let mut offset = 0;
        let topic_name = read_string(body, &mut offset)?.to_owned();

        let packet_id = if flags.qos != QoS::AtMostOnce {
            Some(require_packet_id(read_u16(body, &mut offset)?)?)
        } else {
            None
        };

        let properties = if version.is_v5() {
            Properties::decode(body, &mut offset)?
        } else {
            Properties::new()
        };

        let payload = Bytes::copy_from_slice(&body[offset..]);
        ensure_consumed(body, offset + payload.len())?;

        Ok(Self {
            topic_name,
            packet_id,
            payload,
            qos: flags.qos,
            dup: flags.dup,
            retain: flags.retain,
            properties,
        })
    }
}
