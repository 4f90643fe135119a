mod ack;
mod connack;
mod connect;
mod disconnect;
mod publish;
mod suback;
mod subscribe;
mod unsuback;
mod unsubscribe;

pub use crate::protocol::packets::ack::AckPacket;
pub use crate::protocol::packets::connack::ConnAckPacket;
pub use crate::protocol::packets::connect::{ConnectFlags, ConnectPacket, LastWill};
pub use crate::protocol::packets::disconnect::DisconnectPacket;
pub use crate::protocol::packets::publish::{PublishFlags, PublishPacket};
pub use crate::protocol::packets::suback::SubAckPacket;
pub use crate::protocol::packets::subscribe::{
    RetainHandling, SubscribePacket, Subscription, SubscriptionOptions,
};
pub use crate::protocol::packets::unsuback::UnsubAckPacket;
pub use crate::protocol::packets::unsubscribe::UnsubscribePacket;

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::packets::connect::MQTT_PROTOCOL_NAME;
use crate::protocol::utils::{read_string, read_u8, read_variable_length, write_variable_length};
use crate::protocol::{PacketType, ProtocolError, ProtocolVersion};

/// Body codec shared by every control packet carrying a variable header.
///
/// The fixed header (type nibble, flags, remaining length) is owned by
/// [`Packet`]; implementors only see the bytes after it.
pub trait PacketEncoder: Sized {
    fn encode_body(&self, version: ProtocolVersion, buffer: &mut BytesMut);
    fn decode_body(body: &[u8], flags: u8, version: ProtocolVersion) -> Result<Self, ProtocolError>;
}

/// Fail if a body decoder left bytes unread
pub(crate) fn ensure_consumed(body: &[u8], offset: usize) -> Result<(), ProtocolError> {
    if offset != body.len() {
        return Err(ProtocolError::InvalidPacketLength {
            expected: offset,
            actual: body.len(),
        });
    }
    Ok(())
}

pub(crate) fn require_packet_id(packet_id: u16) -> Result<u16, ProtocolError> {
    if packet_id == 0 {
        return Err(ProtocolError::MissingPacketId);
    }
    Ok(packet_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(AckPacket),
    PubRec(AckPacket),
    PubRel(AckPacket),
    PubComp(AckPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect(DisconnectPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect(_) => PacketType::Disconnect,
        }
    }

    pub fn header_first_byte(&self) -> u8 {
        let flags = match self {
            Packet::Publish(publish) => publish.flags().to_nibble(),
            other => other.packet_type().required_flags().unwrap_or(0),
        };
        ((self.packet_type() as u8) << 4) | (flags & 0x0F)
    }

    /// Length of the first complete frame in `bytes`, or `None` while more
    /// bytes are needed. A frame larger than `max_packet_size` is rejected as
    /// soon as its remaining length is known.
    pub fn frame_length(bytes: &[u8], max_packet_size: usize) -> Result<Option<usize>, ProtocolError> {
        if bytes.len() < 2 {
            return Ok(None);
        }
        let (remaining_length, len_bytes) = match read_variable_length(&bytes[1..]) {
            Ok(parsed) => parsed,
            Err(e) if e.is_incomplete() => return Ok(None),
            Err(e) => return Err(e),
        };
        let total = 1 + len_bytes + remaining_length;
        if total > max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                max_size: max_packet_size,
                actual_size: total,
            });
        }
        if bytes.len() < total {
            return Ok(None);
        }
        Ok(Some(total))
    }

    /// Protocol level a CONNECT frame announces, read without validating the
    /// rest of the body. `None` for other packets or unknown levels.
    pub fn connect_version(frame: &[u8]) -> Option<ProtocolVersion> {
        if PacketType::from_u8(*frame.first()?)? != PacketType::Connect {
            return None;
        }
        let (_, len_bytes) = read_variable_length(&frame[1..]).ok()?;
        let mut offset = 1 + len_bytes;
        if read_string(frame, &mut offset).ok()? != MQTT_PROTOCOL_NAME {
            return None;
        }
        ProtocolVersion::from_level(read_u8(frame, &mut offset).ok()?)
    }

    /// Decode the first packet in `bytes`, returning it with the number of
    /// bytes it occupied. CONNECT is decoded with the level it announces;
    /// every other packet with `version`.
    pub fn decode(bytes: &[u8], version: ProtocolVersion) -> Result<(Self, usize), ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::IncompletePacket { available: 0 });
        }
        let header = bytes[0];
        let packet_type = PacketType::from_u8(header).ok_or(ProtocolError::InvalidPacketType {
            packet_type: header,
        })?;
        let flags = header & 0x0F;
        if let Some(required) = packet_type.required_flags() {
            if flags != required {
                return Err(ProtocolError::InvalidFixedHeaderFlags { packet_type, flags });
            }
        }

        let (remaining_length, len_bytes) = read_variable_length(&bytes[1..])?;
        let payload_start = 1 + len_bytes;
        let total = payload_start + remaining_length;
        if bytes.len() < total {
            return Err(ProtocolError::IncompletePacket {
                available: bytes.len(),
            });
        }
        let body = &bytes[payload_start..total];

        let packet = Self::decode_frame(packet_type, body, flags, version).map_err(|e| match e {
            // the frame is complete, so a field running past its end is malformed
            ProtocolError::IncompletePacket { .. } => ProtocolError::InvalidPacketLength {
                expected: remaining_length + 1,
                actual: remaining_length,
            },
            other => other,
        })?;
        Ok((packet, total))
    }

    fn decode_frame(
        packet_type: PacketType,
        body: &[u8],
        flags: u8,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        match packet_type {
            PacketType::Connect => Ok(Packet::Connect(ConnectPacket::decode_body(body, flags, version)?)),
            PacketType::ConnAck => Ok(Packet::ConnAck(ConnAckPacket::decode_body(body, flags, version)?)),
            PacketType::Publish => Ok(Packet::Publish(PublishPacket::decode_body(body, flags, version)?)),
            PacketType::PubAck => Ok(Packet::PubAck(AckPacket::decode_body(body, flags, version)?)),
            PacketType::PubRec => Ok(Packet::PubRec(AckPacket::decode_body(body, flags, version)?)),
            PacketType::PubRel => Ok(Packet::PubRel(AckPacket::decode_body(body, flags, version)?)),
            PacketType::PubComp => Ok(Packet::PubComp(AckPacket::decode_body(body, flags, version)?)),
            PacketType::Subscribe => {
                Ok(Packet::Subscribe(SubscribePacket::decode_body(body, flags, version)?))
            }
            PacketType::SubAck => Ok(Packet::SubAck(SubAckPacket::decode_body(body, flags, version)?)),
            PacketType::Unsubscribe => {
                Ok(Packet::Unsubscribe(UnsubscribePacket::decode_body(body, flags, version)?))
            }
            PacketType::UnsubAck => {
                Ok(Packet::UnsubAck(UnsubAckPacket::decode_body(body, flags, version)?))
            }
            PacketType::PingReq | PacketType::PingResp => {
                ensure_consumed(body, 0)?;
                Ok(if packet_type == PacketType::PingReq {
                    Packet::PingReq
                } else {
                    Packet::PingResp
                })
            }
            PacketType::Disconnect => {
                Ok(Packet::Disconnect(DisconnectPacket::decode_body(body, flags, version)?))
            }
            PacketType::Reserved | PacketType::Auth => Err(ProtocolError::InvalidPacketType {
                packet_type: (packet_type as u8) << 4 | flags,
            }),
        }
    }

    pub fn encode(&self, version: ProtocolVersion, buffer: &mut BytesMut) {
        let mut body = BytesMut::new();
        match self {
            Packet::Connect(connect) => connect.encode_body(version, &mut body),
            Packet::ConnAck(connack) => connack.encode_body(version, &mut body),
            Packet::Publish(publish) => publish.encode_body(version, &mut body),
            Packet::PubAck(ack) | Packet::PubRec(ack) | Packet::PubRel(ack) | Packet::PubComp(ack) => {
                ack.encode_body(version, &mut body)
            }
            Packet::Subscribe(subscribe) => subscribe.encode_body(version, &mut body),
            Packet::SubAck(suback) => suback.encode_body(version, &mut body),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.encode_body(version, &mut body),
            Packet::UnsubAck(unsuback) => unsuback.encode_body(version, &mut body),
            Packet::PingReq | Packet::PingResp => {}
            Packet::Disconnect(disconnect) => disconnect.encode_body(version, &mut body),
        }

        buffer.reserve(5 + body.len());
        buffer.put_u8(self.header_first_byte());
        write_variable_length(body.len(), buffer);
        buffer.put_slice(&body);
    }

    /// Encode into a standalone frame
    pub fn to_bytes(&self, version: ProtocolVersion) -> Bytes {
        let mut buffer = BytesMut::new();
        self.encode(version, &mut buffer);
        buffer.freeze()
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Decode `bytes` as one frame, re-encode it and require identical bytes
    pub fn roundtrip_test(bytes: &[u8], version: ProtocolVersion) -> Packet {
        let result = Packet::decode(bytes, version);
        assert!(result.is_ok(), "Failed to decode packet: {:?}", result.err());
        let (packet, consumed) = result.unwrap();
        assert_eq!(consumed, bytes.len(), "Consumed size mismatch");
        let encoded = packet.to_bytes(version);
        assert_eq!(&encoded[..], bytes, "Encoded bytes mismatch");
        packet
    }

    /// Encode `packet`, decode it back and require equality
    pub fn value_roundtrip(packet: &Packet, version: ProtocolVersion) -> Bytes {
        let encoded = packet.to_bytes(version);
        let (decoded, consumed) = Packet::decode(&encoded, version).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(&decoded, packet);
        encoded
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use crate::protocol::QoS;

    // ===== FRAMING TESTS =====

    #[test]
    fn test_frame_length_incomplete() {
        assert_eq!(Packet::frame_length(&[], 1024), Ok(None));
        assert_eq!(Packet::frame_length(&[0x30], 1024), Ok(None));
        assert_eq!(Packet::frame_length(&[0x30, 0x80], 1024), Ok(None));
        assert_eq!(Packet::frame_length(&[0x30, 0x03, 0x00], 1024), Ok(None));
    }

    #[test]
    fn test_frame_length_complete_with_trailing() {
        let bytes = [0xC0, 0x00, 0xD0, 0x00];
        assert_eq!(Packet::frame_length(&bytes, 1024), Ok(Some(2)));
    }

    #[test]
    fn test_frame_length_too_large() {
        let bytes = [0x30, 0x80, 0x01];
        assert_eq!(
            Packet::frame_length(&bytes, 64),
            Err(ProtocolError::PacketTooLarge {
                max_size: 64,
                actual_size: 131
            })
        );
    }

    #[test]
    fn test_frame_length_bad_varint() {
        let bytes = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert_eq!(
            Packet::frame_length(&bytes, usize::MAX),
            Err(ProtocolError::InvalidLengthEncoding)
        );
    }

    #[test]
    fn test_frame_length_unterminated_varint() {
        // no fifth byte yet, but four continuation bits already make it invalid
        let bytes = [0x30, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(
            Packet::frame_length(&bytes, usize::MAX),
            Err(ProtocolError::InvalidLengthEncoding)
        );
        assert_eq!(
            Packet::decode(&bytes, ProtocolVersion::V311),
            Err(ProtocolError::InvalidLengthEncoding)
        );
    }

    #[test]
    fn test_connect_version_sniffed_from_frame() {
        let v5 = Packet::Connect(ConnectPacket::new(ProtocolVersion::V5, "c", 10)).to_bytes(ProtocolVersion::V5);
        assert_eq!(Packet::connect_version(&v5), Some(ProtocolVersion::V5));

        // level byte survives even when the rest of the body is garbage
        let mut broken = v5.to_vec();
        broken.truncate(9);
        assert_eq!(Packet::connect_version(&broken), Some(ProtocolVersion::V5));

        assert_eq!(Packet::connect_version(&[0xC0, 0x00]), None);
        assert_eq!(Packet::connect_version(&[]), None);
    }

    // ===== HEADER TESTS =====

    #[test]
    fn test_reserved_packet_types_rejected() {
        assert!(matches!(
            Packet::decode(&[0x00, 0x00], ProtocolVersion::V311),
            Err(ProtocolError::InvalidPacketType { .. })
        ));
        assert!(matches!(
            Packet::decode(&[0xF0, 0x00], ProtocolVersion::V5),
            Err(ProtocolError::InvalidPacketType { .. })
        ));
    }

    #[test]
    fn test_wrong_fixed_flags_rejected() {
        // PUBREL without the 0x02 flags
        let result = Packet::decode(&[0x60, 0x02, 0x00, 0x01], ProtocolVersion::V311);
        assert_eq!(
            result,
            Err(ProtocolError::InvalidFixedHeaderFlags {
                packet_type: PacketType::PubRel,
                flags: 0
            })
        );
        // PINGREQ with flags
        assert!(Packet::decode(&[0xC1, 0x00], ProtocolVersion::V311).is_err());
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        // remaining length says 3 but the topic claims 5 bytes
        let result = Packet::decode(&[0x30, 0x03, 0x00, 0x05, 0x61], ProtocolVersion::V311);
        assert!(matches!(result, Err(ProtocolError::InvalidPacketLength { .. })));
    }

    #[test]
    fn test_truncated_frame_is_incomplete() {
        let result = Packet::decode(&[0x30, 0x05, 0x00, 0x01], ProtocolVersion::V311);
        assert!(result.unwrap_err().is_incomplete());
    }

    // ===== PING TESTS =====

    #[test]
    fn test_pingreq_pingresp() {
        assert_eq!(roundtrip_test(&[0xC0, 0x00], ProtocolVersion::V311), Packet::PingReq);
        assert_eq!(roundtrip_test(&[0xD0, 0x00], ProtocolVersion::V5), Packet::PingResp);
        assert_eq!(Packet::PingReq.to_bytes(ProtocolVersion::V311).len(), 2);
    }

    #[test]
    fn test_ping_with_body_rejected() {
        assert!(Packet::decode(&[0xC0, 0x01, 0x00], ProtocolVersion::V311).is_err());
    }

    // ===== REMAINING LENGTH BOUNDARIES =====

    fn publish_with_body_len(body_len: usize) -> Packet {
        // QoS 0: topic "t" takes 3 bytes of the body
        Packet::Publish(PublishPacket::new(
            "t",
            vec![0xAB; body_len - 3],
            QoS::AtMostOnce,
            None,
            false,
        ))
    }

    #[test]
    fn test_remaining_length_boundaries() {
        // remaining length 0 and 1 are only reachable with body-less packets
        let encoded = value_roundtrip(&Packet::PingReq, ProtocolVersion::V311);
        assert_eq!(&encoded[..], &[0xC0, 0x00]);
        let disconnect = Packet::Disconnect(DisconnectPacket::new(
            crate::protocol::ReasonCode::DISCONNECT_WITH_WILL_MESSAGE,
        ));
        let encoded = value_roundtrip(&disconnect, ProtocolVersion::V5);
        assert_eq!(&encoded[..], &[0xE0, 0x01, 0x04]);

        for (body_len, len_bytes) in [
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
        ] {
            let packet = publish_with_body_len(body_len);
            let encoded = value_roundtrip(&packet, ProtocolVersion::V311);
            assert_eq!(encoded.len(), 1 + len_bytes + body_len, "body length {}", body_len);
        }
    }

    #[test]
    fn test_decode_consumes_single_frame() {
        let bytes = [0xC0, 0x00, 0xE0, 0x00];
        let (packet, consumed) = Packet::decode(&bytes, ProtocolVersion::V311).unwrap();
        assert_eq!(packet, Packet::PingReq);
        assert_eq!(consumed, 2);
    }
}
