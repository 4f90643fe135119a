use bytes::{BufMut, BytesMut};

use crate::protocol::packets::{ensure_consumed, require_packet_id, PacketEncoder};
use crate::protocol::properties::Properties;
use crate::protocol::utils::{read_u16, read_u8};
use crate::protocol::{ProtocolError, ProtocolVersion, ReasonCode};

/// 3.1.1 carries only the packet identifier; 5.0 adds properties and one
/// reason code per filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

impl UnsubAckPacket {
    pub fn new(packet_id: u16, reason_codes: Vec<ReasonCode>) -> Self {
        Self {
            packet_id,
            reason_codes,
            properties: Properties::new(),
        }
    }
}

impl PacketEncoder for UnsubAckPacket {
    fn encode_body(&self, version: ProtocolVersion, buffer: &mut BytesMut) {
        buffer.put_u16(self.packet_id);
        if version.is_v5() {
            self.properties.encode(buffer);
            for code in &self.reason_codes {
                buffer.put_u8(code.value());
            }
        }
    }

    fn decode_body(body: &[u8], _flags: u8, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let mut offset = 0;
        let packet_id = require_packet_id(read_u16(body, &mut offset)?)?;
        let mut packet = UnsubAckPacket::new(packet_id, Vec::new());
        if version.is_v5() {
            packet.properties = Properties::decode(body, &mut offset)?;
            while offset < body.len() {
                packet.reason_codes.push(ReasonCode(read_u8(body, &mut offset)?));
            }
        }
        ensure_consumed(body, offset)?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packets::test_utils::{roundtrip_test, value_roundtrip};
    use crate::protocol::packets::Packet;

    #[test]
    fn test_unsuback_v311() {
        let packet = roundtrip_test(&[0xB0, 0x02, 0x00, 0x01], ProtocolVersion::V311);
        assert_eq!(packet, Packet::UnsubAck(UnsubAckPacket::new(1, vec![])));
    }

    #[test]
    fn test_unsuback_v5_reason_codes() {
        let packet = UnsubAckPacket::new(
            789,
            vec![ReasonCode::SUCCESS, ReasonCode::NO_SUBSCRIPTION_EXISTED],
        );
        let bytes = value_roundtrip(&Packet::UnsubAck(packet), ProtocolVersion::V5);
        assert_eq!(&bytes[..], &[0xB0, 0x05, 0x03, 0x15, 0x00, 0x00, 0x11]);
    }
}
