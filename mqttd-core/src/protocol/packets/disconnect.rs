use bytes::{BufMut, BytesMut};

use crate::protocol::packets::{ensure_consumed, PacketEncoder};
use crate::protocol::properties::Properties;
use crate::protocol::utils::read_u8;
use crate::protocol::{ProtocolError, ProtocolVersion, ReasonCode};

/// Empty in 3.1.1. In 5.0 the reason code and properties are optional and
/// an empty body means Normal disconnection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisconnectPacket {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl DisconnectPacket {
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::new(),
        }
    }

    pub fn normal() -> Self {
        Self::new(ReasonCode::NORMAL_DISCONNECTION)
    }
}

impl PacketEncoder for DisconnectPacket {
    fn encode_body(&self, version: ProtocolVersion, buffer: &mut BytesMut) {
        if !version.is_v5() {
            return;
        }
        if self.properties.is_empty() {
            if self.reason_code != ReasonCode::NORMAL_DISCONNECTION {
                buffer.put_u8(self.reason_code.value());
            }
        } else {
            buffer.put_u8(self.reason_code.value());
            self.properties.encode(buffer);
        }
    }

    fn decode_body(body: &[u8], _flags: u8, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let mut offset = 0;
        let mut packet = DisconnectPacket::normal();
        if version.is_v5() {
            if offset < body.len() {
                packet.reason_code = ReasonCode(read_u8(body, &mut offset)?);
            }
            if offset < body.len() {
                packet.properties = Properties::decode(body, &mut offset)?;
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
    use crate::protocol::PropertyId;

    #[test]
    fn test_disconnect_v311() {
        let packet = roundtrip_test(&[0xE0, 0x00], ProtocolVersion::V311);
        assert_eq!(packet, Packet::Disconnect(DisconnectPacket::normal()));
    }

    #[test]
    fn test_disconnect_v311_with_body_rejected() {
        assert!(Packet::decode(&[0xE0, 0x01, 0x00], ProtocolVersion::V311).is_err());
    }

    #[test]
    fn test_disconnect_v5_empty_is_normal() {
        let packet = roundtrip_test(&[0xE0, 0x00], ProtocolVersion::V5);
        assert_eq!(packet, Packet::Disconnect(DisconnectPacket::normal()));
    }

    #[test]
    fn test_disconnect_v5_reason() {
        let packet = roundtrip_test(&[0xE0, 0x01, 0x8E], ProtocolVersion::V5);
        assert_eq!(
            packet,
            Packet::Disconnect(DisconnectPacket::new(ReasonCode::SESSION_TAKEN_OVER))
        );
    }

    #[test]
    fn test_disconnect_v5_properties() {
        let mut disconnect = DisconnectPacket::new(ReasonCode::SERVER_SHUTTING_DOWN);
        disconnect.properties.set_string(PropertyId::ReasonString, "bye");
        value_roundtrip(&Packet::Disconnect(disconnect), ProtocolVersion::V5);
    }
}
