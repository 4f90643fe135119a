use bytes::{BufMut, BytesMut};

use crate::protocol::packets::{ensure_consumed, require_packet_id, PacketEncoder};
use crate::protocol::properties::Properties;
use crate::protocol::utils::{read_u16, read_u8};
use crate::protocol::{ProtocolError, ProtocolVersion, ReasonCode};

/// PUBACK, PUBREC, PUBREL and PUBCOMP share one layout.
///
/// Variable Header
///   Packet Identifier  (2 bytes)
///   Reason Code        (5.0 only, omitted when Success and no properties follow)
///   Properties         (5.0 only, omitted when empty)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl AckPacket {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: ReasonCode::SUCCESS,
            properties: Properties::new(),
        }
    }

    pub fn with_reason(packet_id: u16, reason_code: ReasonCode) -> Self {
        Self {
            packet_id,
            reason_code,
            properties: Properties::new(),
        }
    }
}

impl PacketEncoder for AckPacket {
    fn encode_body(&self, version: ProtocolVersion, buffer: &mut BytesMut) {
        buffer.put_u16(self.packet_id);
        if !version.is_v5() {
            return;
        }
        if self.properties.is_empty() {
            if self.reason_code != ReasonCode::SUCCESS {
                buffer.put_u8(self.reason_code.value());
            }
        } else {
            buffer.put_u8(self.reason_code.value());
            self.properties.encode(buffer);
        }
    }

    fn decode_body(body: &[u8], _flags: u8, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let mut offset = 0;
        let packet_id = require_packet_id(read_u16(body, &mut offset)?)?;
        let mut packet = AckPacket::new(packet_id);

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
