use bytes::{BufMut, BytesMut};

use crate::protocol::packets::{require_packet_id, PacketEncoder};
use crate::protocol::properties::Properties;
use crate::protocol::utils::{read_u16, read_u8};
use crate::protocol::{ProtocolError, ProtocolVersion, ReasonCode};

/// One reason code per requested filter, in request order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<ReasonCode>,
    pub properties: Properties,
}

impl SubAckPacket {
    pub fn new(packet_id: u16, reason_codes: Vec<ReasonCode>) -> Self {
        Self {
            packet_id,
            reason_codes,
            properties: Properties::new(),
        }
    }
}

impl PacketEncoder for SubAckPacket {
    fn encode_body(&self, version: ProtocolVersion, buffer: &mut BytesMut) {
        buffer.put_u16(self.packet_id);
        if version.is_v5() {
            self.properties.encode(buffer);
            for code in &self.reason_codes {
                buffer.put_u8(code.value());
            }
        } else {
            for code in &self.reason_codes {
                buffer.put_u8(code.to_v311_suback());
            }
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

        let mut reason_codes = Vec::with_capacity(body.len().saturating_sub(offset));
        while offset < body.len() {
            let code = read_u8(body, &mut offset)?;
            let reason = match (version, code) {
                (ProtocolVersion::V311, 0x00..=0x02) => ReasonCode(code),
                (ProtocolVersion::V311, 0x80) => ReasonCode::UNSPECIFIED_ERROR,
                (ProtocolVersion::V311, _) => return Err(ProtocolError::InvalidReasonCode { code }),
                (ProtocolVersion::V5, _) => ReasonCode(code),
            };
            reason_codes.push(reason);
        }

        Ok(Self {
            packet_id,
            reason_codes,
            properties,
        })
    }
}
