use bytes::{BufMut, BytesMut};

use crate::protocol::packets::{ensure_consumed, PacketEncoder};
use crate::protocol::properties::Properties;
use crate::protocol::utils::read_u8;
use crate::protocol::{ProtocolError, ProtocolVersion, ReasonCode};

/// Variable Header
///   Acknowledge Flags  (bit 0 = Session Present)
///   Return / Reason Code
///   Properties         (5.0 only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl ConnAckPacket {
    pub fn new(session_present: bool, reason_code: ReasonCode) -> Self {
        Self {
            session_present,
            reason_code,
            properties: Properties::new(),
        }
    }

    pub fn accepted(session_present: bool) -> Self {
        Self::new(session_present, ReasonCode::SUCCESS)
    }

    /// Refusal; session present must be 0 on any failure code
    pub fn refused(reason_code: ReasonCode) -> Self {
        Self::new(false, reason_code)
    }
}

impl PacketEncoder for ConnAckPacket {
    fn encode_body(&self, version: ProtocolVersion, buffer: &mut BytesMut) {
        buffer.put_u8(self.session_present as u8);
        if version.is_v5() {
            buffer.put_u8(self.reason_code.value());
            self.properties.encode(buffer);
        } else {
            buffer.put_u8(self.reason_code.to_v311_connack());
        }
    }

    fn decode_body(body: &[u8], _flags: u8, version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let mut offset = 0;
        let flag = read_u8(body, &mut offset)?;
        if flag > 1 {
            return Err(ProtocolError::InvalidSessionPresentFlag { flag });
        }
        let code = read_u8(body, &mut offset)?;
        let (reason_code, properties) = if version.is_v5() {
            (ReasonCode(code), Properties::decode(body, &mut offset)?)
        } else {
            let reason = ReasonCode::from_v311_connack(code)
                .ok_or(ProtocolError::InvalidReasonCode { code })?;
            (reason, Properties::new())
        };
        ensure_consumed(body, offset)?;

        Ok(Self {
            session_present: flag == 1,
            reason_code,
            properties,
        })
    }
}
