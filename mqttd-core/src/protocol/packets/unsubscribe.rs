use bytes::{BufMut, BytesMut};

use crate::protocol::packets::{require_packet_id, PacketEncoder};
use crate::protocol::properties::Properties;
use crate::protocol::utils::{read_string, read_u16, write_string};
use crate::protocol::{PacketType, ProtocolError, ProtocolVersion};

/// Fixed Header
///   byte 1:  0xA2                      (type=10, flags=0010)
///
/// Variable Header
///   Packet Identifier  (2 bytes)
///   Properties         (5.0 only)
///
/// Payload
///   one or more Topic Filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topic_filters: Vec<String>,
    pub properties: Properties,
}

impl UnsubscribePacket {
    pub fn new(packet_id: u16, topic_filters: Vec<String>) -> Self {
        Self {
            packet_id,
            topic_filters,
            properties: Properties::new(),
        }
    }
}

impl PacketEncoder for UnsubscribePacket {
    fn encode_body(&self, version: ProtocolVersion, buffer: &mut BytesMut) {
        buffer.put_u16(self.packet_id);
        if version.is_v5() {
            self.properties.encode(buffer);
        }
        for filter in &self.topic_filters {
            write_string(filter, buffer);
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

        let mut topic_filters = Vec::new();
        while offset < body.len() {
            topic_filters.push(read_string(body, &mut offset)?.to_owned());
        }
        if topic_filters.is_empty() {
            return Err(ProtocolError::NoTopicFilters {
                packet_type: PacketType::Unsubscribe,
            });
        }

        Ok(Self {
            packet_id,
            topic_filters,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packets::test_utils::{roundtrip_test, value_roundtrip};
    use crate::protocol::packets::Packet;

    #[test]
    fn test_unsubscribe_header_and_filter() {
        let mut bytes = vec![0xA2, 0x0E, 0x00, 0x01, 0x00, 0x0A];
        bytes.extend_from_slice(b"test/topic");
        let packet = roundtrip_test(&bytes, ProtocolVersion::V311);
        assert_eq!(
            packet,
            Packet::Unsubscribe(UnsubscribePacket::new(1, vec!["test/topic".to_owned()]))
        );
    }

    #[test]
    fn test_unsubscribe_without_flags_rejected() {
        let result = Packet::decode(&[0xA0, 0x05, 0x00, 0x01, 0x00, 0x01, b'a'], ProtocolVersion::V311);
        assert!(matches!(result, Err(ProtocolError::InvalidFixedHeaderFlags { .. })));
    }

    #[test]
    fn test_unsubscribe_v5_multiple() {
        let packet = UnsubscribePacket::new(789, vec!["topic1".to_owned(), "topic2".to_owned()]);
        value_roundtrip(&Packet::Unsubscribe(packet), ProtocolVersion::V5);
    }

    #[test]
    fn test_unsubscribe_empty_rejected() {
        let result = Packet::decode(&[0xA2, 0x02, 0x00, 0x01], ProtocolVersion::V311);
        assert!(matches!(result, Err(ProtocolError::NoTopicFilters { .. })));
    }
}
