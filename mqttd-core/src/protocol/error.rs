use crate::protocol::packet_type::PacketType;

/// Errors raised while decoding a single control packet.
///
/// Every variant describes a packet the broker refuses to interpret. Apart from
/// [`ProtocolError::IncompletePacket`], which only means more bytes are needed,
/// all of them are fatal for the connection that produced the bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Incomplete packet (not enough data)
    #[error("Incomplete packet: available {available}")]
    IncompletePacket { available: usize },

    /// Remaining length uses more than four bytes or exceeds 268,435,455
    #[error("Invalid variable length encoding")]
    InvalidLengthEncoding,

    /// Packet larger than the negotiated maximum packet size
    #[error("Packet too large: size {actual_size}, max {max_size}")]
    PacketTooLarge { max_size: usize, actual_size: usize },

    /// Packet type nibble is 0 or 15, or AUTH which this broker does not speak
    #[error("Invalid packet type: {packet_type:#04x}")]
    InvalidPacketType { packet_type: u8 },

    /// Reserved fixed header flags do not match the required value
    #[error("Invalid fixed header flags for {packet_type}: {flags:#06b}")]
    InvalidFixedHeaderFlags { packet_type: PacketType, flags: u8 },

    /// Body length differs from what the fields consumed
    #[error("Packet length mismatch: expected {expected}, actual {actual}")]
    InvalidPacketLength { expected: usize, actual: usize },

    /// Invalid QoS level
    #[error("Invalid QoS level: {level}")]
    InvalidQosLevel { level: u8 },

    /// Invalid UTF-8 string, or a string containing U+0000
    #[error("Invalid UTF-8 string")]
    InvalidUtf8String,

    /// Invalid protocol name in CONNECT
    #[error("Invalid protocol name in CONNECT packet")]
    InvalidProtocolName,

    /// Unsupported protocol level in CONNECT
    #[error("Unsupported protocol level: {level}")]
    UnsupportedProtocolLevel { level: u8 },

    /// Invalid connect flags in CONNECT
    #[error("Invalid connect flags in CONNECT packet: {flags:#010b}")]
    InvalidConnectFlags { flags: u8 },

    /// Invalid session present flag in CONNACK
    #[error("Invalid session present flag in CONNACK: {flag}")]
    InvalidSessionPresentFlag { flag: u8 },

    /// Missing or zero Packet Identifier where one is required
    #[error("Missing packet identifier")]
    MissingPacketId,

    /// SUBSCRIBE or UNSUBSCRIBE without a single topic filter
    #[error("No topic filters in {packet_type}")]
    NoTopicFilters { packet_type: PacketType },

    /// Reserved bits of the subscription options byte are set
    #[error("Invalid subscription options: {options:#010b}")]
    InvalidSubscriptionOptions { options: u8 },

    /// Reason code not defined for this packet
    #[error("Invalid reason code {code:#04x}")]
    InvalidReasonCode { code: u8 },

    /// Property identifier outside the MQTT 5.0 table
    #[error("Unknown property identifier {id:#04x}")]
    UnknownProperty { id: u8 },

    /// Single-valued property appears more than once
    #[error("Duplicate property {id:#04x}")]
    DuplicateProperty { id: u8 },

    /// Property value outside its permitted range
    #[error("Invalid value for property {id:#04x}")]
    InvalidPropertyValue { id: u8 },
}

impl ProtocolError {
    /// True when the bytes so far are a valid prefix and reading more may succeed
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::IncompletePacket { .. })
    }
}
