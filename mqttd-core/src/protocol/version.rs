/// Protocol level negotiated by CONNECT.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1
    #[default]
    V311 = 4,
    /// MQTT 5.0
    V5 = 5,
}

impl ProtocolVersion {
    pub const fn from_level(level: u8) -> Option<Self> {
        match level {
            4 => Some(ProtocolVersion::V311),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    pub const fn level(self) -> u8 {
        self as u8
    }

    pub const fn is_v5(self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

impl core::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProtocolVersion::V311 => f.write_str("3.1.1"),
            ProtocolVersion::V5 => f.write_str("5.0"),
        }
    }
}
