pub mod error;
pub mod packet_type;
pub mod packets;
pub mod properties;
pub mod qos;
pub mod reason_code;
pub mod utils;
pub mod version;

pub use error::ProtocolError;
pub use packet_type::PacketType;
pub use packets::Packet;
pub use properties::{Properties, PropertyId, PropertyValue};
pub use qos::QoS;
pub use reason_code::ReasonCode;
pub use version::ProtocolVersion;
