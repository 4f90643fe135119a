use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::packets::{ensure_consumed, PacketEncoder};
use crate::protocol::properties::Properties;
use crate::protocol::qos::QoS;
use crate::protocol::utils::{read_binary, read_string, read_u16, read_u8, write_binary, write_string};
use crate::protocol::{ProtocolError, ProtocolVersion};

pub const MQTT_PROTOCOL_NAME: &str = "MQTT";

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ConnectFlags(u8);

impl ConnectFlags {
    pub const RESERVED: Self = Self(0b_0000_0001);
    pub const CLEAN_SESSION: Self = Self(0b_0000_0010);
    pub const WILL_FLAG: Self = Self(0b_0000_0100);
    pub const WILL_QOS_1: Self = Self(0b_0000_1000);
    pub const WILL_QOS_2: Self = Self(0b_0001_0000);
    pub const WILL_RETAIN: Self = Self(0b_0010_0000);
    pub const PASSWORD: Self = Self(0b_0100_0000);
    pub const USERNAME: Self = Self(0b_1000_0000);

    pub const fn empty() -> Self { Self(0) }
    pub const fn from_bits(bits: u8) -> Self { Self(bits) }
    pub const fn bits(self) -> u8 { self.0 }
    pub const fn contains(self, other: Self) -> bool { (self.0 & other.0) == other.0 }
    pub fn insert(&mut self, other: Self) { self.0 |= other.0; }

    pub const fn will_qos_bits(self) -> u8 {
        (self.0 >> 3) & 0b11
    }
}

/// Will message carried by CONNECT and published on abnormal disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            properties: Properties::new(),
        }
    }
}

/// Fixed Header
///   byte 1:  0x10                      (type=1, flags=0000)
///   bytes :  Remaining Length (var-int)
///
/// Variable Header
///   Protocol Name      ("MQTT" as UTF-8 string)
///   Protocol Level     (0x04 for 3.1.1, 0x05 for 5.0)
///   Connect Flags      (bitfield)
///   Keep Alive         (2 bytes)
///   Properties         (5.0 only)
///
/// Payload (order matters, some fields optional)
///   Client Identifier  (UTF-8 string)
///   Will Properties    (5.0 only)       [if Will Flag = 1]
///   Will Topic         (UTF-8 string)   [if Will Flag = 1]
///   Will Payload       (binary data)    [if Will Flag = 1]
///   User Name          (UTF-8 string)   [if User Name Flag = 1]
///   Password           (binary data)    [if Password Flag = 1]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub properties: Properties,
}

impl ConnectPacket {
    pub fn new(protocol_version: ProtocolVersion, client_id: impl Into<String>, keep_alive: u16) -> Self {
        Self {
            protocol_version,
            clean_start: true,
            keep_alive,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
            properties: Properties::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    pub fn connect_flags(&self) -> ConnectFlags {
        let mut flags = ConnectFlags::empty();
        if self.clean_start {
            flags.insert(ConnectFlags::CLEAN_SESSION);
        }
        if let Some(will) = &self.will {
            flags.insert(ConnectFlags::WILL_FLAG);
            match will.qos {
                QoS::AtMostOnce => {}
                QoS::AtLeastOnce => flags.insert(ConnectFlags::WILL_QOS_1),
                QoS::ExactlyOnce => flags.insert(ConnectFlags::WILL_QOS_2),
            }
            if will.retain {
                flags.insert(ConnectFlags::WILL_RETAIN);
            }
        }
        if self.username.is_some() {
            flags.insert(ConnectFlags::USERNAME);
        }
        if self.password.is_some() {
            flags.insert(ConnectFlags::PASSWORD);
        }
        flags
    }
}

impl PacketEncoder for ConnectPacket {
    /// CONNECT always encodes with its own protocol level
    fn encode_body(&self, _version: ProtocolVersion, buffer: &mut BytesMut) {
        let version = self.protocol_version;

        // variable header
        write_string(MQTT_PROTOCOL_NAME, buffer);
        buffer.put_u8(version.level());
        buffer.put_u8(self.connect_flags().bits());
        buffer.put_u16(self.keep_alive);
        if version.is_v5() {
            self.properties.encode(buffer);
        }

        // payload
        write_string(&self.client_id, buffer);
        if let Some(will) = &self.will {
            if version.is_v5() {
                will.properties.encode(buffer);
            }
            write_string(&will.topic, buffer);
            write_binary(&will.payload, buffer);
        }
        if let Some(username) = &self.username {
            write_string(username, buffer);
        }
        if let Some(password) = &self.password {
            write_binary(password, buffer);
        }
    }

    fn decode_body(bytes: &[u8], _flags: u8, _version: ProtocolVersion) -> Result<Self, ProtocolError> {
        let mut offset = 0;

        // validate protocol name
        let protocol_name = read_string(bytes, &mut offset)?;
        if protocol_name != MQTT_PROTOCOL_NAME {
            return Err(ProtocolError::InvalidProtocolName);
        }

        // validate protocol level
        let level = read_u8(bytes, &mut offset)?;
        let protocol_version = ProtocolVersion::from_level(level)
            .ok_or(ProtocolError::UnsupportedProtocolLevel { level })?;

        // validate connect flags
        let connect_flags = ConnectFlags::from_bits(read_u8(bytes, &mut offset)?);
        let invalid_flags = ProtocolError::InvalidConnectFlags {
            flags: connect_flags.bits(),
        };
        if connect_flags.contains(ConnectFlags::RESERVED) {
            return Err(invalid_flags);
        }
        let will_flag = connect_flags.contains(ConnectFlags::WILL_FLAG);
        let will_qos = QoS::from_u8(connect_flags.will_qos_bits()).map_err(|_| invalid_flags.clone())?;
        let will_retain = connect_flags.contains(ConnectFlags::WILL_RETAIN);
        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(invalid_flags);
        }
        let username_flag = connect_flags.contains(ConnectFlags::USERNAME);
        let password_flag = connect_flags.contains(ConnectFlags::PASSWORD);
        if password_flag && !username_flag && !protocol_version.is_v5() {
            return Err(invalid_flags);
        }

        let keep_alive = read_u16(bytes, &mut offset)?;
        let properties = if protocol_version.is_v5() {
            Properties::decode(bytes, &mut offset)?
        } else {
            Properties::new()
        };

        // payload
        let client_id = read_string(bytes, &mut offset)?.to_owned();

        let will = if will_flag {
            let will_properties = if protocol_version.is_v5() {
                Properties::decode(bytes, &mut offset)?
            } else {
                Properties::new()
            };
            let topic = read_string(bytes, &mut offset)?.to_owned();
            let payload = Bytes::copy_from_slice(read_binary(bytes, &mut offset)?);
            Some(LastWill {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(read_string(bytes, &mut offset)?.to_owned())
        } else {
            None
        };
        let password = if password_flag {
            Some(Bytes::copy_from_slice(read_binary(bytes, &mut offset)?))
        } else {
            None
        };

        ensure_consumed(bytes, offset)?;

        Ok(Self {
            protocol_version,
            clean_start: connect_flags.contains(ConnectFlags::CLEAN_SESSION),
            keep_alive,
            client_id,
            will,
            username,
            password,
            properties,
        })
    }
}
