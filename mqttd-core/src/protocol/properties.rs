//! MQTT 5.0 property lists.
//!
//! A property list is a variable byte integer length followed by
//! `identifier, value` pairs. Every identifier has a fixed wire type, so a
//! decoder can always step over values it has no use for.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::utils::{
    read_binary, read_string, read_u16, read_u32, read_u8, read_var_int, read_variable_length,
    variable_length_length, write_binary, write_string, write_variable_length,
};
use crate::protocol::ProtocolError;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// How a property value is laid out on the wire
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WireType {
    Byte,
    TwoByteInteger,
    FourByteInteger,
    VariableByteInteger,
    Utf8String,
    BinaryData,
    Utf8StringPair,
}

impl PropertyId {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::PayloadFormatIndicator),
            0x02 => Some(Self::MessageExpiryInterval),
            0x03 => Some(Self::ContentType),
            0x08 => Some(Self::ResponseTopic),
            0x09 => Some(Self::CorrelationData),
            0x0B => Some(Self::SubscriptionIdentifier),
            0x11 => Some(Self::SessionExpiryInterval),
            0x12 => Some(Self::AssignedClientIdentifier),
            0x13 => Some(Self::ServerKeepAlive),
            0x15 => Some(Self::AuthenticationMethod),
            0x16 => Some(Self::AuthenticationData),
            0x17 => Some(Self::RequestProblemInformation),
            0x18 => Some(Self::WillDelayInterval),
            0x19 => Some(Self::RequestResponseInformation),
            0x1A => Some(Self::ResponseInformation),
            0x1C => Some(Self::ServerReference),
            0x1F => Some(Self::ReasonString),
            0x21 => Some(Self::ReceiveMaximum),
            0x22 => Some(Self::TopicAliasMaximum),
            0x23 => Some(Self::TopicAlias),
            0x24 => Some(Self::MaximumQoS),
            0x25 => Some(Self::RetainAvailable),
            0x26 => Some(Self::UserProperty),
            0x27 => Some(Self::MaximumPacketSize),
            0x28 => Some(Self::WildcardSubscriptionAvailable),
            0x29 => Some(Self::SubscriptionIdentifierAvailable),
            0x2A => Some(Self::SharedSubscriptionAvailable),
            _ => None,
        }
    }

    pub const fn wire_type(self) -> WireType {
        match self {
            Self::PayloadFormatIndicator
            | Self::RequestProblemInformation
            | Self::RequestResponseInformation
            | Self::MaximumQoS
            | Self::RetainAvailable
            | Self::WildcardSubscriptionAvailable
            | Self::SubscriptionIdentifierAvailable
            | Self::SharedSubscriptionAvailable => WireType::Byte,
            Self::ServerKeepAlive
            | Self::ReceiveMaximum
            | Self::TopicAliasMaximum
            | Self::TopicAlias => WireType::TwoByteInteger,
            Self::MessageExpiryInterval
            | Self::SessionExpiryInterval
            | Self::WillDelayInterval
            | Self::MaximumPacketSize => WireType::FourByteInteger,
            Self::SubscriptionIdentifier => WireType::VariableByteInteger,
            Self::ContentType
            | Self::ResponseTopic
            | Self::AssignedClientIdentifier
            | Self::AuthenticationMethod
            | Self::ResponseInformation
            | Self::ServerReference
            | Self::ReasonString => WireType::Utf8String,
            Self::CorrelationData | Self::AuthenticationData => WireType::BinaryData,
            Self::UserProperty => WireType::Utf8StringPair,
        }
    }

    /// Only these two may legally appear more than once in one list
    pub const fn allows_multiple(self) -> bool {
        matches!(self, Self::UserProperty | Self::SubscriptionIdentifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByteInteger(u16),
    FourByteInteger(u32),
    VariableByteInteger(u32),
    Utf8String(String),
    BinaryData(Bytes),
    Utf8StringPair(String, String),
}

impl PropertyValue {
    pub const fn wire_type(&self) -> WireType {
        match self {
            PropertyValue::Byte(_) => WireType::Byte,
            PropertyValue::TwoByteInteger(_) => WireType::TwoByteInteger,
            PropertyValue::FourByteInteger(_) => WireType::FourByteInteger,
            PropertyValue::VariableByteInteger(_) => WireType::VariableByteInteger,
            PropertyValue::Utf8String(_) => WireType::Utf8String,
            PropertyValue::BinaryData(_) => WireType::BinaryData,
            PropertyValue::Utf8StringPair(_, _) => WireType::Utf8StringPair,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            PropertyValue::Byte(_) => 1,
            PropertyValue::TwoByteInteger(_) => 2,
            PropertyValue::FourByteInteger(_) => 4,
            PropertyValue::VariableByteInteger(v) => variable_length_length(*v as usize),
            PropertyValue::Utf8String(s) => 2 + s.len(),
            PropertyValue::BinaryData(b) => 2 + b.len(),
            PropertyValue::Utf8StringPair(k, v) => 4 + k.len() + v.len(),
        }
    }

    fn encode(&self, buffer: &mut BytesMut) {
        match self {
            PropertyValue::Byte(v) => buffer.put_u8(*v),
            PropertyValue::TwoByteInteger(v) => buffer.put_u16(*v),
            PropertyValue::FourByteInteger(v) => buffer.put_u32(*v),
            PropertyValue::VariableByteInteger(v) => {
                write_variable_length(*v as usize, buffer);
            }
            PropertyValue::Utf8String(s) => write_string(s, buffer),
            PropertyValue::BinaryData(b) => write_binary(b, buffer),
            PropertyValue::Utf8StringPair(k, v) => {
                write_string(k, buffer);
                write_string(v, buffer);
            }
        }
    }

    fn decode(wire_type: WireType, bytes: &[u8], offset: &mut usize) -> Result<Self, ProtocolError> {
        Ok(match wire_type {
            WireType::Byte => PropertyValue::Byte(read_u8(bytes, offset)?),
            WireType::TwoByteInteger => PropertyValue::TwoByteInteger(read_u16(bytes, offset)?),
            WireType::FourByteInteger => PropertyValue::FourByteInteger(read_u32(bytes, offset)?),
            WireType::VariableByteInteger => {
                PropertyValue::VariableByteInteger(read_var_int(bytes, offset)?)
            }
            WireType::Utf8String => PropertyValue::Utf8String(read_string(bytes, offset)?.to_owned()),
            WireType::BinaryData => {
                PropertyValue::BinaryData(Bytes::copy_from_slice(read_binary(bytes, offset)?))
            }
            WireType::Utf8StringPair => {
                let key = read_string(bytes, offset)?.to_owned();
                let value = read_string(bytes, offset)?.to_owned();
                PropertyValue::Utf8StringPair(key, value)
            }
        })
    }
}

/// Property list keyed by identifier. Multi-valued identifiers keep every
/// value in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties {
    entries: BTreeMap<PropertyId, Vec<PropertyValue>>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: PropertyId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Insert a value, appending for multi-valued identifiers and replacing
    /// otherwise. Fails when the value's wire type does not fit the identifier.
    pub fn insert(&mut self, id: PropertyId, value: PropertyValue) -> Result<(), ProtocolError> {
        if value.wire_type() != id.wire_type() {
            return Err(ProtocolError::InvalidPropertyValue { id: id as u8 });
        }
        self.put(id, value);
        Ok(())
    }

    fn put(&mut self, id: PropertyId, value: PropertyValue) {
        let values = self.entries.entry(id).or_default();
        if !id.allows_multiple() {
            values.clear();
        }
        values.push(value);
    }

    pub fn remove(&mut self, id: PropertyId) -> Vec<PropertyValue> {
        self.entries.remove(&id).unwrap_or_default()
    }

    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.entries.get(&id).and_then(|values| values.first())
    }

    pub fn get_all(&self, id: PropertyId) -> &[PropertyValue] {
        self.entries.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    // ===== Typed setters =====

    pub fn set_u8(&mut self, id: PropertyId, value: u8) {
        debug_assert_eq!(id.wire_type(), WireType::Byte);
        self.put(id, PropertyValue::Byte(value));
    }

    pub fn set_u16(&mut self, id: PropertyId, value: u16) {
        debug_assert_eq!(id.wire_type(), WireType::TwoByteInteger);
        self.put(id, PropertyValue::TwoByteInteger(value));
    }

    pub fn set_u32(&mut self, id: PropertyId, value: u32) {
        debug_assert_eq!(id.wire_type(), WireType::FourByteInteger);
        self.put(id, PropertyValue::FourByteInteger(value));
    }

    pub fn set_string(&mut self, id: PropertyId, value: impl Into<String>) {
        debug_assert_eq!(id.wire_type(), WireType::Utf8String);
        self.put(id, PropertyValue::Utf8String(value.into()));
    }

    pub fn push_subscription_identifier(&mut self, value: u32) {
        self.put(
            PropertyId::SubscriptionIdentifier,
            PropertyValue::VariableByteInteger(value),
        );
    }

    pub fn push_user_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.put(
            PropertyId::UserProperty,
            PropertyValue::Utf8StringPair(key.into(), value.into()),
        );
    }

    // ===== Typed getters =====

    pub fn get_u8(&self, id: PropertyId) -> Option<u8> {
        match self.get(id) {
            Some(PropertyValue::Byte(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u16(&self, id: PropertyId) -> Option<u16> {
        match self.get(id) {
            Some(PropertyValue::TwoByteInteger(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u32(&self, id: PropertyId) -> Option<u32> {
        match self.get(id) {
            Some(PropertyValue::FourByteInteger(v)) => Some(*v),
            Some(PropertyValue::VariableByteInteger(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, id: PropertyId) -> Option<&str> {
        match self.get(id) {
            Some(PropertyValue::Utf8String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn topic_alias(&self) -> Option<u16> {
        self.get_u16(PropertyId::TopicAlias)
    }

    pub fn message_expiry_interval(&self) -> Option<u32> {
        self.get_u32(PropertyId::MessageExpiryInterval)
    }

    pub fn receive_maximum(&self) -> Option<u16> {
        self.get_u16(PropertyId::ReceiveMaximum)
    }

    pub fn topic_alias_maximum(&self) -> Option<u16> {
        self.get_u16(PropertyId::TopicAliasMaximum)
    }

    pub fn subscription_identifiers(&self) -> Vec<u32> {
        self.get_all(PropertyId::SubscriptionIdentifier)
            .iter()
            .filter_map(|value| match value {
                PropertyValue::VariableByteInteger(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.get_all(PropertyId::UserProperty)
            .iter()
            .filter_map(|value| match value {
                PropertyValue::Utf8StringPair(k, v) => Some((k.as_str(), v.as_str())),
                _ => None,
            })
    }

    // ===== Wire format =====

    /// Length of the encoded identifier/value pairs, excluding the length prefix
    pub fn body_len(&self) -> usize {
        self.entries
            .iter()
            .flat_map(|(_, values)| values.iter())
            .map(|value| 1 + value.encoded_len())
            .sum()
    }

    /// Length including the variable byte integer prefix
    pub fn encoded_len(&self) -> usize {
        let body = self.body_len();
        variable_length_length(body) + body
    }

    pub fn encode(&self, buffer: &mut BytesMut) {
        write_variable_length(self.body_len(), buffer);
        for (id, values) in &self.entries {
            for value in values {
                buffer.put_u8(*id as u8);
                value.encode(buffer);
            }
        }
    }

    /// Decode a length-prefixed property list starting at `offset`.
    pub fn decode(bytes: &[u8], offset: &mut usize) -> Result<Self, ProtocolError> {
        let (length, len_bytes) = read_variable_length(&bytes[(*offset).min(bytes.len())..])?;
        *offset += len_bytes;
        let end = *offset + length;
        if end > bytes.len() {
            return Err(ProtocolError::IncompletePacket {
                available: bytes.len(),
            });
        }

        let section = &bytes[..end];
        let mut properties = Properties::new();
        while *offset < end {
            let raw_id = read_u8(section, offset)?;
            let id = PropertyId::from_byte(raw_id)
                .ok_or(ProtocolError::UnknownProperty { id: raw_id })?;
            let value = PropertyValue::decode(id.wire_type(), section, offset)?;
            if !id.allows_multiple() && properties.contains(id) {
                return Err(ProtocolError::DuplicateProperty { id: raw_id });
            }
            if id == PropertyId::SubscriptionIdentifier
                && value == PropertyValue::VariableByteInteger(0)
            {
                return Err(ProtocolError::InvalidPropertyValue { id: raw_id });
            }
            properties.put(id, value);
        }

        Ok(properties)
    }
}
