//! Application messages as they travel between sessions
//!
//! A PUBLISH from a client becomes a [`Message`] shared by every subscriber.
//! Each subscriber gets a [`Delivery`] carrying its own QoS, retain flag and
//! subscription identifiers, which its session turns back into a PUBLISH.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::protocol::packets::{LastWill, PublishPacket};
use crate::protocol::{Properties, PropertyId, QoS};
use crate::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Properties forwarded to subscribers; connection-scoped ones are stripped
    pub properties: Properties,
    pub expires_at: Option<Instant>,
    /// Publishing session, `None` for broker-originated messages
    pub origin: Option<SessionId>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            properties: Properties::new(),
            expires_at: None,
            origin: None,
        }
    }

    /// Build from an inbound PUBLISH whose topic alias is already resolved
    pub fn from_publish(publish: PublishPacket, origin: SessionId, now: Instant) -> Self {
        let mut properties = publish.properties;
        properties.remove(PropertyId::TopicAlias);
        properties.remove(PropertyId::SubscriptionIdentifier);
        let expires_at = expiry(&mut properties, now);
        Self {
            topic: publish.topic_name,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            properties,
            expires_at,
            origin: Some(origin),
        }
    }

    pub fn from_will(will: LastWill, origin: SessionId, now: Instant) -> Self {
        let mut properties = will.properties;
        // delay is applied before publishing, not forwarded
        properties.remove(PropertyId::WillDelayInterval);
        let expires_at = expiry(&mut properties, now);
        Self {
            topic: will.topic,
            payload: will.payload,
            qos: will.qos,
            retain: will.retain,
            properties,
            expires_at,
            origin: Some(origin),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whole seconds left before expiry, at least 1 while still live
    fn remaining_expiry(&self, now: Instant) -> Option<u32> {
        self.expires_at.map(|at| {
            let left = at.saturating_duration_since(now);
            let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
            secs.clamp(1, u64::from(u32::MAX)) as u32
        })
    }
}

fn expiry(properties: &mut Properties, now: Instant) -> Option<Instant> {
    let interval = properties.message_expiry_interval()?;
    properties.remove(PropertyId::MessageExpiryInterval);
    Some(now + Duration::from_secs(u64::from(interval)))
}

/// One message routed to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Arc<Message>,
    pub qos: QoS,
    pub retain: bool,
    pub subscription_identifiers: Vec<u32>,
}

impl Delivery {
    pub fn into_publish(self, packet_id: Option<u16>, now: Instant) -> PublishPacket {
        let mut publish = PublishPacket::new(
            self.message.topic.clone(),
            self.message.payload.clone(),
            self.qos,
            packet_id,
            self.retain,
        );
        publish.properties = self.message.properties.clone();
        if let Some(remaining) = self.message.remaining_expiry(now) {
            publish.properties.set_u32(PropertyId::MessageExpiryInterval, remaining);
        }
        for id in self.subscription_identifiers {
            publish.properties.push_subscription_identifier(id);
        }
        publish
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_publish_strips_connection_properties() {
        let mut publish = PublishPacket::new("a/b", &b"x"[..], QoS::AtLeastOnce, Some(1), true);
        publish.properties.set_u16(PropertyId::TopicAlias, 3);
        publish.properties.push_subscription_identifier(9);
        publish.properties.set_string(PropertyId::ContentType, "text/plain");

        let message = Message::from_publish(publish, 42, Instant::now());
        assert!(!message.properties.contains(PropertyId::TopicAlias));
        assert!(!message.properties.contains(PropertyId::SubscriptionIdentifier));
        assert_eq!(message.properties.get_str(PropertyId::ContentType), Some("text/plain"));
        assert_eq!(message.origin, Some(42));
        assert!(message.retain);
    }

    #[test]
    fn test_expiry_is_rewritten_on_delivery() {
        let now = Instant::now();
        let mut publish = PublishPacket::new("t", &b""[..], QoS::AtMostOnce, None, false);
        publish.properties.set_u32(PropertyId::MessageExpiryInterval, 60);
        let message = Arc::new(Message::from_publish(publish, 1, now));

        assert!(!message.is_expired(now + Duration::from_secs(59)));
        assert!(message.is_expired(now + Duration::from_secs(60)));

        let delivery = Delivery {
            message,
            qos: QoS::AtMostOnce,
            retain: false,
            subscription_identifiers: vec![4, 5],
        };
        let out = delivery.into_publish(None, now + Duration::from_secs(20));
        assert_eq!(out.properties.message_expiry_interval(), Some(40));
        assert_eq!(out.properties.subscription_identifiers(), vec![4, 5]);
    }

    #[test]
    fn test_delivery_uses_subscriber_qos_and_retain() {
        let message = Arc::new(Message::new("t", &b"v"[..], QoS::ExactlyOnce, true));
        let delivery = Delivery {
            message,
            qos: QoS::AtLeastOnce,
            retain: false,
            subscription_identifiers: Vec::new(),
        };
        let out = delivery.into_publish(Some(12), Instant::now());
        assert_eq!(out.qos, QoS::AtLeastOnce);
        assert_eq!(out.packet_id, Some(12));
        assert!(!out.retain);
        assert!(out.properties.is_empty());
    }
}
