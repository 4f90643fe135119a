//! Broker configuration

use std::time::Duration;

use crate::protocol::QoS;

/// Largest packet the codec accepts by default (1 MiB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Limits and protocol knobs shared by every session of one broker.
///
/// A rate of zero disables that limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Maximum concurrently admitted connections
    pub max_connections: usize,
    /// Maximum concurrently admitted connections from one remote address
    pub max_connections_per_ip: usize,
    /// PUBLISH token bucket rate
    pub max_messages_per_second: u32,
    /// SUBSCRIBE token bucket rate, charged per topic filter
    pub max_subscriptions_per_minute: u32,
    /// Highest QoS granted to subscriptions
    pub max_qos: QoS,
    /// Keepalive ceiling; larger client values are overridden (5.0 only)
    pub max_keep_alive: u16,
    pub max_packet_size: usize,
    /// Inbound topic aliases accepted per connection (5.0)
    pub topic_alias_maximum: u16,
    /// Inbound QoS 1/2 messages a client may have unacknowledged (5.0)
    pub receive_maximum: u16,
    /// First retransmission delay, doubled after every retry
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub retained_enabled: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_connections_per_ip: 10,
            max_messages_per_second: 100,
            max_subscriptions_per_minute: 60,
            max_qos: QoS::ExactlyOnce,
            max_keep_alive: u16::MAX,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            topic_alias_maximum: 16,
            receive_maximum: u16::MAX,
            retry_interval: Duration::from_secs(5),
            max_retries: 4,
            retained_enabled: true,
        }
    }
}

impl BrokerConfig {
    /// Delay before retry number `attempt` (0 for the first resend)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_interval.saturating_mul(1u32 << attempt.min(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.max_connections_per_ip, 10);
        assert_eq!(config.max_messages_per_second, 100);
        assert_eq!(config.max_subscriptions_per_minute, 60);
        assert_eq!(config.max_qos, QoS::ExactlyOnce);
        assert_eq!(config.receive_maximum, 65535);
        assert_eq!(config.max_retries, 4);
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let config = BrokerConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_secs(5));
        assert_eq!(config.retry_delay(1), Duration::from_secs(10));
        assert_eq!(config.retry_delay(3), Duration::from_secs(40));
    }
}
