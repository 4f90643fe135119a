//! Connection admission and token buckets
//!
//! One [`Limits`] instance is owned by the broker. Admission hands out a
//! [`ConnectionPermit`] that gives its slot back when dropped.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;

use crate::config::BrokerConfig;
use crate::error::BrokerError;

pub type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub(crate) const MESSAGES: &str = "messages per second";
pub(crate) const SUBSCRIPTIONS: &str = "subscriptions per minute";

pub struct Limits {
    max_connections: usize,
    max_connections_per_ip: usize,
    max_messages_per_second: u32,
    current: AtomicUsize,
    per_ip: DashMap<IpAddr, usize>,
    messages: Option<DirectLimiter>,
    subscriptions: Option<DirectLimiter>,
}

impl Limits {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_connections_per_ip: config.max_connections_per_ip,
            max_messages_per_second: config.max_messages_per_second,
            current: AtomicUsize::new(0),
            per_ip: DashMap::new(),
            messages: NonZeroU32::new(config.max_messages_per_second)
                .map(|rate| RateLimiter::direct(Quota::per_second(rate))),
            subscriptions: NonZeroU32::new(config.max_subscriptions_per_minute)
                .map(|rate| RateLimiter::direct(Quota::per_minute(rate))),
        }
    }

    /// Reserves a connection slot for `ip`, checked against both the global
    /// and the per-address ceiling.
    pub fn admit(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionPermit, BrokerError> {
        let max = self.max_connections;
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| BrokerError::ResourceExhausted {
                resource: "connections",
                max,
            })?;

        let per_ip_max = self.max_connections_per_ip;
        let admitted = match self.per_ip.entry(ip) {
            Entry::Occupied(mut slot) => {
                if *slot.get() < per_ip_max {
                    *slot.get_mut() += 1;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                if per_ip_max > 0 {
                    slot.insert(1);
                    true
                } else {
                    false
                }
            }
        };

        if !admitted {
            self.current.fetch_sub(1, Ordering::AcqRel);
            debug!("Admission refused for {}: per-address limit {}", ip, per_ip_max);
            return Err(BrokerError::ResourceExhausted {
                resource: "connections per address",
                max: per_ip_max,
            });
        }

        Ok(ConnectionPermit {
            limits: Arc::clone(self),
            ip,
        })
    }

    fn release(&self, ip: IpAddr) {
        self.current.fetch_sub(1, Ordering::AcqRel);
        if let Entry::Occupied(mut slot) = self.per_ip.entry(ip) {
            *slot.get_mut() -= 1;
            if *slot.get() == 0 {
                slot.remove();
            }
        }
    }

    pub fn current_connections(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).map(|n| *n).unwrap_or(0)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn check_publish(&self) -> Result<(), BrokerError> {
        check(self.messages.as_ref(), MESSAGES)
    }

    pub fn check_subscribe(&self) -> Result<(), BrokerError> {
        check(self.subscriptions.as_ref(), SUBSCRIPTIONS)
    }

    /// A fresh bucket with the global message rate, owned by one session
    pub fn connection_limiter(&self) -> Option<DirectLimiter> {
        NonZeroU32::new(self.max_messages_per_second).map(|rate| RateLimiter::direct(Quota::per_second(rate)))
    }
}

impl std::fmt::Debug for Limits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limits")
            .field("max_connections", &self.max_connections)
            .field("max_connections_per_ip", &self.max_connections_per_ip)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

pub(crate) fn check(limiter: Option<&DirectLimiter>, resource: &'static str) -> Result<(), BrokerError> {
    match limiter {
        Some(limiter) if limiter.check().is_err() => Err(BrokerError::RateLimited { resource }),
        _ => Ok(()),
    }
}

/// An admitted connection slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    limits: Arc<Limits>,
    ip: IpAddr,
}

impl ConnectionPermit {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limits.release(self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn limits(max: usize, per_ip: usize) -> Arc<Limits> {
        let config = BrokerConfig {
            max_connections: max,
            max_connections_per_ip: per_ip,
            max_messages_per_second: 3,
            max_subscriptions_per_minute: 2,
            ..BrokerConfig::default()
        };
        Arc::new(Limits::new(&config))
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    // ===== ADMISSION TESTS =====

    #[test]
    fn test_global_limit() {
        let limits = limits(2, 10);
        let first = limits.admit(ip(1)).unwrap();
        let _second = limits.admit(ip(2)).unwrap();

        let third = limits.admit(ip(3));
        assert!(matches!(third, Err(BrokerError::ResourceExhausted { max: 2, .. })));
        assert_eq!(limits.current_connections(), 2);

        drop(first);
        assert_eq!(limits.current_connections(), 1);
        assert!(limits.admit(ip(3)).is_ok());
    }

    #[test]
    fn test_per_ip_limit() {
        let limits = limits(100, 2);
        let _a = limits.admit(ip(1)).unwrap();
        let _b = limits.admit(ip(1)).unwrap();

        assert!(limits.admit(ip(1)).is_err());
        // rejected per-address attempts do not leak a global slot
        assert_eq!(limits.current_connections(), 2);
        assert!(limits.admit(ip(2)).is_ok());
    }

    #[test]
    fn test_permit_drop_releases_address() {
        let limits = limits(100, 1);
        let permit = limits.admit(ip(7)).unwrap();
        assert_eq!(permit.ip(), ip(7));
        assert_eq!(limits.connections_from(ip(7)), 1);

        drop(permit);
        assert_eq!(limits.connections_from(ip(7)), 0);
        assert!(limits.per_ip.is_empty());
    }

    // ===== TOKEN BUCKET TESTS =====

    #[test]
    fn test_message_bucket_exhaustion() {
        let limits = limits(10, 10);
        for _ in 0..3 {
            assert!(limits.check_publish().is_ok());
        }
        assert_eq!(
            limits.check_publish(),
            Err(BrokerError::RateLimited { resource: MESSAGES })
        );
    }

    #[test]
    fn test_subscription_bucket_exhaustion() {
        let limits = limits(10, 10);
        assert!(limits.check_subscribe().is_ok());
        assert!(limits.check_subscribe().is_ok());
        assert!(matches!(limits.check_subscribe(), Err(BrokerError::RateLimited { .. })));
    }

    #[test]
    fn test_zero_rate_disables_bucket() {
        let config = BrokerConfig {
            max_messages_per_second: 0,
            ..BrokerConfig::default()
        };
        let limits = Limits::new(&config);
        for _ in 0..1000 {
            assert!(limits.check_publish().is_ok());
        }
        assert!(limits.connection_limiter().is_none());
    }
}
