//! Broker counters, metrics snapshot and health

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub total_connections: AtomicU64,
    pub total_messages_published: AtomicU64,
}

impl Counters {
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.total_messages_published.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the broker counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub current_connections: u64,
    pub total_messages_published: u64,
    pub retained_messages_count: u64,
    pub active_subscriptions_count: u64,
}

impl MetricsSnapshot {
    /// Named values, in a stable order, for exporters
    pub fn entries(&self) -> [(&'static str, u64); 5] {
        [
            ("total_connections", self.total_connections),
            ("current_connections", self.current_connections),
            ("total_messages_published", self.total_messages_published),
            ("retained_messages_count", self.retained_messages_count),
            ("active_subscriptions_count", self.active_subscriptions_count),
        ]
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl core::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Health {
    pub status: HealthStatus,
    /// Whether new connections are admitted
    pub running: bool,
    pub connections: usize,
}

impl Health {
    pub(crate) fn evaluate(running: bool, connections: usize, max_connections: usize) -> Self {
        let status = if running && connections < max_connections {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        Self {
            status,
            running,
            connections,
        }
    }
}
