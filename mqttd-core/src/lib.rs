//! # mqttd core
//!
//! Runtime-agnostic MQTT 3.1.1 / 5.0 broker engine.
//!
//! This library contains the wire codec, the subscription trie, the retained
//! store, admission and rate limits, and the per-connection session state
//! machine. It performs no I/O: a runtime binding reads bytes from a
//! [`transport::Transport`], feeds decoded packets to a [`session::Session`]
//! and writes back what it returns.
//!
//! ## Features
//!
//! - **MQTT 3.1.1 and 5.0** on the wire, byte-exact, negotiated per connection
//! - **QoS 0, 1 and 2** with retransmission and Receive Maximum flow control
//! - **Wildcards** `+` and `#`, with `$`-prefixed topics hidden from root wildcards
//! - **Retained messages** with Message Expiry
//! - **Will messages**, topic aliases and subscription identifiers
//! - **Limits** on connections (global and per address), messages and subscriptions
//!
//! ## Limitations
//!
//! - No persistent sessions: all session state ends with the connection
//! - No shared subscriptions
//! - No authentication or authorization
//! - No TLS (left to the transport)

pub mod broker;
pub mod config;
pub mod error;
pub mod limits;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topics;
pub mod transport;
pub mod trie;

/// Broker-assigned handle of one live connection
pub type SessionId = u64;

pub use broker::{Broker, Mailbox, Outbound};
pub use config::BrokerConfig;
pub use error::{BrokerError, ErrorKind, SessionError};
pub use limits::ConnectionPermit;
pub use message::{Delivery, Message};
pub use metrics::{Health, HealthStatus, MetricsSnapshot};
pub use protocol::{Packet, ProtocolError, ProtocolVersion, QoS, ReasonCode};
pub use session::{Session, SessionState};
pub use transport::Transport;
