//! # mqttd tokio
//!
//! Tokio runtime support for the mqttd broker engine.
//!
//! This crate provides a [`Transport`](mqttd_core::Transport) over any Tokio
//! byte stream, the per-connection driver loop and a TCP server with
//! connection admission and graceful shutdown. It re-exports all types from
//! `mqttd-core` for convenience.
//!
//! ## Usage
//!
//! ```no_run
//! use mqttd_tokio::{MqttServer, MqttServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let server = MqttServer::with_config(MqttServerConfig {
//!         bind_addr: "127.0.0.1:1883".to_owned(),
//!         ..MqttServerConfig::default()
//!     });
//!     server.run().await
//! }
//! ```

pub mod handler;
pub mod io;
pub mod server;

// Re-export core for convenience
pub use mqttd_core::*;

pub use handler::{handle_connection, HandlerConfig};
pub use io::{read_frame, read_packet, StreamTransport};
pub use server::{MqttServer, MqttServerConfig};
