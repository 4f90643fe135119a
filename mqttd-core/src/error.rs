//! Error types for the broker engine
//!
//! [`BrokerError`] is returned by shared broker operations, [`SessionError`]
//! by the per-connection state machine and its driver. Both map onto the
//! five-way [`ErrorKind`] taxonomy that decides how a connection reacts.

use crate::protocol::{ProtocolError, ReasonCode};

/// How a connection reacts to an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bytes did not form a valid packet: close, v5 peers get DISCONNECT 0x81
    MalformedPacket,
    /// A well-formed packet arrived where the protocol forbids it: close, v5 peers get DISCONNECT 0x82
    ProtocolViolation,
    /// Operation rejected, connection kept
    RateLimited,
    /// Rejected at admission
    ResourceExhausted,
    /// Peer went away, clean teardown
    EndOfStream,
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ErrorKind::MalformedPacket => "MalformedPacket",
            ErrorKind::ProtocolViolation => "ProtocolViolation",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::EndOfStream => "EndOfStream",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// A token bucket ran dry
    #[error("Rate limit exceeded: {resource}")]
    RateLimited { resource: &'static str },

    /// A connection limit was reached
    #[error("Resource exhausted: {resource} (max {max})")]
    ResourceExhausted { resource: &'static str, max: usize },

    #[error("Invalid topic name: {topic:?}")]
    InvalidTopicName { topic: String },

    #[error("Invalid topic filter: {filter:?}")]
    InvalidTopicFilter { filter: String },

    /// The broker is shutting down
    #[error("Broker is not accepting new work")]
    NotAccepting,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::RateLimited { .. } => ErrorKind::RateLimited,
            BrokerError::ResourceExhausted { .. } | BrokerError::NotAccepting => ErrorKind::ResourceExhausted,
            BrokerError::InvalidTopicName { .. } | BrokerError::InvalidTopicFilter { .. } => {
                ErrorKind::ProtocolViolation
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Malformed packet: {error}")]
    Protocol {
        #[from]
        error: ProtocolError,
    },

    #[error("Protocol violation: {detail}")]
    ProtocolViolation { reason: ReasonCode, detail: &'static str },

    #[error("Broker error: {error}")]
    Broker {
        #[from]
        error: BrokerError,
    },

    #[error("End of stream")]
    EndOfStream,

    #[error("Keep alive timeout ({keep_alive}s)")]
    KeepAliveTimeout { keep_alive: u16 },

    #[error("Retransmission retries exhausted for packet {packet_id}")]
    RetriesExhausted { packet_id: u16 },

    #[error("Session taken over by a new connection")]
    Evicted,

    #[error("Transport error: {source}")]
    Transport {
        #[from]
        source: std::io::Error,
    },
}

impl SessionError {
    pub(crate) fn violation(detail: &'static str) -> Self {
        SessionError::ProtocolViolation {
            reason: ReasonCode::PROTOCOL_ERROR,
            detail,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Protocol { .. } => ErrorKind::MalformedPacket,
            SessionError::ProtocolViolation { .. } | SessionError::RetriesExhausted { .. } => {
                ErrorKind::ProtocolViolation
            }
            SessionError::Broker { error } => error.kind(),
            SessionError::EndOfStream
            | SessionError::KeepAliveTimeout { .. }
            | SessionError::Evicted
            | SessionError::Transport { .. } => ErrorKind::EndOfStream,
        }
    }

    /// Reason code for the DISCONNECT a v5 peer should receive, if any.
    pub fn disconnect_reason(&self) -> Option<ReasonCode> {
        match self {
            SessionError::Protocol {
                error: ProtocolError::PacketTooLarge { .. },
            } => Some(ReasonCode::PACKET_TOO_LARGE),
            SessionError::Protocol { .. } => Some(ReasonCode::MALFORMED_PACKET),
            SessionError::ProtocolViolation { reason, .. } => Some(*reason),
            SessionError::Broker { error } => Some(match error {
                BrokerError::RateLimited { .. } | BrokerError::ResourceExhausted { .. } => {
                    ReasonCode::QUOTA_EXCEEDED
                }
                BrokerError::InvalidTopicName { .. } => ReasonCode::TOPIC_NAME_INVALID,
                BrokerError::InvalidTopicFilter { .. } => ReasonCode::TOPIC_FILTER_INVALID,
                BrokerError::NotAccepting => ReasonCode::SERVER_SHUTTING_DOWN,
            }),
            SessionError::KeepAliveTimeout { .. } => Some(ReasonCode::KEEP_ALIVE_TIMEOUT),
            SessionError::RetriesExhausted { .. } => Some(ReasonCode::UNSPECIFIED_ERROR),
            SessionError::Evicted => Some(ReasonCode::SESSION_TAKEN_OVER),
            SessionError::EndOfStream | SessionError::Transport { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_maps_to_0x81() {
        let err = SessionError::from(ProtocolError::InvalidQosLevel { level: 3 });
        assert_eq!(err.kind(), ErrorKind::MalformedPacket);
        assert_eq!(err.disconnect_reason(), Some(ReasonCode::MALFORMED_PACKET));
    }

    #[test]
    fn test_oversized_packet_reason() {
        let err = SessionError::from(ProtocolError::PacketTooLarge {
            max_size: 10,
            actual_size: 20,
        });
        assert_eq!(err.disconnect_reason(), Some(ReasonCode::PACKET_TOO_LARGE));
    }

    #[test]
    fn test_violation_maps_to_0x82() {
        let err = SessionError::violation("second CONNECT");
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(err.disconnect_reason(), Some(ReasonCode::PROTOCOL_ERROR));
    }

    #[test]
    fn test_broker_error_kinds() {
        let limited = SessionError::from(BrokerError::RateLimited { resource: "messages" });
        assert_eq!(limited.kind(), ErrorKind::RateLimited);

        let exhausted = BrokerError::ResourceExhausted {
            resource: "connections",
            max: 2,
        };
        assert_eq!(exhausted.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(BrokerError::NotAccepting.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_teardown_errors() {
        assert_eq!(SessionError::EndOfStream.kind(), ErrorKind::EndOfStream);
        assert_eq!(SessionError::EndOfStream.disconnect_reason(), None);
        assert_eq!(
            SessionError::Evicted.disconnect_reason(),
            Some(ReasonCode::SESSION_TAKEN_OVER)
        );
        assert_eq!(
            SessionError::KeepAliveTimeout { keep_alive: 10 }.disconnect_reason(),
            Some(ReasonCode::KEEP_ALIVE_TIMEOUT)
        );

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = SessionError::from(io);
        assert_eq!(err.kind(), ErrorKind::EndOfStream);
        assert_eq!(err.disconnect_reason(), None);
    }
}
