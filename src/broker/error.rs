//! Broker engine error types

use std::fmt;

/// Errors surfaced by the broker engine.
///
/// Only `ProtocolViolation` and `AuthDenied` close the connection; the rest
/// reject or degrade a single operation while the connection stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerError {
    /// Malformed event, or an event illegal in the connection's state
    ProtocolViolation(&'static str),
    /// Malformed subscription filter syntax
    InvalidFilter(&'static str),
    /// Wildcard or other illegal character in a publish topic
    InvalidTopic(&'static str),
    /// Payload exceeds the configured maximum size
    PayloadTooLarge,
    /// Every packet identifier is in use; caller must apply backpressure
    TooManyInflight,
    /// An offline queue overflowed and dropped its oldest entry
    QueueOverflow,
    /// Event referenced a session that no longer exists
    UnknownClient,
    /// Authentication hook denied the connect
    AuthDenied,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            BrokerError::InvalidFilter(msg) => write!(f, "invalid topic filter: {}", msg),
            BrokerError::InvalidTopic(msg) => write!(f, "invalid topic name: {}", msg),
            BrokerError::PayloadTooLarge => write!(f, "payload exceeds maximum size"),
            BrokerError::TooManyInflight => write!(f, "no packet identifier available"),
            BrokerError::QueueOverflow => write!(f, "offline queue overflow"),
            BrokerError::UnknownClient => write!(f, "unknown client"),
            BrokerError::AuthDenied => write!(f, "not authorized"),
        }
    }
}

impl std::error::Error for BrokerError {}
