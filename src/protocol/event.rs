//! Typed transport boundary
//!
//! The transport collaborator decodes wire frames into [`Event`]s tagged
//! with a [`ConnectionId`] and hands them to the broker engine; the engine
//! replies with [`Outbound`] traffic through the per-connection channel the
//! transport registered. Raw packet framing never crosses this boundary.

use std::sync::Arc;

use bytes::Bytes;

use super::{Message, QoS, Will};

/// Opaque identifier the transport assigns to each live connection.
pub type ConnectionId = u64;

/// Decoded protocol events delivered by the transport layer.
#[derive(Debug, Clone)]
pub enum Event {
    /// CONNECT-equivalent. Only legal event on a pending connection.
    Connect {
        client_id: Arc<str>,
        clean_session: bool,
        /// Keepalive interval in seconds (0 disables the idle sweep)
        keepalive: u16,
        username: Option<String>,
        /// Opaque credential, forwarded to the authentication hook
        credential: Option<Bytes>,
        will: Option<Will>,
    },
    /// SUBSCRIBE with one or more (filter, requested QoS) entries
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, QoS)>,
    },
    /// UNSUBSCRIBE
    Unsubscribe { packet_id: u16, filters: Vec<String> },
    /// PUBLISH from a connected client
    Publish(Message),
    /// QoS 1 acknowledgment for a broker->client delivery
    PubAck { packet_id: u16 },
    /// QoS 2 step 1 response for a broker->client delivery
    PubRec { packet_id: u16 },
    /// QoS 2 release for a client->broker publish
    PubRel { packet_id: u16 },
    /// QoS 2 completion for a broker->client delivery
    PubComp { packet_id: u16 },
    /// PINGREQ keepalive probe
    PingReq,
    /// Graceful DISCONNECT (suppresses the will)
    Disconnect,
}

/// Outbound traffic the engine hands back to the transport for one
/// connection. The transport owns encoding and the socket write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// CONNACK-equivalent, sent once on successful connect
    ConnAck { session_present: bool },
    /// PUBLISH to this subscriber; packet id (QoS > 0) is inside the message
    Deliver(Message),
    /// QoS 1 acknowledgment for a client->broker publish
    PubAck { packet_id: u16 },
    /// QoS 2 step 1 for a client->broker publish
    PubRec { packet_id: u16 },
    /// QoS 2 release for a broker->client delivery
    PubRel { packet_id: u16 },
    /// QoS 2 completion for a client->broker publish
    PubComp { packet_id: u16 },
    /// SUBACK with the granted QoS per filter (None = rejected filter)
    SubAck {
        packet_id: u16,
        granted: Vec<Option<QoS>>,
    },
    /// UNSUBACK
    UnsubAck { packet_id: u16 },
    /// PINGRESP
    PingResp,
    /// Instruct the transport to close this connection
    Close(CloseReason),
}

/// Why the engine asked the transport to close a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Malformed event or event illegal in the current state
    ProtocolViolation,
    /// Authentication hook denied the connect
    AuthDenied,
    /// Another connection took over this client id
    SessionTakenOver,
    /// Keepalive deadline expired
    KeepAliveTimeout,
    /// Broker is shutting down
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ProtocolViolation => write!(f, "protocol violation"),
            CloseReason::AuthDenied => write!(f, "not authorized"),
            CloseReason::SessionTakenOver => write!(f, "session taken over"),
            CloseReason::KeepAliveTimeout => write!(f, "keepalive timeout"),
            CloseReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}
