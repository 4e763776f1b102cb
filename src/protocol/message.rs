//! Routed message and will value types

use std::sync::Arc;

use bytes::Bytes;

use super::QoS;

/// A routed application message.
///
/// Immutable once constructed. A fresh `Message` is built for each hop
/// (publisher -> broker, broker -> subscriber) because packet identifiers
/// are scoped per link.
///
/// The topic field uses `Arc<str>` for efficient fan-out: when routing a
/// message to multiple subscribers, cloning the topic is O(1) instead of
/// O(n) for String.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name (literal path, no wildcards)
    pub topic: Arc<str>,
    /// Payload (opaque to the core)
    pub payload: Bytes,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Duplicate delivery flag (set on retransmission)
    pub dup: bool,
    /// Client that originated this message on this link
    pub origin: Arc<str>,
    /// Packet identifier (present only for QoS > 0)
    pub packet_id: Option<u16>,
}

impl Message {
    pub fn new(topic: impl Into<Arc<str>>, payload: Bytes, qos: QoS, origin: impl Into<Arc<str>>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain: false,
            dup: false,
            origin: origin.into(),
            packet_id: None,
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    /// Derive the outbound copy for one recipient.
    ///
    /// Caps the QoS by the recipient's granted level (min rule), clears the
    /// per-link packet id and the dup flag, and drops the retain flag; the
    /// session allocates a fresh packet id at hand-off time. Retained
    /// snapshot deliveries keep `retain=true` via [`Message::as_retained`].
    pub fn for_subscriber(&self, granted: QoS) -> Self {
        Self {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos.min(granted),
            retain: false,
            dup: false,
            origin: self.origin.clone(),
            packet_id: None,
        }
    }

    /// Derive a retained-snapshot delivery: same as [`Message::for_subscriber`]
    /// but with the retain flag set so the subscriber can tell it apart from
    /// live traffic.
    pub fn as_retained(&self, granted: QoS) -> Self {
        let mut m = self.for_subscriber(granted);
        m.retain = true;
        m
    }
}

/// A last-will message, registered at CONNECT and published by the broker on
/// the client's behalf on ungraceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    /// Build the synthetic publish for this will on behalf of `client_id`.
    pub fn into_message(self, client_id: &Arc<str>) -> Message {
        Message {
            topic: self.topic,
            payload: self.payload,
            qos: self.qos,
            retain: self.retain,
            dup: false,
            origin: client_id.clone(),
            packet_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_subscriber_caps_qos() {
        let msg = Message::new("sensors/room1/temp", Bytes::from_static(b"21.5"), QoS::ExactlyOnce, "b")
            .with_packet_id(7);
        let out = msg.for_subscriber(QoS::AtLeastOnce);
        assert_eq!(out.qos, QoS::AtLeastOnce);
        assert_eq!(out.packet_id, None);
        assert!(!out.dup);
        assert_eq!(out.topic, msg.topic);
    }

    #[test]
    fn test_retained_delivery_keeps_flag() {
        let msg = Message::new("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce, "b").with_retain(true);
        assert!(msg.as_retained(QoS::AtMostOnce).retain);
        assert!(!msg.for_subscriber(QoS::AtMostOnce).retain);
    }
}
