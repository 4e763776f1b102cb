//! Protocol-level data model
//!
//! Core value types exchanged between the transport collaborator and the
//! broker engine: QoS levels, routed messages, and the typed event/outbound
//! vocabulary. The engine never sees raw bytes; the transport decodes frames
//! into [`Event`]s and encodes [`Outbound`]s back onto the wire.

mod event;
mod message;
mod qos;

pub use event::{CloseReason, ConnectionId, Event, Outbound};
pub use message::{Message, Will};
pub use qos::QoS;
