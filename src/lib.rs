//! rosmq - In-memory MQTT-class message broker core
//!
//! Topic-tree routing with wildcard matching and retained messages, per-client
//! sessions with QoS 0/1/2 delivery state and offline queues, and a broker
//! engine that drives both behind a typed transport boundary. Transports
//! decode wire frames into [`protocol::Event`]s and drain
//! [`protocol::Outbound`] traffic; the core never touches bytes.

pub mod broker;
pub mod config;
pub mod hooks;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod topic;

pub use broker::{Broker, BrokerError, BrokerOptions};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use protocol::{CloseReason, ConnectionId, Event, Message, Outbound, QoS, Will};
pub use session::{DeliveryOutcome, SessionLimits, SessionTable};
pub use stats::StatsSnapshot;
pub use topic::TopicTree;
