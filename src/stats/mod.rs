//! Broker statistics
//!
//! Monotonic counters bumped on the hot paths plus a point-in-time snapshot
//! that reads the live gauges (sessions, subscriptions, retained state) from
//! the owning structures. Snapshots serialize to JSON for the periodic
//! stats log line and for embedders polling broker health.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::session::SessionTable;
use crate::topic::TopicTree;

/// Shared counter block, one per broker.
#[derive(Debug, Default)]
pub struct BrokerStats {
    /// CONNECT events accepted since startup
    pub connects: AtomicU64,
    /// PUBLISH events accepted from clients
    pub messages_received: AtomicU64,
    /// Deliveries handed to the transport
    pub messages_sent: AtomicU64,
    /// Messages dropped by queue overflow or zero capacity
    pub messages_dropped: AtomicU64,
    /// Inflight entries abandoned after the retry ceiling
    pub deliveries_failed: AtomicU64,
    /// Acknowledgments that referenced no live inflight entry
    pub acks_ignored: AtomicU64,
    /// Duplicate re-sends performed by the retry tick
    pub retransmits: AtomicU64,
    /// Sessions force-disconnected by the keepalive sweep
    pub keepalive_expirations: AtomicU64,
}

impl BrokerStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Build a snapshot, reading live gauges from the session table and
    /// topic tree.
    pub fn snapshot(&self, sessions: &SessionTable, tree: &TopicTree) -> StatsSnapshot {
        let mut queued_messages = 0;
        let mut inflight_messages = 0;
        for session in sessions.all_sessions() {
            let s = session.read();
            queued_messages += s.queue_depth();
            inflight_messages += s.inflight_count();
        }

        StatsSnapshot {
            connected_clients: sessions.connected_count(),
            total_sessions: sessions.len(),
            subscriptions: tree.subscription_count(),
            retained_messages: tree.retained_count(),
            topic_nodes: tree.node_count(),
            queued_messages,
            inflight_messages,
            connects: self.connects.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            acks_ignored: self.acks_ignored.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            keepalive_expirations: self.keepalive_expirations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time broker state, safe to serialize and ship.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connected_clients: usize,
    pub total_sessions: usize,
    pub subscriptions: usize,
    pub retained_messages: usize,
    pub topic_nodes: usize,
    pub queued_messages: usize,
    pub inflight_messages: usize,
    pub connects: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub deliveries_failed: u64,
    pub acks_ignored: u64,
    pub retransmits: u64,
    pub keepalive_expirations: u64,
}
