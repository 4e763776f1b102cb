//! Topic matching and subscription management
//!
//! A hierarchical index of subscription filters supporting exact,
//! single-level (`+`) and multi-level (`#`) wildcard matching. Retained
//! messages live at the literal node for their exact topic, so a single
//! structure answers both "who gets this publish" and "what retained state
//! matches this new subscription".
//!
//! The tree is read on every publish and written only on
//! subscribe/unsubscribe/retain, so it sits behind a single `RwLock`;
//! matching takes the read lock only.

mod tree;
pub mod validation;

pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::broker::BrokerError;
use crate::protocol::{Message, QoS};
use tree::TreeNode;

/// Thread-safe topic tree shared by every connection handler.
#[derive(Debug, Default)]
pub struct TopicTree {
    root: RwLock<TreeNode>,
}

impl TopicTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a subscriber entry for `filter`.
    ///
    /// Grants `min(requested, max_qos)` and returns the granted level.
    /// Fails with `InvalidFilter` on malformed wildcard placement.
    pub fn subscribe(
        &self,
        client_id: &Arc<str>,
        filter: &str,
        requested: QoS,
        max_qos: QoS,
    ) -> Result<QoS, BrokerError> {
        validate_topic_filter(filter)?;
        let granted = requested.min(max_qos);
        self.root.write().subscribe(filter, client_id.clone(), granted);
        Ok(granted)
    }

    /// Remove one subscriber entry, pruning empty nodes up the path.
    /// Returns true if the entry existed.
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        if validate_topic_filter(filter).is_err() {
            return false;
        }
        self.root.write().unsubscribe(filter, client_id)
    }

    /// Remove every subscription held by `client_id`.
    pub fn unsubscribe_all(&self, client_id: &str) {
        self.root.write().remove_client(client_id);
    }

    /// Compute the delivery set for a publish topic.
    ///
    /// Duplicates across multiple matching filters for the same client
    /// collapse to one entry at the highest matched QoS; the per-recipient
    /// delivery QoS (min rule) is applied by the caller.
    pub fn matches(&self, topic: &str) -> Vec<(Arc<str>, QoS)> {
        let mut best: ahash::AHashMap<Arc<str>, QoS> = ahash::AHashMap::new();
        self.root.read().matches(topic, |client_id, qos| {
            let entry = best.entry(client_id.clone()).or_insert(qos);
            if qos > *entry {
                *entry = qos;
            }
        });
        best.into_iter().collect()
    }

    /// Store or clear the retained message for an exact literal topic.
    /// `None` (or an empty payload upstream) clears.
    pub fn set_retained(&self, topic: &str, message: Option<Message>) {
        self.root.write().set_retained(topic, message);
    }

    /// Every currently retained message whose topic matches `filter`.
    pub fn retained_snapshot(&self, filter: &str) -> Vec<Message> {
        let mut out = Vec::new();
        self.root.read().retained_matching(filter, &mut out);
        out
    }

    /// Total subscription entries across all nodes.
    pub fn subscription_count(&self) -> usize {
        self.root.read().counts().0
    }

    /// Retained messages currently stored.
    pub fn retained_count(&self) -> usize {
        self.root.read().counts().1
    }

    /// Live tree nodes (topic count for monitoring).
    pub fn node_count(&self) -> usize {
        self.root.read().counts().2
    }
}
