//! Hierarchical topic tree
//!
//! One node per path segment. Each node carries the subscribers whose filter
//! terminates there, the subscribers whose filter ends in `#` at that level,
//! and at most one retained message for the exact literal path. Nodes are
//! created lazily on first subscribe or retained publish and pruned once
//! they hold no subscribers, no retained message, and no children.

use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use crate::protocol::{Message, QoS};

#[derive(Debug, Default)]
pub(crate) struct TreeNode {
    /// Children indexed by literal segment
    children: AHashMap<CompactString, TreeNode>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TreeNode>>,
    /// Subscribers whose filter ends with # at this level
    multi_subscribers: AHashMap<Arc<str>, QoS>,
    /// Subscribers whose filter terminates at this node
    subscribers: AHashMap<Arc<str>, QoS>,
    /// Retained message for this exact literal path
    retained: Option<Message>,
}

impl TreeNode {
    /// True when nothing references this node and it can be pruned.
    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.single_wildcard.is_none()
            && self.multi_subscribers.is_empty()
            && self.subscribers.is_empty()
            && self.retained.is_none()
    }

    /// Insert a subscriber entry at the node the filter terminates on.
    ///
    /// The filter is assumed validated; `#` only appears as the final
    /// segment and `+`/`#` occupy whole segments.
    pub(crate) fn subscribe(&mut self, filter: &str, client_id: Arc<str>, qos: QoS) {
        let mut node = self;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            let is_last = levels.peek().is_none();

            if level == "#" {
                node.multi_subscribers.insert(client_id, qos);
                return;
            } else if level == "+" {
                node = node.single_wildcard.get_or_insert_with(Default::default);
            } else {
                node = node.children.entry(CompactString::new(level)).or_default();
            }

            if is_last {
                node.subscribers.insert(client_id, qos);
                return;
            }
        }
    }

    /// Remove one subscriber entry; prunes empty nodes on the way back up.
    /// Returns true if an entry was removed.
    pub(crate) fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::unsubscribe_recursive(self, &levels, 0, client_id)
    }

    fn unsubscribe_recursive(
        node: &mut TreeNode,
        levels: &[&str],
        index: usize,
        client_id: &str,
    ) -> bool {
        if index >= levels.len() {
            return node.subscribers.remove(client_id).is_some();
        }

        let level = levels[index];

        if level == "#" {
            // Validated filters only carry # as the final segment
            return node.multi_subscribers.remove(client_id).is_some();
        }

        if level == "+" {
            if let Some(child) = node.single_wildcard.as_mut() {
                let removed = Self::unsubscribe_recursive(child, levels, index + 1, client_id);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                return removed;
            }
            return false;
        }

        if let Some(child) = node.children.get_mut(level) {
            let removed = Self::unsubscribe_recursive(child, levels, index + 1, client_id);
            if child.is_empty() {
                node.children.remove(level);
            }
            return removed;
        }
        false
    }

    /// Remove every entry for `client_id` anywhere in the tree, pruning as
    /// subtrees drain.
    pub(crate) fn remove_client(&mut self, client_id: &str) {
        self.subscribers.remove(client_id);
        self.multi_subscribers.remove(client_id);

        if let Some(child) = self.single_wildcard.as_mut() {
            child.remove_client(client_id);
            if child.is_empty() {
                self.single_wildcard = None;
            }
        }

        self.children.retain(|_, child| {
            child.remove_client(client_id);
            !child.is_empty()
        });
    }

    /// Walk the tree along `topic`, firing the callback for every subscriber
    /// entry whose filter matches.
    ///
    /// `$`-prefixed topics never match a `+` or `#` at the root.
    pub(crate) fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&Arc<str>, QoS),
    {
        let is_system = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(self, &levels, 0, is_system, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TreeNode,
        levels: &[&str],
        index: usize,
        is_system: bool,
        callback: &mut F,
    ) where
        F: FnMut(&Arc<str>, QoS),
    {
        // A # terminating here matches the rest of the path, including
        // zero remaining segments (but never a $-topic from the root)
        if !(is_system && index == 0) {
            for (client_id, qos) in &node.multi_subscribers {
                callback(client_id, *qos);
            }
        }

        if index >= levels.len() {
            for (client_id, qos) in &node.subscribers {
                callback(client_id, *qos);
            }
            return;
        }

        if !(is_system && index == 0) {
            if let Some(child) = &node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system, callback);
            }
        }

        if let Some(child) = node.children.get(levels[index]) {
            Self::matches_recursive(child, levels, index + 1, is_system, callback);
        }
    }

    /// Store or clear the retained message at the exact literal path.
    /// Clearing prunes emptied nodes.
    pub(crate) fn set_retained(&mut self, topic: &str, message: Option<Message>) {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::set_retained_recursive(self, &levels, 0, message);
    }

    fn set_retained_recursive(
        node: &mut TreeNode,
        levels: &[&str],
        index: usize,
        message: Option<Message>,
    ) {
        if index >= levels.len() {
            node.retained = message;
            return;
        }

        let level = levels[index];
        if message.is_none() {
            // Clear path: don't create nodes, prune on the way out
            if let Some(child) = node.children.get_mut(level) {
                Self::set_retained_recursive(child, levels, index + 1, None);
                if child.is_empty() {
                    node.children.remove(level);
                }
            }
            return;
        }

        let child = node.children.entry(CompactString::new(level)).or_default();
        Self::set_retained_recursive(child, levels, index + 1, message);
    }

    /// Collect every retained message whose topic matches `filter`.
    pub(crate) fn retained_matching(&self, filter: &str, out: &mut Vec<Message>) {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::retained_recursive(self, &levels, 0, out);
    }

    fn retained_recursive(node: &TreeNode, levels: &[&str], index: usize, out: &mut Vec<Message>) {
        if index >= levels.len() {
            if let Some(msg) = &node.retained {
                out.push(msg.clone());
            }
            return;
        }

        match levels[index] {
            "#" => {
                // Remainder of the subtree, including this node; $-subtrees
                // at the root are only reachable by explicit literal prefix
                if let Some(msg) = &node.retained {
                    out.push(msg.clone());
                }
                for (name, child) in &node.children {
                    if index == 0 && name.starts_with('$') {
                        continue;
                    }
                    Self::collect_all_retained(child, out);
                }
            }
            "+" => {
                for (name, child) in &node.children {
                    if index == 0 && name.starts_with('$') {
                        continue;
                    }
                    Self::retained_recursive(child, levels, index + 1, out);
                }
            }
            literal => {
                if let Some(child) = node.children.get(literal) {
                    Self::retained_recursive(child, levels, index + 1, out);
                }
            }
        }
    }

    fn collect_all_retained(node: &TreeNode, out: &mut Vec<Message>) {
        if let Some(msg) = &node.retained {
            out.push(msg.clone());
        }
        for child in node.children.values() {
            Self::collect_all_retained(child, out);
        }
    }

    /// (subscription entries, retained messages, nodes) in this subtree.
    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        let mut subs = self.subscribers.len() + self.multi_subscribers.len();
        let mut retained = usize::from(self.retained.is_some());
        let mut nodes = 1;

        if let Some(child) = &self.single_wildcard {
            let (s, r, n) = child.counts();
            subs += s;
            retained += r;
            nodes += n;
        }
        for child in self.children.values() {
            let (s, r, n) = child.counts();
            subs += s;
            retained += r;
            nodes += n;
        }
        (subs, retained, nodes)
    }
}
