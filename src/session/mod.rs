//! Client session management
//!
//! Per-client lifecycle state: connection status, subscriptions, queued and
//! inflight messages, packet identifier allocation, and the keepalive
//! deadline. Sessions with `clean_session=false` survive disconnects and are
//! reattached on the next CONNECT with the same client id, restoring
//! subscriptions and queued/inflight messages.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::broker::BrokerError;
use crate::protocol::{ConnectionId, Message, QoS, Will};

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attached to a live transport connection
    Connected(ConnectionId),
    /// Detached; state persists only for non-clean sessions
    Disconnected,
}

/// QoS 2 sender-side handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, waiting for PUBREC
    AwaitingRec,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    AwaitingComp,
}

/// An outbound QoS 1/2 message awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub packet_id: u16,
    pub message: Message,
    /// None for QoS 1
    pub qos2_state: Option<Qos2State>,
    pub sent_at: Instant,
    pub retry_count: u32,
}

/// Per-session capacity limits, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Maximum concurrent outbound inflight entries
    pub max_inflight: usize,
    /// Maximum queued messages while the window is full or the client is offline
    pub max_queued: usize,
    /// Maximum inbound QoS 2 publishes awaiting PUBREL
    pub max_awaiting_rel: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        // Defaults match the reference deployment's broker settings
        Self {
            max_inflight: 20,
            max_queued: 100,
            max_awaiting_rel: 100,
        }
    }
}

/// Result of routing one message toward one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed off now; the engine must emit the delivery
    Delivered(Message),
    /// Stored for later; `dropped_oldest` reports a forced queue eviction
    Queued { dropped_oldest: bool },
    /// Rejected: zero queue capacity or unknown client
    Dropped,
}

/// A due retransmission produced by the retry scan.
#[derive(Debug, Clone)]
pub enum Retransmit {
    /// Re-send the PUBLISH with the duplicate flag set
    Publish(Message),
    /// Re-send the PUBREL for an entry awaiting PUBCOMP
    Release(u16),
}

/// One client's session state.
///
/// Exclusively owned by its entry in the [`SessionTable`]; only the broker
/// engine's serialized access path mutates it.
pub struct Session {
    pub client_id: Arc<str>,
    pub clean_session: bool,
    pub username: Option<String>,
    /// Keepalive interval in seconds (0 disables the idle sweep)
    pub keepalive: u16,
    pub last_activity: Instant,
    pub state: ConnectionState,
    /// Active subscriptions: filter -> granted QoS
    pub subscriptions: AHashMap<String, QoS>,
    /// Last-will message, published on ungraceful disconnect
    pub will: Option<Will>,
    /// FIFO of messages awaiting a free inflight slot or reconnection
    queued: VecDeque<Message>,
    /// Outbound QoS 1/2 messages keyed by packet identifier
    inflight: AHashMap<u16, InflightMessage>,
    /// Inbound QoS 2 publishes held until PUBREL, keyed by the sender's id
    awaiting_release: AHashMap<u16, Message>,
    next_packet_id: u16,
    limits: SessionLimits,
}

impl Session {
    pub fn new(client_id: Arc<str>, limits: SessionLimits) -> Self {
        Self {
            client_id,
            clean_session: true,
            username: None,
            keepalive: 60,
            last_activity: Instant::now(),
            state: ConnectionState::Disconnected,
            subscriptions: AHashMap::new(),
            will: None,
            queued: VecDeque::new(),
            inflight: AHashMap::new(),
            awaiting_release: AHashMap::new(),
            next_packet_id: 1,
            limits,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_))
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self.state {
            ConnectionState::Connected(id) => Some(id),
            ConnectionState::Disconnected => None,
        }
    }

    /// Update the last-activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether the keepalive deadline has passed.
    ///
    /// The grace window is 1.5x the negotiated interval; keepalive 0
    /// disables the sweep for this session.
    pub fn is_keepalive_expired(&self, now: Instant) -> bool {
        if self.keepalive == 0 {
            return false;
        }
        let timeout = Duration::from_secs((self.keepalive as u64 * 3) / 2);
        now.duration_since(self.last_activity) > timeout
    }

    /// Allocate the next free packet identifier.
    ///
    /// Ids roll through the 16-bit namespace, skipping 0 and any id still
    /// live in the inflight table. Fails only when every id is in use.
    pub fn next_packet_id(&mut self) -> Result<u16, BrokerError> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }
            if !self.inflight.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(BrokerError::TooManyInflight)
    }

    /// Route one outbound message: hand off now if the session is connected
    /// and the inflight window has room, otherwise queue (bounded, oldest
    /// dropped on overflow).
    ///
    /// Messages are queued behind any already-queued backlog so that
    /// per-publisher order is preserved across window stalls.
    pub fn deliver_or_queue(&mut self, message: Message) -> DeliveryOutcome {
        let window_open = message.qos == QoS::AtMostOnce || self.inflight.len() < self.limits.max_inflight;

        if self.is_connected() && self.queued.is_empty() && window_open {
            match self.stage_outbound(message) {
                Ok(staged) => return DeliveryOutcome::Delivered(staged),
                Err(msg) => return self.queue_message(msg),
            }
        }
        self.queue_message(message)
    }

    /// Record a QoS 1/2 message in the inflight table with a fresh packet id.
    /// Gives the message back for queueing if the id namespace is exhausted.
    fn stage_outbound(&mut self, mut message: Message) -> Result<Message, Message> {
        if message.qos == QoS::AtMostOnce {
            return Ok(message);
        }
        let packet_id = match self.next_packet_id() {
            Ok(id) => id,
            Err(_) => return Err(message),
        };
        message.packet_id = Some(packet_id);
        let qos2_state = (message.qos == QoS::ExactlyOnce).then_some(Qos2State::AwaitingRec);
        self.inflight.insert(
            packet_id,
            InflightMessage {
                packet_id,
                message: message.clone(),
                qos2_state,
                sent_at: Instant::now(),
                retry_count: 0,
            },
        );
        Ok(message)
    }

    fn queue_message(&mut self, message: Message) -> DeliveryOutcome {
        if self.limits.max_queued == 0 {
            return DeliveryOutcome::Dropped;
        }
        let mut dropped_oldest = false;
        if self.queued.len() >= self.limits.max_queued {
            self.queued.pop_front();
            dropped_oldest = true;
        }
        self.queued.push_back(message);
        DeliveryOutcome::Queued { dropped_oldest }
    }

    /// Drain queued messages into the inflight window, in FIFO order, until
    /// the window fills. Returns the messages now ready to send.
    pub fn drain_ready(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        if !self.is_connected() {
            return out;
        }
        while let Some(front) = self.queued.front() {
            if front.qos != QoS::AtMostOnce && self.inflight.len() >= self.limits.max_inflight {
                break;
            }
            let Some(message) = self.queued.pop_front() else {
                break;
            };
            match self.stage_outbound(message) {
                Ok(staged) => out.push(staged),
                Err(message) => {
                    // Id namespace exhausted; put it back and stop
                    self.queued.push_front(message);
                    break;
                }
            }
        }
        out
    }

    /// QoS 1 acknowledgment. Unknown or mismatched ids are ignored.
    pub fn acknowledge(&mut self, packet_id: u16) -> bool {
        match self.inflight.get(&packet_id) {
            Some(entry) if entry.qos2_state.is_none() => {
                self.inflight.remove(&packet_id);
                true
            }
            _ => false,
        }
    }

    /// QoS 2 sender side: PUBREC received. Transitions AwaitingRec ->
    /// AwaitingComp; the caller emits the PUBREL.
    pub fn on_rec(&mut self, packet_id: u16) -> bool {
        match self.inflight.get_mut(&packet_id) {
            Some(entry) if entry.qos2_state == Some(Qos2State::AwaitingRec) => {
                entry.qos2_state = Some(Qos2State::AwaitingComp);
                entry.sent_at = Instant::now();
                entry.retry_count = 0;
                true
            }
            _ => false,
        }
    }

    /// QoS 2 sender side: PUBCOMP received, handshake complete.
    pub fn on_comp(&mut self, packet_id: u16) -> bool {
        match self.inflight.get(&packet_id) {
            Some(entry) if entry.qos2_state == Some(Qos2State::AwaitingComp) => {
                self.inflight.remove(&packet_id);
                true
            }
            _ => false,
        }
    }

    /// QoS 2 receiver side: an inbound PUBLISH arrived. Stores the message
    /// until PUBREL; a retransmit of a live id is absorbed without
    /// re-storing, so release delivers exactly once.
    pub fn on_publish_received(&mut self, packet_id: u16, message: Message) -> Result<(), BrokerError> {
        if self.awaiting_release.contains_key(&packet_id) {
            return Ok(());
        }
        if self.awaiting_release.len() >= self.limits.max_awaiting_rel {
            return Err(BrokerError::TooManyInflight);
        }
        self.awaiting_release.insert(packet_id, message);
        Ok(())
    }

    /// QoS 2 receiver side: PUBREL arrived. Returns the pending message for
    /// application-level delivery, or None for an unknown/duplicate release.
    pub fn on_release(&mut self, packet_id: u16) -> Option<Message> {
        self.awaiting_release.remove(&packet_id)
    }

    /// Scan inflight entries for due retransmissions.
    ///
    /// Entries older than `interval` are re-sent with the duplicate flag;
    /// entries past `max_retries` are dropped and returned as failed packet
    /// ids (a reported delivery failure, never a connection teardown).
    pub fn collect_retransmits(
        &mut self,
        now: Instant,
        interval: Duration,
        max_retries: u32,
    ) -> (Vec<Retransmit>, Vec<u16>) {
        let mut due = Vec::new();
        let mut expired = Vec::new();

        for entry in self.inflight.values_mut() {
            if now.duration_since(entry.sent_at) < interval {
                continue;
            }
            if entry.retry_count >= max_retries {
                expired.push(entry.packet_id);
                continue;
            }
            entry.sent_at = now;
            entry.retry_count += 1;
            match entry.qos2_state {
                Some(Qos2State::AwaitingComp) => due.push(Retransmit::Release(entry.packet_id)),
                _ => {
                    let mut message = entry.message.clone();
                    message.dup = true;
                    due.push(Retransmit::Publish(message));
                }
            }
        }

        for packet_id in &expired {
            self.inflight.remove(packet_id);
        }
        (due, expired)
    }

    /// Re-send every unacknowledged inflight entry, used on session resume.
    pub fn resend_all(&mut self, now: Instant) -> Vec<Retransmit> {
        let mut out = Vec::with_capacity(self.inflight.len());
        for entry in self.inflight.values_mut() {
            entry.sent_at = now;
            entry.retry_count += 1;
            match entry.qos2_state {
                Some(Qos2State::AwaitingComp) => out.push(Retransmit::Release(entry.packet_id)),
                _ => {
                    let mut message = entry.message.clone();
                    message.dup = true;
                    out.push(Retransmit::Publish(message));
                }
            }
        }
        out
    }

    pub fn queue_depth(&self) -> usize {
        self.queued.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

/// What a disconnect left behind for the engine to act on.
#[derive(Debug)]
pub struct DisconnectOutcome {
    /// Session state was destroyed (clean session)
    pub destroyed: bool,
    /// Will to publish (ungraceful disconnects only)
    pub will: Option<Will>,
}

/// Thread-safe session table keyed by client id.
///
/// Invariant: a client id maps to at most one live session; a second
/// CONNECT with the same id takes over the prior connection.
pub struct SessionTable {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    limits: SessionLimits,
}

/// Result of installing a connection for a client id.
pub struct ConnectOutcome {
    pub session: Arc<RwLock<Session>>,
    /// A prior non-clean session was reattached
    pub resumed: bool,
    /// A live connection held this client id and must be closed
    pub taken_over: Option<ConnectionId>,
    /// Will of the evicted connection, published on its behalf
    pub evicted_will: Option<Will>,
}

impl SessionTable {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
        }
    }

    /// Install a connection for `client_id`, creating or reattaching the
    /// session. Take-over of a live connection is reported, not treated as
    /// an error.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &self,
        client_id: &Arc<str>,
        connection_id: ConnectionId,
        clean_session: bool,
        keepalive: u16,
        username: Option<String>,
        will: Option<Will>,
    ) -> ConnectOutcome {
        let mut taken_over = None;
        let mut evicted_will = None;
        let mut resumed = false;

        let session = match self.sessions.get(client_id) {
            Some(existing) => {
                let reattach = {
                    let mut s = existing.write();
                    if let ConnectionState::Connected(old) = s.state {
                        taken_over = Some(old);
                        // The evicted link is an ungraceful loss; its will
                        // fires before the new one is installed
                        evicted_will = s.will.take();
                    }
                    !clean_session && !s.clean_session
                };
                if reattach {
                    resumed = true;
                    existing.clone()
                } else {
                    // Clean start (either side): discard prior state
                    drop(existing);
                    let fresh = Arc::new(RwLock::new(Session::new(client_id.clone(), self.limits)));
                    self.sessions.insert(client_id.clone(), fresh.clone());
                    fresh
                }
            }
            None => {
                let fresh = Arc::new(RwLock::new(Session::new(client_id.clone(), self.limits)));
                self.sessions.insert(client_id.clone(), fresh.clone());
                fresh
            }
        };

        {
            let mut s = session.write();
            s.state = ConnectionState::Connected(connection_id);
            s.clean_session = clean_session;
            s.keepalive = keepalive;
            s.username = username;
            s.will = will;
            s.touch();
        }

        ConnectOutcome {
            session,
            resumed,
            taken_over,
            evicted_will,
        }
    }

    /// Mark a session disconnected. Clean sessions are destroyed; persistent
    /// sessions are retained for reattachment. The will is returned for
    /// publishing only on ungraceful disconnects.
    pub fn disconnect(&self, client_id: &str, graceful: bool) -> Option<DisconnectOutcome> {
        let session = self.sessions.get(client_id)?.clone();
        let (destroyed, will) = {
            let mut s = session.write();
            s.state = ConnectionState::Disconnected;
            let will = s.will.take();
            (s.clean_session, if graceful { None } else { will })
        };
        if destroyed {
            self.sessions.remove(client_id);
        }
        Some(DisconnectOutcome { destroyed, will })
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Route one message toward a client's session.
    pub fn deliver_or_queue(&self, client_id: &str, message: Message) -> DeliveryOutcome {
        match self.get(client_id) {
            Some(session) => session.write().deliver_or_queue(message),
            None => {
                debug!(client_id, "delivery to unknown client dropped");
                DeliveryOutcome::Dropped
            }
        }
    }

    /// Connected sessions whose keepalive deadline has passed.
    ///
    /// The caller force-disconnects each returned client; this scan itself
    /// never blocks the write path for long.
    pub fn sweep_expired(&self, now: Instant) -> Vec<Arc<str>> {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            let s = entry.value().read();
            if s.is_connected() && s.is_keepalive_expired(now) {
                expired.push(s.client_id.clone());
            }
        }
        expired
    }

    /// Copy-on-read view of all sessions, for the retry tick and stats.
    pub fn all_sessions(&self) -> Vec<Arc<RwLock<Session>>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.value().read().is_connected())
            .count()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}
