//! Broker engine
//!
//! Orchestrates the topic tree, the session table, and the hook chain behind
//! the typed transport boundary: the transport registers a per-connection
//! outbound channel, feeds decoded [`Event`]s in, and receives [`Outbound`]
//! traffic (including explicit close instructions) back.
//!
//! Outbound hand-off uses `try_send` so the engine never blocks on a slow
//! consumer; a full per-connection channel drops the frame and counts it.

mod error;

pub use error::BrokerError;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::hooks::Hooks;
use crate::protocol::{CloseReason, ConnectionId, Event, Message, Outbound, QoS, Will};
use crate::session::{DeliveryOutcome, Retransmit, SessionLimits, SessionTable};
use crate::stats::{BrokerStats, StatsSnapshot};
use crate::topic::{validate_topic_name, TopicTree};

/// Engine tunables, derived from configuration.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub limits: SessionLimits,
    /// Highest QoS the broker grants on subscribe
    pub max_qos: QoS,
    /// Largest accepted publish payload in bytes
    pub max_payload_size: usize,
    /// Age after which an unacknowledged inflight entry is re-sent
    pub retry_interval: Duration,
    /// Re-sends before an inflight entry is abandoned
    pub max_retries: u32,
    /// Period of the keepalive sweep and retry scan
    pub maintenance_interval: Duration,
    /// Capacity of each per-connection outbound channel
    pub outbound_channel_size: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            limits: SessionLimits::default(),
            max_qos: QoS::ExactlyOnce,
            max_payload_size: 1024 * 1024,
            retry_interval: Duration::from_secs(20),
            max_retries: 5,
            maintenance_interval: Duration::from_secs(1),
            outbound_channel_size: 256,
        }
    }
}

/// Where a transport connection stands in its lifecycle.
#[derive(Debug, Clone)]
enum ConnPhase {
    /// Registered, no CONNECT seen yet
    Pending,
    /// CONNECT accepted for this client id
    Connected(Arc<str>),
}

struct ConnectionHandle {
    phase: ConnPhase,
    tx: mpsc::Sender<Outbound>,
}

/// The broker engine. One instance per process, shared across transport
/// tasks via `Arc`.
pub struct Broker {
    topics: TopicTree,
    sessions: SessionTable,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    hooks: Arc<dyn Hooks>,
    stats: BrokerStats,
    options: BrokerOptions,
    shutdown_tx: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(options: BrokerOptions, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            topics: TopicTree::new(),
            sessions: SessionTable::new(options.limits),
            connections: DashMap::new(),
            hooks,
            stats: BrokerStats::default(),
            options,
            shutdown_tx,
        }
    }

    /// Register a freshly accepted connection and hand back the receiver the
    /// transport drains to the socket.
    pub fn register_connection(&self, connection_id: ConnectionId) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(self.options.outbound_channel_size);
        self.connections.insert(
            connection_id,
            ConnectionHandle {
                phase: ConnPhase::Pending,
                tx,
            },
        );
        debug!(connection_id, "connection registered");
        rx
    }

    /// The transport's socket closed without a prior graceful disconnect.
    /// Idempotent: a connection already retired by takeover or DISCONNECT
    /// is a no-op.
    pub async fn connection_lost(&self, connection_id: ConnectionId) {
        let Some((_, handle)) = self.connections.remove(&connection_id) else {
            return;
        };
        if let ConnPhase::Connected(client_id) = handle.phase {
            // Only tear the session down if it is still bound to this
            // connection; a takeover already rebound it
            let still_ours = self
                .sessions
                .get(&client_id)
                .and_then(|s| s.read().connection_id())
                == Some(connection_id);
            if still_ours {
                self.finish_disconnect(&client_id, false).await;
            }
        }
    }

    /// Dispatch one decoded event from the transport.
    pub async fn handle_event(&self, connection_id: ConnectionId, event: Event) {
        let event = match event {
            Event::Connect {
                client_id,
                clean_session,
                keepalive,
                username,
                credential,
                will,
            } => {
                self.handle_connect(
                    connection_id,
                    client_id,
                    clean_session,
                    keepalive,
                    username,
                    credential,
                    will,
                )
                .await;
                return;
            }
            other => other,
        };

        // Every other event requires a completed CONNECT on this connection
        let client_id = match self.connections.get(&connection_id).map(|c| c.phase.clone()) {
            Some(ConnPhase::Connected(client_id)) => client_id,
            Some(ConnPhase::Pending) => {
                warn!(connection_id, "event before connect");
                self.close_connection(connection_id, CloseReason::ProtocolViolation);
                return;
            }
            None => return,
        };

        if let Some(session) = self.sessions.get(&client_id) {
            session.write().touch();
        }

        match event {
            Event::Connect { .. } => unreachable!("handled above"),
            Event::Subscribe { packet_id, filters } => {
                self.handle_subscribe(connection_id, &client_id, packet_id, filters)
                    .await;
            }
            Event::Unsubscribe { packet_id, filters } => {
                self.handle_unsubscribe(connection_id, &client_id, packet_id, filters);
            }
            Event::Publish(message) => {
                self.handle_publish(connection_id, &client_id, message).await;
            }
            Event::PubAck { packet_id } => self.handle_puback(connection_id, &client_id, packet_id),
            Event::PubRec { packet_id } => self.handle_pubrec(connection_id, &client_id, packet_id),
            Event::PubRel { packet_id } => self.handle_pubrel(connection_id, &client_id, packet_id),
            Event::PubComp { packet_id } => self.handle_pubcomp(connection_id, &client_id, packet_id),
            Event::PingReq => self.send_to(connection_id, Outbound::PingResp),
            Event::Disconnect => {
                self.connections.remove(&connection_id);
                self.finish_disconnect(&client_id, true).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_connect(
        &self,
        connection_id: ConnectionId,
        client_id: Arc<str>,
        clean_session: bool,
        keepalive: u16,
        username: Option<String>,
        credential: Option<Bytes>,
        will: Option<Will>,
    ) {
        let phase = match self.connections.get(&connection_id) {
            Some(handle) => handle.phase.clone(),
            None => return,
        };
        if let ConnPhase::Connected(_) = phase {
            // A second CONNECT on a live connection is a protocol error
            warn!(connection_id, "duplicate connect");
            self.close_connection(connection_id, CloseReason::ProtocolViolation);
            self.connection_lost(connection_id).await;
            return;
        }
        if client_id.is_empty() {
            self.close_connection(connection_id, CloseReason::ProtocolViolation);
            return;
        }

        let allowed = self
            .hooks
            .on_authenticate(&client_id, username.as_deref(), credential.as_deref())
            .await
            .unwrap_or(false);
        if !allowed {
            info!(client_id = %client_id, "connect denied");
            self.close_connection(connection_id, CloseReason::AuthDenied);
            return;
        }

        let outcome = self.sessions.connect(
            &client_id,
            connection_id,
            clean_session,
            keepalive,
            username.clone(),
            will,
        );

        if let Some(old_connection) = outcome.taken_over {
            info!(client_id = %client_id, old_connection, "session taken over");
            self.send_to(old_connection, Outbound::Close(CloseReason::SessionTakenOver));
            self.connections.remove(&old_connection);
            if !outcome.resumed {
                // Clean restart under the same id: the old subscriptions die
                self.topics.unsubscribe_all(&client_id);
            }
            if let Some(evicted_will) = outcome.evicted_will {
                self.route_message(evicted_will.into_message(&client_id));
            }
        } else if !outcome.resumed {
            // A fresh session must not inherit tree entries from an earlier
            // incarnation of this client id
            self.topics.unsubscribe_all(&client_id);
        }

        if let Some(mut handle) = self.connections.get_mut(&connection_id) {
            handle.phase = ConnPhase::Connected(client_id.clone());
        }

        BrokerStats::incr(&self.stats.connects);
        self.send_to(
            connection_id,
            Outbound::ConnAck {
                session_present: outcome.resumed,
            },
        );
        info!(client_id = %client_id, connection_id, resumed = outcome.resumed, "client connected");

        if outcome.resumed {
            // Unfinished handshakes first (dup set), then the offline queue
            let (retransmits, ready) = {
                let mut s = outcome.session.write();
                let retransmits = s.resend_all(Instant::now());
                let ready = s.drain_ready();
                (retransmits, ready)
            };
            for r in retransmits {
                self.send_retransmit(connection_id, r);
            }
            for message in ready {
                self.send_deliver(connection_id, message);
            }
        }

        self.hooks
            .on_client_connected(&client_id, username.as_deref())
            .await;
    }

    async fn handle_subscribe(
        &self,
        connection_id: ConnectionId,
        client_id: &Arc<str>,
        packet_id: u16,
        filters: Vec<(String, QoS)>,
    ) {
        if filters.is_empty() {
            self.close_connection(connection_id, CloseReason::ProtocolViolation);
            self.connection_lost(connection_id).await;
            return;
        }

        let username = self
            .sessions
            .get(client_id)
            .and_then(|s| s.read().username.clone());

        let mut granted: Vec<Option<QoS>> = Vec::with_capacity(filters.len());
        let mut accepted: Vec<(String, QoS)> = Vec::new();
        for (filter, requested) in filters {
            let allowed = self
                .hooks
                .on_subscribe_check(client_id, username.as_deref(), &filter, requested)
                .await
                .unwrap_or(false);
            if !allowed {
                granted.push(None);
                continue;
            }
            match self
                .topics
                .subscribe(client_id, &filter, requested, self.options.max_qos)
            {
                Ok(level) => {
                    granted.push(Some(level));
                    accepted.push((filter, level));
                }
                Err(err) => {
                    debug!(client_id = %client_id, filter = %filter, %err, "subscription rejected");
                    granted.push(None);
                }
            }
        }

        if let Some(session) = self.sessions.get(client_id) {
            let mut s = session.write();
            for (filter, level) in &accepted {
                s.subscriptions.insert(filter.clone(), *level);
            }
        }

        // Acknowledgment precedes the retained snapshot
        self.send_to(connection_id, Outbound::SubAck { packet_id, granted });

        for (filter, level) in accepted {
            for retained in self.topics.retained_snapshot(&filter) {
                self.dispatch_to_client(client_id, retained.as_retained(level));
            }
        }
    }

    fn handle_unsubscribe(
        &self,
        connection_id: ConnectionId,
        client_id: &Arc<str>,
        packet_id: u16,
        filters: Vec<String>,
    ) {
        for filter in &filters {
            self.topics.unsubscribe(client_id, filter);
        }
        if let Some(session) = self.sessions.get(client_id) {
            let mut s = session.write();
            for filter in &filters {
                s.subscriptions.remove(filter);
            }
        }
        self.send_to(connection_id, Outbound::UnsubAck { packet_id });
    }

    async fn handle_publish(&self, connection_id: ConnectionId, client_id: &Arc<str>, message: Message) {
        let violation = validate_topic_name(&message.topic).err().or_else(|| {
            if message.payload.len() > self.options.max_payload_size {
                Some(BrokerError::PayloadTooLarge)
            } else if message.qos != QoS::AtMostOnce && message.packet_id.is_none() {
                Some(BrokerError::ProtocolViolation("publish missing packet id"))
            } else {
                None
            }
        });
        if let Some(err) = violation {
            warn!(client_id = %client_id, topic = %message.topic, %err, "publish rejected");
            if matches!(err, BrokerError::ProtocolViolation(_)) {
                self.close_connection(connection_id, CloseReason::ProtocolViolation);
                self.connection_lost(connection_id).await;
                return;
            }
            // A malformed topic or oversized payload rejects this publish
            // only; the acknowledgment still completes so the sender's
            // window drains, and the connection stays up
            BrokerStats::incr(&self.stats.messages_dropped);
            match (message.qos, message.packet_id) {
                (QoS::AtLeastOnce, Some(packet_id)) => {
                    self.send_to(connection_id, Outbound::PubAck { packet_id });
                }
                (QoS::ExactlyOnce, Some(packet_id)) => {
                    self.send_to(connection_id, Outbound::PubRec { packet_id });
                }
                _ => {}
            }
            return;
        }

        let username = self
            .sessions
            .get(client_id)
            .and_then(|s| s.read().username.clone());
        let allowed = self
            .hooks
            .on_publish_check(
                client_id,
                username.as_deref(),
                &message.topic,
                message.qos,
                message.retain,
            )
            .await
            .unwrap_or(false);

        BrokerStats::incr(&self.stats.messages_received);

        match message.qos {
            QoS::AtMostOnce => {
                if allowed {
                    self.route_message(message);
                }
            }
            QoS::AtLeastOnce => {
                let packet_id = message.packet_id.unwrap_or_default();
                if allowed {
                    self.route_message(message);
                }
                self.send_to(connection_id, Outbound::PubAck { packet_id });
            }
            QoS::ExactlyOnce => {
                let packet_id = message.packet_id.unwrap_or_default();
                // A denied publish still completes the handshake; nothing is
                // stored, so the release routes nothing
                let Some(session) = self.sessions.get(client_id) else {
                    BrokerStats::incr(&self.stats.messages_dropped);
                    return;
                };
                let stored = if allowed {
                    session.write().on_publish_received(packet_id, message)
                } else {
                    Ok(())
                };
                match stored {
                    Ok(()) => self.send_to(connection_id, Outbound::PubRec { packet_id }),
                    Err(err) => {
                        // Inbound window full: withhold the PubRec and let
                        // the client retransmit once releases free a slot
                        debug!(client_id = %client_id, packet_id, %err, "qos2 receive deferred");
                        BrokerStats::incr(&self.stats.messages_dropped);
                    }
                }
            }
        }
    }

    fn handle_puback(&self, _connection_id: ConnectionId, client_id: &Arc<str>, packet_id: u16) {
        let Some(session) = self.sessions.get(client_id) else {
            return;
        };
        let (acked, ready) = {
            let mut s = session.write();
            let acked = s.acknowledge(packet_id);
            (acked, if acked { s.drain_ready() } else { Vec::new() })
        };
        if !acked {
            BrokerStats::incr(&self.stats.acks_ignored);
            debug!(client_id = %client_id, packet_id, "puback for unknown id ignored");
        }
        self.dispatch_ready(client_id, ready);
    }

    fn handle_pubrec(&self, connection_id: ConnectionId, client_id: &Arc<str>, packet_id: u16) {
        let Some(session) = self.sessions.get(client_id) else {
            return;
        };
        let advanced = session.write().on_rec(packet_id);
        if advanced {
            self.send_to(connection_id, Outbound::PubRel { packet_id });
        } else {
            BrokerStats::incr(&self.stats.acks_ignored);
        }
    }

    fn handle_pubrel(&self, connection_id: ConnectionId, client_id: &Arc<str>, packet_id: u16) {
        let released = self
            .sessions
            .get(client_id)
            .and_then(|session| session.write().on_release(packet_id));
        // PUBCOMP answers even a duplicate release; only a first release routes
        self.send_to(connection_id, Outbound::PubComp { packet_id });
        if let Some(message) = released {
            self.route_message(message);
        }
    }

    fn handle_pubcomp(&self, _connection_id: ConnectionId, client_id: &Arc<str>, packet_id: u16) {
        let Some(session) = self.sessions.get(client_id) else {
            return;
        };
        let (done, ready) = {
            let mut s = session.write();
            let done = s.on_comp(packet_id);
            (done, if done { s.drain_ready() } else { Vec::new() })
        };
        if !done {
            BrokerStats::incr(&self.stats.acks_ignored);
        }
        self.dispatch_ready(client_id, ready);
    }

    /// Fan a message out to every matching subscriber, storing or clearing
    /// retained state first.
    fn route_message(&self, message: Message) {
        if message.retain {
            if message.payload.is_empty() {
                self.topics.set_retained(&message.topic, None);
            } else {
                self.topics
                    .set_retained(&message.topic, Some(message.clone()));
            }
        }

        for (subscriber, granted) in self.topics.matches(&message.topic) {
            self.dispatch_to_client(&subscriber, message.for_subscriber(granted));
        }

        // Notify off the publish path; a slow observer must not delay
        // the publisher's acknowledgment
        let hooks = Arc::clone(&self.hooks);
        tokio::spawn(async move {
            hooks.on_message_published(&message).await;
        });
    }

    /// Hand one outbound message to a client's session and, if it came back
    /// deliverable now, to its connection.
    fn dispatch_to_client(&self, client_id: &Arc<str>, message: Message) {
        let Some(session) = self.sessions.get(client_id) else {
            BrokerStats::incr(&self.stats.messages_dropped);
            return;
        };
        let (outcome, connection) = {
            let mut s = session.write();
            (s.deliver_or_queue(message), s.connection_id())
        };
        match outcome {
            DeliveryOutcome::Delivered(ready) => {
                if let Some(connection_id) = connection {
                    self.send_deliver(connection_id, ready);
                }
            }
            DeliveryOutcome::Queued { dropped_oldest } => {
                if dropped_oldest {
                    BrokerStats::incr(&self.stats.messages_dropped);
                    debug!(client_id = %client_id, "queue overflow, oldest dropped");
                }
            }
            DeliveryOutcome::Dropped => {
                BrokerStats::incr(&self.stats.messages_dropped);
            }
        }
    }

    fn dispatch_ready(&self, client_id: &Arc<str>, ready: Vec<Message>) {
        if ready.is_empty() {
            return;
        }
        let Some(connection_id) = self
            .sessions
            .get(client_id)
            .and_then(|s| s.read().connection_id())
        else {
            return;
        };
        for message in ready {
            self.send_deliver(connection_id, message);
        }
    }

    /// Mark the session disconnected, publish the will if the disconnect was
    /// ungraceful, and drop tree state for destroyed sessions.
    async fn finish_disconnect(&self, client_id: &Arc<str>, graceful: bool) {
        let Some(outcome) = self.sessions.disconnect(client_id, graceful) else {
            return;
        };
        if outcome.destroyed {
            self.topics.unsubscribe_all(client_id);
        }
        info!(client_id = %client_id, graceful, destroyed = outcome.destroyed, "client disconnected");
        if let Some(will) = outcome.will {
            self.route_message(will.into_message(client_id));
        }
        self.hooks.on_client_disconnected(client_id, graceful).await;
    }

    /// Periodic maintenance: keepalive sweep and retransmission scan. Runs
    /// until shutdown.
    pub async fn run_maintenance(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(self.options.maintenance_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = tick.tick() => {
                    self.sweep_keepalive().await;
                    self.retry_inflight();
                }
            }
        }
        debug!("maintenance loop stopped");
    }

    async fn sweep_keepalive(&self) {
        let now = Instant::now();
        for client_id in self.sessions.sweep_expired(now) {
            let connection = self
                .sessions
                .get(&client_id)
                .and_then(|s| s.read().connection_id());
            warn!(client_id = %client_id, "keepalive expired");
            BrokerStats::incr(&self.stats.keepalive_expirations);
            if let Some(connection_id) = connection {
                self.send_to(connection_id, Outbound::Close(CloseReason::KeepAliveTimeout));
                self.connections.remove(&connection_id);
            }
            self.finish_disconnect(&client_id, false).await;
        }
    }

    fn retry_inflight(&self) {
        let now = Instant::now();
        for session in self.sessions.all_sessions() {
            let (client_id, connection, due, expired, ready) = {
                let mut s = session.write();
                if !s.is_connected() {
                    continue;
                }
                let (due, expired) =
                    s.collect_retransmits(now, self.options.retry_interval, self.options.max_retries);
                let ready = if expired.is_empty() { Vec::new() } else { s.drain_ready() };
                (s.client_id.clone(), s.connection_id(), due, expired, ready)
            };
            let Some(connection_id) = connection else { continue };

            if !expired.is_empty() {
                BrokerStats::add(&self.stats.deliveries_failed, expired.len() as u64);
                warn!(client_id = %client_id, count = expired.len(), "inflight deliveries abandoned");
            }
            for r in due {
                BrokerStats::incr(&self.stats.retransmits);
                self.send_retransmit(connection_id, r);
            }
            for message in ready {
                self.send_deliver(connection_id, message);
            }
        }
    }

    /// Signal shutdown: stop maintenance and instruct every live connection
    /// to close.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        for entry in self.connections.iter() {
            let _ = entry.value().tx.try_send(Outbound::Close(CloseReason::Shutdown));
        }
        info!("broker shutting down");
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.sessions, &self.topics)
    }

    pub fn topics(&self) -> &TopicTree {
        &self.topics
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    fn send_retransmit(&self, connection_id: ConnectionId, retransmit: Retransmit) {
        match retransmit {
            Retransmit::Publish(message) => self.send_deliver(connection_id, message),
            Retransmit::Release(packet_id) => {
                self.send_to(connection_id, Outbound::PubRel { packet_id });
            }
        }
    }

    fn send_deliver(&self, connection_id: ConnectionId, message: Message) {
        BrokerStats::incr(&self.stats.messages_sent);
        self.send_to(connection_id, Outbound::Deliver(message));
    }

    fn close_connection(&self, connection_id: ConnectionId, reason: CloseReason) {
        self.send_to(connection_id, Outbound::Close(reason));
    }

    fn send_to(&self, connection_id: ConnectionId, outbound: Outbound) {
        let Some(handle) = self.connections.get(&connection_id) else {
            return;
        };
        if let Err(err) = handle.tx.try_send(outbound) {
            BrokerStats::incr(&self.stats.messages_dropped);
            warn!(connection_id, %err, "outbound channel full, frame dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::DefaultHooks;

    fn broker() -> Arc<Broker> {
        Arc::new(Broker::new(BrokerOptions::default(), Arc::new(DefaultHooks)))
    }

    async fn connect(broker: &Broker, conn: ConnectionId, client: &str) -> mpsc::Receiver<Outbound> {
        let mut rx = broker.register_connection(conn);
        broker
            .handle_event(
                conn,
                Event::Connect {
                    client_id: client.into(),
                    clean_session: true,
                    keepalive: 60,
                    username: None,
                    credential: None,
                    will: None,
                },
            )
            .await;
        assert_eq!(
            rx.recv().await,
            Some(Outbound::ConnAck {
                session_present: false
            })
        );
        rx
    }

    #[tokio::test]
    async fn test_event_before_connect_closes() {
        let broker = broker();
        let mut rx = broker.register_connection(1);
        broker.handle_event(1, Event::PingReq).await;
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close(CloseReason::ProtocolViolation))
        );
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let broker = broker();
        let mut rx = connect(&broker, 1, "c1").await;
        broker.handle_event(1, Event::PingReq).await;
        assert_eq!(rx.recv().await, Some(Outbound::PingResp));
    }

    #[tokio::test]
    async fn test_qos0_publish_reaches_subscriber() {
        let broker = broker();
        let mut sub_rx = connect(&broker, 1, "sub").await;
        let _pub_rx = connect(&broker, 2, "pub").await;

        broker
            .handle_event(
                1,
                Event::Subscribe {
                    packet_id: 1,
                    filters: vec![("sensors/+".into(), QoS::AtMostOnce)],
                },
            )
            .await;
        assert_eq!(
            sub_rx.recv().await,
            Some(Outbound::SubAck {
                packet_id: 1,
                granted: vec![Some(QoS::AtMostOnce)]
            })
        );

        let msg = Message::new("sensors/temp", Bytes::from_static(b"21"), QoS::AtMostOnce, "pub");
        broker.handle_event(2, Event::Publish(msg)).await;

        match sub_rx.recv().await {
            Some(Outbound::Deliver(m)) => {
                assert_eq!(m.topic.as_ref(), "sensors/temp");
                assert_eq!(m.qos, QoS::AtMostOnce);
                assert_eq!(m.packet_id, None);
            }
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_qos1_publish_acked_and_delivered() {
        let broker = broker();
        let mut sub_rx = connect(&broker, 1, "sub").await;
        let mut pub_rx = connect(&broker, 2, "pub").await;

        broker
            .handle_event(
                1,
                Event::Subscribe {
                    packet_id: 1,
                    filters: vec![("a/b".into(), QoS::AtLeastOnce)],
                },
            )
            .await;
        let _suback = sub_rx.recv().await;

        let msg = Message::new("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce, "pub")
            .with_packet_id(42);
        broker.handle_event(2, Event::Publish(msg)).await;

        assert_eq!(pub_rx.recv().await, Some(Outbound::PubAck { packet_id: 42 }));
        match sub_rx.recv().await {
            Some(Outbound::Deliver(m)) => {
                assert_eq!(m.qos, QoS::AtLeastOnce);
                let pid = m.packet_id.expect("fresh packet id");
                assert_ne!(pid, 0);
                // Subscriber acks; a repeat of the same ack is ignored
                broker.handle_event(1, Event::PubAck { packet_id: pid }).await;
                broker.handle_event(1, Event::PubAck { packet_id: pid }).await;
                assert_eq!(broker.stats_snapshot().acks_ignored, 1);
            }
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_qos2_inbound_handshake_routes_once() {
        let broker = broker();
        let mut sub_rx = connect(&broker, 1, "sub").await;
        let mut pub_rx = connect(&broker, 2, "pub").await;

        broker
            .handle_event(
                1,
                Event::Subscribe {
                    packet_id: 1,
                    filters: vec![("a".into(), QoS::AtMostOnce)],
                },
            )
            .await;
        let _suback = sub_rx.recv().await;

        let msg = Message::new("a", Bytes::from_static(b"x"), QoS::ExactlyOnce, "pub")
            .with_packet_id(7);
        broker.handle_event(2, Event::Publish(msg.clone())).await;
        assert_eq!(pub_rx.recv().await, Some(Outbound::PubRec { packet_id: 7 }));

        // Retransmitted publish before the release must not double-store
        broker.handle_event(2, Event::Publish(msg)).await;
        assert_eq!(pub_rx.recv().await, Some(Outbound::PubRec { packet_id: 7 }));

        broker.handle_event(2, Event::PubRel { packet_id: 7 }).await;
        assert_eq!(pub_rx.recv().await, Some(Outbound::PubComp { packet_id: 7 }));
        assert!(matches!(sub_rx.recv().await, Some(Outbound::Deliver(_))));

        // Duplicate release completes again but routes nothing further
        broker.handle_event(2, Event::PubRel { packet_id: 7 }).await;
        assert_eq!(pub_rx.recv().await, Some(Outbound::PubComp { packet_id: 7 }));
        assert!(sub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retained_message_delivered_on_subscribe() {
        let broker = broker();
        let _pub_rx = connect(&broker, 2, "pub").await;
        let msg = Message::new("state/arm", Bytes::from_static(b"up"), QoS::AtMostOnce, "pub")
            .with_retain(true);
        broker.handle_event(2, Event::Publish(msg)).await;

        let mut sub_rx = connect(&broker, 1, "sub").await;
        broker
            .handle_event(
                1,
                Event::Subscribe {
                    packet_id: 3,
                    filters: vec![("state/+".into(), QoS::AtMostOnce)],
                },
            )
            .await;

        // SubAck first, then the retained snapshot with retain=true
        assert!(matches!(sub_rx.recv().await, Some(Outbound::SubAck { .. })));
        match sub_rx.recv().await {
            Some(Outbound::Deliver(m)) => {
                assert!(m.retain);
                assert_eq!(m.payload.as_ref(), b"up");
            }
            other => panic!("expected retained delivery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_retained_payload_clears() {
        let broker = broker();
        let _pub_rx = connect(&broker, 2, "pub").await;
        let set = Message::new("s", Bytes::from_static(b"v"), QoS::AtMostOnce, "pub").with_retain(true);
        broker.handle_event(2, Event::Publish(set)).await;
        let clear = Message::new("s", Bytes::new(), QoS::AtMostOnce, "pub").with_retain(true);
        broker.handle_event(2, Event::Publish(clear)).await;

        assert_eq!(broker.topics().retained_count(), 0);
    }

    #[tokio::test]
    async fn test_session_takeover_closes_old_connection() {
        let broker = broker();
        let mut first_rx = broker.register_connection(1);
        let mut second_rx = broker.register_connection(2);

        let connect_event = |conn_will: Option<Will>| Event::Connect {
            client_id: "dup".into(),
            clean_session: false,
            keepalive: 60,
            username: None,
            credential: None,
            will: conn_will,
        };

        broker.handle_event(1, connect_event(None)).await;
        assert!(matches!(first_rx.recv().await, Some(Outbound::ConnAck { .. })));

        broker.handle_event(2, connect_event(None)).await;
        assert_eq!(
            first_rx.recv().await,
            Some(Outbound::Close(CloseReason::SessionTakenOver))
        );
        assert_eq!(
            second_rx.recv().await,
            Some(Outbound::ConnAck {
                session_present: true
            })
        );

        // The dead transport reporting its loss must not tear down the
        // rebound session
        broker.connection_lost(1).await;
        assert_eq!(broker.sessions().connected_count(), 1);
    }

    #[tokio::test]
    async fn test_will_published_on_ungraceful_loss_only() {
        let broker = broker();
        let mut sub_rx = connect(&broker, 1, "sub").await;
        broker
            .handle_event(
                1,
                Event::Subscribe {
                    packet_id: 1,
                    filters: vec![("status/#".into(), QoS::AtMostOnce)],
                },
            )
            .await;
        let _suback = sub_rx.recv().await;

        let will = Will {
            topic: "status/pub".into(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtMostOnce,
            retain: false,
        };

        // Graceful disconnect: no will
        let mut rx_a = broker.register_connection(2);
        broker
            .handle_event(
                2,
                Event::Connect {
                    client_id: "pub".into(),
                    clean_session: true,
                    keepalive: 60,
                    username: None,
                    credential: None,
                    will: Some(will.clone()),
                },
            )
            .await;
        let _connack = rx_a.recv().await;
        broker.handle_event(2, Event::Disconnect).await;
        assert!(sub_rx.try_recv().is_err());

        // Ungraceful loss: will fires
        let mut rx_b = broker.register_connection(3);
        broker
            .handle_event(
                3,
                Event::Connect {
                    client_id: "pub".into(),
                    clean_session: true,
                    keepalive: 60,
                    username: None,
                    credential: None,
                    will: Some(will),
                },
            )
            .await;
        let _connack = rx_b.recv().await;
        broker.connection_lost(3).await;

        match sub_rx.recv().await {
            Some(Outbound::Deliver(m)) => assert_eq!(m.payload.as_ref(), b"offline"),
            other => panic!("expected will delivery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_with_wildcard_topic_rejected_without_close() {
        let broker = broker();
        let mut rx = connect(&broker, 1, "c1").await;
        let msg = Message::new("a/+/b", Bytes::from_static(b"x"), QoS::AtMostOnce, "c1");
        broker.handle_event(1, Event::Publish(msg)).await;
        assert_eq!(broker.stats_snapshot().messages_dropped, 1);

        // Only the offending publish is dropped; the connection stays up
        broker.handle_event(1, Event::PingReq).await;
        assert_eq!(rx.recv().await, Some(Outbound::PingResp));
    }

    #[tokio::test]
    async fn test_rejected_qos1_publish_still_acked() {
        let broker = broker();
        let mut rx = connect(&broker, 1, "c1").await;
        let msg = Message::new("a/#", Bytes::from_static(b"x"), QoS::AtLeastOnce, "c1")
            .with_packet_id(3);
        broker.handle_event(1, Event::Publish(msg)).await;

        // Nothing is routed, but the ack completes so the sender's
        // window drains
        assert_eq!(rx.recv().await, Some(Outbound::PubAck { packet_id: 3 }));
        assert_eq!(broker.topics().retained_count(), 0);

        broker.handle_event(1, Event::PingReq).await;
        assert_eq!(rx.recv().await, Some(Outbound::PingResp));
    }

    #[tokio::test]
    async fn test_qos2_window_overflow_defers_without_close() {
        let options = BrokerOptions {
            limits: SessionLimits {
                max_awaiting_rel: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let broker = Arc::new(Broker::new(options, Arc::new(DefaultHooks)));
        let mut rx = connect(&broker, 1, "c1").await;

        let first = Message::new("a", Bytes::from_static(b"1"), QoS::ExactlyOnce, "c1")
            .with_packet_id(1);
        broker.handle_event(1, Event::Publish(first)).await;
        assert_eq!(rx.recv().await, Some(Outbound::PubRec { packet_id: 1 }));

        // Window full: the second publish gets no PubRec, and the
        // connection survives
        let second = Message::new("a", Bytes::from_static(b"2"), QoS::ExactlyOnce, "c1")
            .with_packet_id(2);
        broker.handle_event(1, Event::Publish(second.clone())).await;
        broker.handle_event(1, Event::PingReq).await;
        assert_eq!(rx.recv().await, Some(Outbound::PingResp));
        assert_eq!(broker.stats_snapshot().messages_dropped, 1);

        // Releasing the first frees a slot; the retransmission succeeds
        broker.handle_event(1, Event::PubRel { packet_id: 1 }).await;
        assert_eq!(rx.recv().await, Some(Outbound::PubComp { packet_id: 1 }));
        broker.handle_event(1, Event::Publish(second)).await;
        assert_eq!(rx.recv().await, Some(Outbound::PubRec { packet_id: 2 }));
    }

    #[tokio::test]
    async fn test_subscribe_grant_capped_by_broker_max() {
        let options = BrokerOptions {
            max_qos: QoS::AtLeastOnce,
            ..Default::default()
        };
        let broker = Arc::new(Broker::new(options, Arc::new(DefaultHooks)));
        let mut rx = connect(&broker, 1, "c1").await;
        broker
            .handle_event(
                1,
                Event::Subscribe {
                    packet_id: 9,
                    filters: vec![("a".into(), QoS::ExactlyOnce), ("bad/#/x".into(), QoS::AtMostOnce)],
                },
            )
            .await;
        assert_eq!(
            rx.recv().await,
            Some(Outbound::SubAck {
                packet_id: 9,
                granted: vec![Some(QoS::AtLeastOnce), None]
            })
        );
    }
}
