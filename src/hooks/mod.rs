//! Extensibility hooks
//!
//! Authentication, authorization, and lifecycle notification points for
//! embedders. Every method has an allow-all / no-op default, so an
//! implementation only overrides what it cares about.

use std::fmt;

use async_trait::async_trait;

use crate::protocol::{Message, QoS};


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Authentication failed
    AuthenticationFailed,
    /// Authorization denied
    AuthorizationDenied,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthenticationFailed => write!(f, "Authentication failed"),
            HookError::AuthorizationDenied => write!(f, "Authorization denied"),
        }
    }
}

impl std::error::Error for HookError {}

pub type HookResult<T> = Result<T, HookError>;

/// Broker extension trait.
///
/// Decision hooks (`on_authenticate`, `on_publish_check`,
/// `on_subscribe_check`) gate the operation; notification hooks run after
/// the fact and cannot affect routing.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Gate a CONNECT. `credential` is the opaque secret from the connect
    /// event, never interpreted by the core.
    ///
    /// `Ok(false)` rejects the connect; the connection is closed with an
    /// authentication failure.
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _credential: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Gate a PUBLISH. `Ok(false)` silently drops the message (the
    /// publisher still gets its acknowledgment, mirroring broker-side ACL
    /// behavior).
    async fn on_publish_check(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _qos: QoS,
        _retain: bool,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Gate one SUBSCRIBE filter. `Ok(false)` rejects that filter in the
    /// acknowledgment while the rest of the batch proceeds.
    async fn on_subscribe_check(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _filter: &str,
        _qos: QoS,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called after a connect completes and the acknowledgment is queued.
    async fn on_client_connected(&self, _client_id: &str, _username: Option<&str>) {}

    /// Called after a client disconnects, with whether it was graceful.
    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {}

    /// Called after a message has been routed to its subscribers.
    async fn on_message_published(&self, _message: &Message) {}
}

/// Default hooks implementation that allows everything
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

impl Default for DefaultHooks {
    fn default() -> Self {
        Self
    }
}

/// Allows Arc-wrapped hook providers to be used directly.
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        credential: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self)
            .on_authenticate(client_id, username, credential)
            .await
    }

    async fn on_publish_check(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> HookResult<bool> {
        (**self)
            .on_publish_check(client_id, username, topic, qos, retain)
            .await
    }

    async fn on_subscribe_check(
        &self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
        qos: QoS,
    ) -> HookResult<bool> {
        (**self)
            .on_subscribe_check(client_id, username, filter, qos)
            .await
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        (**self).on_client_connected(client_id, username).await;
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_client_disconnected(client_id, graceful).await;
    }

    async fn on_message_published(&self, message: &Message) {
        (**self).on_message_published(message).await;
    }
}

/// Chains multiple hook implementations.
///
/// Decision hooks short-circuit on the first denial; notification hooks are
/// called on every member in registration order.
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        credential: Option<&[u8]>,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_authenticate(client_id, username, credential).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_publish_check(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        qos: QoS,
        retain: bool,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks
                .on_publish_check(client_id, username, topic, qos, retain)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_subscribe_check(
        &self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
        qos: QoS,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks
                .on_subscribe_check(client_id, username, filter, qos)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        for hooks in &self.hooks {
            hooks.on_client_connected(client_id, username).await;
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client_id, graceful).await;
        }
    }

    async fn on_message_published(&self, message: &Message) {
        for hooks in &self.hooks {
            hooks.on_message_published(message).await;
        }
    }
}
