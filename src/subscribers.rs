//! Fan-out of membership and state-change events to local subsystems.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::GossipError;
use crate::state::{ApplicationState, EndpointState, VersionedValue};

/// Callbacks a local subsystem may register for membership events.
///
/// Every method defaults to a no-op so subscribers implement only what they
/// care about. Notifications run sequentially in registration order, always
/// after the triggering state has been replicated to every shard; failures are
/// logged and swallowed.
#[async_trait]
pub trait EndpointStateSubscriber: Send + Sync {
    /// A peer joined the cluster (first observation or generation restart).
    async fn on_join(&self, _endpoint: SocketAddr, _state: EndpointState) -> Result<(), GossipError> {
        Ok(())
    }

    /// An application-state key is about to change; `current` is the state
    /// before the change is applied.
    async fn before_change(
        &self,
        _endpoint: SocketAddr,
        _current: EndpointState,
        _key: ApplicationState,
        _new_value: VersionedValue,
    ) -> Result<(), GossipError> {
        Ok(())
    }

    /// An application-state key changed.
    async fn on_change(
        &self,
        _endpoint: SocketAddr,
        _key: ApplicationState,
        _value: VersionedValue,
    ) -> Result<(), GossipError> {
        Ok(())
    }

    /// A peer was marked alive.
    async fn on_alive(&self, _endpoint: SocketAddr, _state: EndpointState) -> Result<(), GossipError> {
        Ok(())
    }

    /// A peer was marked dead.
    async fn on_dead(&self, _endpoint: SocketAddr, _state: EndpointState) -> Result<(), GossipError> {
        Ok(())
    }

    /// A peer was removed from membership.
    async fn on_remove(&self, _endpoint: SocketAddr) -> Result<(), GossipError> {
        Ok(())
    }

    /// A peer restarted with a new generation; `old_state` is the state that
    /// was current before the restart was applied.
    async fn on_restart(
        &self,
        _endpoint: SocketAddr,
        _old_state: EndpointState,
    ) -> Result<(), GossipError> {
        Ok(())
    }
}

/// Append-only, ordered list of subscribers.
#[derive(Default)]
pub struct SubscriberList {
    subscribers: RwLock<Vec<Arc<dyn EndpointStateSubscriber>>>,
}

impl SubscriberList {
    /// Empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a subscriber; it will observe all subsequent events.
    pub fn add(&self, subscriber: Arc<dyn EndpointStateSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Removes a previously registered subscriber.
    pub fn remove(&self, subscriber: &Arc<dyn EndpointStateSubscriber>) {
        self.subscribers
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, subscriber));
    }

    fn snapshot(&self) -> Vec<Arc<dyn EndpointStateSubscriber>> {
        self.subscribers.read().clone()
    }

    pub(crate) async fn notify_join(&self, endpoint: SocketAddr, state: &EndpointState) {
        for subscriber in self.snapshot() {
            if let Err(err) = subscriber.on_join(endpoint, state.clone()).await {
                warn!(event = "on_join", %endpoint, "subscriber failed: {err}");
            }
        }
    }

    pub(crate) async fn notify_before_change(
        &self,
        endpoint: SocketAddr,
        current: &EndpointState,
        key: ApplicationState,
        new_value: &VersionedValue,
    ) {
        for subscriber in self.snapshot() {
            if let Err(err) = subscriber
                .before_change(endpoint, current.clone(), key, new_value.clone())
                .await
            {
                warn!(event = "before_change", %endpoint, "subscriber failed: {err}");
            }
        }
    }

    pub(crate) async fn notify_change(
        &self,
        endpoint: SocketAddr,
        key: ApplicationState,
        value: &VersionedValue,
    ) {
        for subscriber in self.snapshot() {
            if let Err(err) = subscriber.on_change(endpoint, key, value.clone()).await {
                warn!(event = "on_change", %endpoint, "subscriber failed: {err}");
            }
        }
    }

    pub(crate) async fn notify_alive(&self, endpoint: SocketAddr, state: &EndpointState) {
        for subscriber in self.snapshot() {
            if let Err(err) = subscriber.on_alive(endpoint, state.clone()).await {
                warn!(event = "on_alive", %endpoint, "subscriber failed: {err}");
            }
        }
    }

    pub(crate) async fn notify_dead(&self, endpoint: SocketAddr, state: &EndpointState) {
        for subscriber in self.snapshot() {
            if let Err(err) = subscriber.on_dead(endpoint, state.clone()).await {
                warn!(event = "on_dead", %endpoint, "subscriber failed: {err}");
            }
        }
    }

    pub(crate) async fn notify_remove(&self, endpoint: SocketAddr) {
        for subscriber in self.snapshot() {
            if let Err(err) = subscriber.on_remove(endpoint).await {
                warn!(event = "on_remove", %endpoint, "subscriber failed: {err}");
            }
        }
    }

    pub(crate) async fn notify_restart(&self, endpoint: SocketAddr, old_state: &EndpointState) {
        for subscriber in self.snapshot() {
            if let Err(err) = subscriber.on_restart(endpoint, old_state.clone()).await {
                warn!(event = "on_restart", %endpoint, "subscriber failed: {err}");
            }
        }
    }
}
