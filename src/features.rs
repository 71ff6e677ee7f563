//! Cluster feature negotiation driven by gossiped SUPPORTED_FEATURES.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Weak;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::error::GossipError;
use crate::gossiper::Gossiper;
use crate::state::{ApplicationState, EndpointState, VersionedValue};
use crate::subscribers::EndpointStateSubscriber;

/// Tracks which cluster features the local node supports and which have been
/// enabled because every peer supports them too.
pub struct FeatureService {
    local: BTreeSet<String>,
    enabled: RwLock<BTreeSet<String>>,
}

impl FeatureService {
    /// Service advertising the given locally supported feature names.
    #[must_use]
    pub fn new(local: BTreeSet<String>) -> Self {
        Self {
            local,
            enabled: RwLock::new(BTreeSet::new()),
        }
    }

    /// Parses a comma-separated feature list, dropping empty names.
    #[must_use]
    pub fn to_feature_set(value: &str) -> BTreeSet<String> {
        value
            .split(',')
            .filter(|name| !name.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    }

    /// Features the local node supports.
    #[must_use]
    pub const fn local_features(&self) -> &BTreeSet<String> {
        &self.local
    }

    /// Marks a feature as enabled cluster-wide.
    pub fn enable(&self, name: &str) {
        if self.enabled.write().insert(name.to_string()) {
            info!(feature = name, "Feature is enabled cluster-wide");
        }
    }

    /// Whether the feature has been enabled cluster-wide.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.read().contains(name)
    }

    /// Snapshot of all enabled features.
    #[must_use]
    pub fn enabled_features(&self) -> BTreeSet<String> {
        self.enabled.read().clone()
    }
}

/// Small key/value hook through which the core persists its generation counter
/// and the last-known peer features.
#[async_trait]
pub trait PeerFeatureStore: Send + Sync {
    /// Peer address to comma-separated feature names, as last persisted.
    async fn load_peer_features(&self) -> Result<HashMap<SocketAddr, String>, GossipError>;

    /// Persists a peer's feature list.
    async fn save_peer_features(
        &self,
        peer: SocketAddr,
        features: String,
    ) -> Result<(), GossipError>;

    /// Generation the local node last started with, if any.
    async fn load_generation(&self) -> Result<Option<i32>, GossipError>;

    /// Persists the generation the local node is starting with.
    async fn save_generation(&self, generation: i32) -> Result<(), GossipError>;
}

/// Store that persists nothing; suits tests and stateless tools.
#[derive(Debug, Default)]
pub struct NullPeerFeatureStore;

#[async_trait]
impl PeerFeatureStore for NullPeerFeatureStore {
    async fn load_peer_features(&self) -> Result<HashMap<SocketAddr, String>, GossipError> {
        Ok(HashMap::new())
    }

    async fn save_peer_features(
        &self,
        _peer: SocketAddr,
        _features: String,
    ) -> Result<(), GossipError> {
        Ok(())
    }

    async fn load_generation(&self) -> Result<Option<i32>, GossipError> {
        Ok(None)
    }

    async fn save_generation(&self, _generation: i32) -> Result<(), GossipError> {
        Ok(())
    }
}

/// In-memory store backing the hook, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryPeerFeatureStore {
    peers: RwLock<HashMap<SocketAddr, String>>,
    generation: RwLock<Option<i32>>,
}

impl MemoryPeerFeatureStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerFeatureStore for MemoryPeerFeatureStore {
    async fn load_peer_features(&self) -> Result<HashMap<SocketAddr, String>, GossipError> {
        Ok(self.peers.read().clone())
    }

    async fn save_peer_features(
        &self,
        peer: SocketAddr,
        features: String,
    ) -> Result<(), GossipError> {
        self.peers.write().insert(peer, features);
        Ok(())
    }

    async fn load_generation(&self) -> Result<Option<i32>, GossipError> {
        Ok(*self.generation.read())
    }

    async fn save_generation(&self, generation: i32) -> Result<(), GossipError> {
        *self.generation.write() = Some(generation);
        Ok(())
    }
}

/// Subscriber that re-evaluates the cluster-common feature set whenever a peer
/// joins or republishes SUPPORTED_FEATURES.
pub(crate) struct FeatureEnabler {
    gossiper: Weak<Gossiper>,
}

impl FeatureEnabler {
    pub(crate) fn new(gossiper: Weak<Gossiper>) -> Self {
        Self { gossiper }
    }
}

#[async_trait]
impl EndpointStateSubscriber for FeatureEnabler {
    async fn on_join(
        &self,
        _endpoint: SocketAddr,
        _state: EndpointState,
    ) -> Result<(), GossipError> {
        if let Some(gossiper) = self.gossiper.upgrade() {
            gossiper.maybe_enable_features().await?;
        }
        Ok(())
    }

    async fn on_change(
        &self,
        _endpoint: SocketAddr,
        key: ApplicationState,
        _value: VersionedValue,
    ) -> Result<(), GossipError> {
        if key == ApplicationState::SupportedFeatures {
            if let Some(gossiper) = self.gossiper.upgrade() {
                gossiper.maybe_enable_features().await?;
            }
        }
        Ok(())
    }
}
