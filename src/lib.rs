//! Cluster membership and liveness core for the Keelson database node.
//!
//! Tracks the set of peer nodes, disseminates per-node application state
//! through an anti-entropy gossip protocol, maintains a liveness view via an
//! echo-based failure detector and publishes membership events to local
//! subscribers.

/// Gossip tuning knobs and derived delays.
pub mod config;
/// Errors surfaced by the gossip subsystem.
pub mod error;
/// Active failure detection and the direct-FD endpoint pinger.
pub mod failure_detector;
/// Cluster feature negotiation and the persisted peer-feature hook.
pub mod features;
/// Anti-entropy engine, membership manager and lifecycle.
pub mod gossiper;
/// Wire types for the gossip verbs.
pub mod messages;
/// Verb sends, reply correlation and background-task supervision.
pub mod messaging;
/// Token-ring view owned by an external placement subsystem.
pub mod ring;
/// Sharded endpoint-state store and per-endpoint locks.
pub mod shard;
/// Versioned endpoint state, heartbeats and application-state keys.
pub mod state;
/// Membership-event subscribers.
pub mod subscribers;
/// UDP transport with a bincode codec.
pub mod transport;

pub use config::GossipConfig;
pub use error::GossipError;
pub use failure_detector::{DirectFdPinger, ECHO_INTERVAL};
pub use features::{
    FeatureService, MemoryPeerFeatureStore, NullPeerFeatureStore, PeerFeatureStore,
};
pub use gossiper::Gossiper;
pub use messages::{Ack, Ack2, EndpointStateMap, GossipDigest, GossipMessage, Syn};
pub use messaging::MessagingService;
pub use ring::{EmptyTokenRing, StaticTokenRing, TokenRing};
pub use shard::{EndpointPermit, ShardReplica, ShardSet};
pub use state::{
    generation_now, status, ApplicationState, EndpointState, HeartBeatState, VersionedValue,
    A_VERY_LONG_TIME, MAX_GENERATION_DIFFERENCE,
};
pub use subscribers::{EndpointStateSubscriber, SubscriberList};
pub use transport::GossipTransport;
