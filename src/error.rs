use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the gossip subsystem.
#[derive(Debug, Error)]
pub enum GossipError {
    /// Underlying network I/O failure.
    #[error("gossip transport error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure for gossip payloads.
    #[error("gossip serialization error: {0}")]
    Serialization(String),
    /// Payload exceeded the configured datagram budget.
    #[error("gossip message too large: {0} bytes")]
    MessageTooLarge(usize),
    /// An RPC did not complete within its deadline.
    #[error("gossip request to {peer} timed out")]
    Timeout {
        /// Peer the request was addressed to.
        peer: SocketAddr,
    },
    /// The remote peer does not understand the requested verb.
    #[error("peer {peer} does not support the requested verb")]
    UnknownVerb {
        /// Peer that answered with an unsupported-verb notice.
        peer: SocketAddr,
    },
    /// The peer declined to answer an echo probe.
    #[error("peer {peer} rejected the echo probe")]
    EchoRejected {
        /// Peer that rejected the probe.
        peer: SocketAddr,
    },
    /// Gossip is not running.
    #[error("gossip is disabled")]
    Disabled,
    /// No state is known for the endpoint.
    #[error("no endpoint state for {0}")]
    UnknownEndpoint(SocketAddr),
    /// The operation may not target the local node.
    #[error("operation cannot target the local node {0}")]
    LocalEndpoint(SocketAddr),
    /// The target's generation moved while an administrative removal waited.
    #[error("endpoint {0} generation changed during removal")]
    GenerationChanged(SocketAddr),
    /// The target kept emitting heartbeats while being assassinated.
    #[error("endpoint still alive: {endpoint} {what} changed while trying to assassinate it")]
    StillAlive {
        /// Target of the assassination.
        endpoint: SocketAddr,
        /// Which half of the heartbeat moved (`generation` or `heartbeat`).
        what: &'static str,
    },
    /// A direct-ping endpoint id with no known address.
    #[error("endpoint id {0} has no corresponding address")]
    UnknownPingTarget(u64),
    /// Tokens could not be derived for the endpoint being assassinated.
    #[error("unable to calculate tokens for {0}")]
    NoTokens(SocketAddr),
    /// The shadow round did not reach any peer in time.
    #[error("unable to gossip with any nodes {0:?} (shadow round)")]
    ShadowRoundFailed(Vec<SocketAddr>),
    /// No configured seed was ever observed in gossip.
    #[error("unable to contact any seeds")]
    SeedsUnreachable,
    /// The cluster's common feature set is not understood locally.
    #[error("feature check failed: local features {local:?} do not cover cluster features {common:?}")]
    FeatureCheck {
        /// Features the local node supports.
        local: Vec<String>,
        /// Features common to the rest of the cluster.
        common: Vec<String>,
    },
    /// A peer gossips a different snitch implementation.
    #[error("snitch check failed: this node uses {local} and not {remote}")]
    SnitchMismatch {
        /// Snitch configured locally.
        local: String,
        /// Snitch reported by a peer.
        remote: String,
    },
    /// Waiting for peers to become alive exceeded the deadline.
    #[error("failed to mark nodes alive: waited for {nodes:?}, alive {alive:?}")]
    AliveWaitTimeout {
        /// Nodes we waited for.
        nodes: Vec<SocketAddr>,
        /// Subset that became alive before the deadline.
        alive: Vec<SocketAddr>,
    },
    /// A subscriber callback failed; the notifier logs and swallows these.
    #[error("subscriber failure: {0}")]
    Subscriber(String),
}
