//! Wire types for the six gossip verbs.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::state::{ApplicationState, EndpointState};

/// Map of peer to endpoint state as carried by ACK/ACK2 and the shadow-round
/// reply.
pub type EndpointStateMap = BTreeMap<SocketAddr, EndpointState>;

/// Compact `(endpoint, generation, max_version)` summary of one peer's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigest {
    /// Peer the digest describes.
    pub endpoint: SocketAddr,
    /// Peer's generation as known to the sender.
    pub generation: i32,
    /// Peer's maximum state version as known to the sender.
    pub max_version: i32,
}

impl GossipDigest {
    /// Builds a digest.
    #[must_use]
    pub const fn new(endpoint: SocketAddr, generation: i32, max_version: i32) -> Self {
        Self {
            endpoint,
            generation,
            max_version,
        }
    }
}

// Digests order by (generation, max_version); the endpoint only breaks ties.
impl PartialOrd for GossipDigest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GossipDigest {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.generation, self.max_version)
            .cmp(&(other.generation, other.max_version))
            .then_with(|| self.endpoint.cmp(&other.endpoint))
    }
}

/// First phase of the digest exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Syn {
    /// Sender's cluster name; mismatches drop the message.
    pub cluster_name: String,
    /// Sender's partitioner; empty disables the check.
    pub partitioner_name: String,
    /// One digest per peer the sender knows about; empty means shadow probe.
    pub digests: Vec<GossipDigest>,
}

/// Second phase: requests plus deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    /// Digests describing state the sender wants.
    pub digests: Vec<GossipDigest>,
    /// Deltas the sender already knows the peer is missing.
    pub states: EndpointStateMap,
}

/// Third phase: the deltas the ACK requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack2 {
    /// Requested deltas.
    pub states: EndpointStateMap,
}

/// Every message exchanged on the gossip port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// GOSSIP_DIGEST_SYN.
    Syn(Syn),
    /// GOSSIP_DIGEST_ACK.
    Ack(Ack),
    /// GOSSIP_DIGEST_ACK2.
    Ack2(Ack2),
    /// GOSSIP_ECHO liveness probe.
    Echo {
        /// Correlates the reply with the outstanding request.
        request_id: u64,
        /// Sender's generation, used by the advertise gating.
        generation: Option<i64>,
    },
    /// Reply to an echo probe; `ok = false` signals a typed rejection.
    EchoReply {
        /// Correlation id copied from the probe.
        request_id: u64,
        /// Whether the peer accepted the probe.
        ok: bool,
    },
    /// GOSSIP_SHUTDOWN notice, fire-and-forget.
    Shutdown {
        /// Node announcing its shutdown.
        from: SocketAddr,
        /// Generation the announcement applies to.
        generation: Option<i32>,
    },
    /// GOSSIP_GET_ENDPOINT_STATES shadow-round request.
    GetEndpointStates {
        /// Correlates the reply with the outstanding request.
        request_id: u64,
        /// Application-state keys the caller wants.
        wanted: BTreeSet<ApplicationState>,
    },
    /// Reply to [`GossipMessage::GetEndpointStates`].
    EndpointStatesReply {
        /// Correlation id copied from the request.
        request_id: u64,
        /// Every known peer, filtered to the wanted keys.
        states: EndpointStateMap,
    },
    /// Sent in place of a reply by peers that lack the requested verb.
    Unsupported {
        /// Correlation id copied from the request.
        request_id: u64,
    },
}

impl GossipMessage {
    /// Verb name used in logs.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Syn(_) => "GOSSIP_DIGEST_SYN",
            Self::Ack(_) => "GOSSIP_DIGEST_ACK",
            Self::Ack2(_) => "GOSSIP_DIGEST_ACK2",
            Self::Echo { .. } | Self::EchoReply { .. } => "GOSSIP_ECHO",
            Self::Shutdown { .. } => "GOSSIP_SHUTDOWN",
            Self::GetEndpointStates { .. }
            | Self::EndpointStatesReply { .. }
            | Self::Unsupported { .. } => "GOSSIP_GET_ENDPOINT_STATES",
        }
    }
}

/// Whether a state map counts toward unsettled traffic.
///
/// LOAD, VIEW_BACKLOG and CACHE_HITRATES are high-frequency noise; a map
/// counts only when some peer carries a key outside that set.
#[must_use]
pub fn is_significant(states: &EndpointStateMap) -> bool {
    states.values().any(|state| {
        state.applications().keys().any(|key| {
            !matches!(
                key,
                ApplicationState::Load
                    | ApplicationState::ViewBacklog
                    | ApplicationState::CacheHitrates
            )
        })
    })
}
