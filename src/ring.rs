//! View of the token ring owned by an external placement subsystem.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;

/// Read-only ring membership queries the gossip core needs: the fat-client
/// check, dead-state eviction and administrative removal all consult this.
pub trait TokenRing: Send + Sync {
    /// Whether the endpoint owns tokens in the ring.
    fn is_member(&self, endpoint: &SocketAddr) -> bool;

    /// Tokens owned by the endpoint, empty when none are known.
    fn tokens(&self, endpoint: &SocketAddr) -> Vec<String>;

    /// Host id recorded for the endpoint, when known.
    fn host_id(&self, endpoint: &SocketAddr) -> Option<String>;

    /// Every endpoint that owns tokens.
    fn members(&self) -> Vec<SocketAddr>;
}

/// Ring with no members; suits gossip-only deployments and tests.
#[derive(Debug, Default)]
pub struct EmptyTokenRing;

impl TokenRing for EmptyTokenRing {
    fn is_member(&self, _endpoint: &SocketAddr) -> bool {
        false
    }

    fn tokens(&self, _endpoint: &SocketAddr) -> Vec<String> {
        Vec::new()
    }

    fn host_id(&self, _endpoint: &SocketAddr) -> Option<String> {
        None
    }

    fn members(&self) -> Vec<SocketAddr> {
        Vec::new()
    }
}

/// In-memory ring view fed by the caller.
#[derive(Debug, Default)]
pub struct StaticTokenRing {
    members: RwLock<HashMap<SocketAddr, RingEntry>>,
}

#[derive(Debug, Clone)]
struct RingEntry {
    tokens: Vec<String>,
    host_id: Option<String>,
}

impl StaticTokenRing {
    /// Empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a member.
    pub fn set_member(&self, endpoint: SocketAddr, tokens: Vec<String>, host_id: Option<String>) {
        self.members
            .write()
            .insert(endpoint, RingEntry { tokens, host_id });
    }

    /// Drops a member.
    pub fn remove_member(&self, endpoint: &SocketAddr) {
        self.members.write().remove(endpoint);
    }
}

impl TokenRing for StaticTokenRing {
    fn is_member(&self, endpoint: &SocketAddr) -> bool {
        self.members.read().contains_key(endpoint)
    }

    fn tokens(&self, endpoint: &SocketAddr) -> Vec<String> {
        self.members
            .read()
            .get(endpoint)
            .map(|entry| entry.tokens.clone())
            .unwrap_or_default()
    }

    fn host_id(&self, endpoint: &SocketAddr) -> Option<String> {
        self.members
            .read()
            .get(endpoint)
            .and_then(|entry| entry.host_id.clone())
    }

    fn members(&self) -> Vec<SocketAddr> {
        self.members.read().keys().copied().collect()
    }
}
