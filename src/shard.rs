//! Sharded endpoint-state store.
//!
//! Shard 0 is the coordinator and owns the canonical state; the remaining
//! shards hold read-mostly copies fed exclusively through the replication
//! methods here. No operation that mutates the coordinator returns before the
//! fan-out to every replica has completed.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::state::{ApplicationState, EndpointState, HeartBeatState, VersionedValue};

/// Scoped permit for one endpoint's state; dropping it releases the lock on
/// every exit path, including cancellation.
pub struct EndpointPermit {
    _permit: OwnedSemaphorePermit,
}

/// Keyed map of unit-capacity semaphores guarding per-endpoint mutations.
#[derive(Default)]
pub(crate) struct EndpointLockMap {
    locks: DashMap<SocketAddr, Arc<Semaphore>>,
}

impl EndpointLockMap {
    pub(crate) async fn lock(&self, endpoint: SocketAddr) -> EndpointPermit {
        let semaphore = self
            .locks
            .entry(endpoint)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        let permit = semaphore
            .acquire_owned()
            .await
            .expect("endpoint lock semaphore is never closed");
        EndpointPermit { _permit: permit }
    }
}

/// One shard's copy of the membership tables.
pub struct ShardReplica {
    states: DashMap<SocketAddr, EndpointState>,
    live: RwLock<Vec<SocketAddr>>,
    unreachable: RwLock<HashMap<SocketAddr, Instant>>,
    live_version: AtomicU64,
}

impl ShardReplica {
    fn new() -> Self {
        Self {
            states: DashMap::new(),
            live: RwLock::new(Vec::new()),
            unreachable: RwLock::new(HashMap::new()),
            live_version: AtomicU64::new(0),
        }
    }

    /// Clone of the endpoint's state, if known on this shard.
    #[must_use]
    pub fn get(&self, endpoint: &SocketAddr) -> Option<EndpointState> {
        self.states.get(endpoint).map(|entry| entry.clone())
    }

    /// Whether the endpoint is known on this shard.
    #[must_use]
    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.states.contains_key(endpoint)
    }

    /// Liveness bit of the endpoint as replicated to this shard.
    #[must_use]
    pub fn is_alive(&self, endpoint: &SocketAddr) -> bool {
        self.states
            .get(endpoint)
            .is_some_and(|entry| entry.is_alive())
    }

    /// Every endpoint known on this shard.
    #[must_use]
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.states.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of endpoints known on this shard.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether this shard knows no endpoints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub(crate) fn insert(&self, endpoint: SocketAddr, state: EndpointState) {
        self.states.insert(endpoint, state);
    }

    pub(crate) fn with_state_mut<R>(
        &self,
        endpoint: &SocketAddr,
        f: impl FnOnce(&mut EndpointState) -> R,
    ) -> Option<R> {
        self.states.get_mut(endpoint).map(|mut entry| f(&mut entry))
    }

    pub(crate) fn remove(&self, endpoint: &SocketAddr) {
        self.states.remove(endpoint);
    }

    /// Ordered live view as replicated to this shard.
    #[must_use]
    pub fn live_endpoints(&self) -> Vec<SocketAddr> {
        self.live.read().clone()
    }

    /// Unreachable endpoints with the instant each was first observed down.
    #[must_use]
    pub fn unreachable_endpoints(&self) -> HashMap<SocketAddr, Instant> {
        self.unreachable.read().clone()
    }

    /// Version of the live set, bumped on every mutation.
    #[must_use]
    pub fn live_endpoints_version(&self) -> u64 {
        self.live_version.load(Ordering::Acquire)
    }

    pub(crate) fn set_live(&self, live: Vec<SocketAddr>) {
        *self.live.write() = live;
    }

    pub(crate) fn push_live(&self, endpoint: SocketAddr) {
        self.live.write().push(endpoint);
    }

    pub(crate) fn remove_live(&self, endpoint: &SocketAddr) {
        self.live.write().retain(|existing| existing != endpoint);
    }

    pub(crate) fn shuffle_live(&self, rng: &mut impl rand::Rng) {
        use rand::seq::SliceRandom;
        self.live.write().shuffle(rng);
    }

    pub(crate) fn set_unreachable_map(&self, unreachable: HashMap<SocketAddr, Instant>) {
        *self.unreachable.write() = unreachable;
    }

    pub(crate) fn insert_unreachable(&self, endpoint: SocketAddr, since: Instant) {
        self.unreachable.write().entry(endpoint).or_insert(since);
    }

    pub(crate) fn remove_unreachable(&self, endpoint: &SocketAddr) {
        self.unreachable.write().remove(endpoint);
    }

    fn set_live_version(&self, version: u64) {
        self.live_version.store(version, Ordering::Release);
    }

    fn merge_application_state(
        &self,
        endpoint: SocketAddr,
        key: ApplicationState,
        value: &VersionedValue,
    ) {
        let mut entry = self
            .states
            .entry(endpoint)
            .or_insert_with(|| EndpointState::new(HeartBeatState::new(0)));
        let stale = entry
            .get(key)
            .is_some_and(|existing| existing.version > value.version);
        if !stale {
            entry.add_application_state(key, value.clone());
        }
    }

    fn set_alive_bit(&self, endpoint: &SocketAddr, alive: bool) {
        if let Some(mut entry) = self.states.get_mut(endpoint) {
            if alive {
                entry.mark_alive();
            } else {
                entry.mark_dead();
            }
        }
    }
}

/// The coordinator plus its replicas.
pub struct ShardSet {
    replicas: Vec<Arc<ShardReplica>>,
    locks: EndpointLockMap,
}

impl ShardSet {
    /// Creates `count` shards (at least one); shard 0 is the coordinator.
    #[must_use]
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            replicas: (0..count).map(|_| Arc::new(ShardReplica::new())).collect(),
            locks: EndpointLockMap::default(),
        }
    }

    /// Number of shards.
    #[must_use]
    pub fn count(&self) -> usize {
        self.replicas.len()
    }

    /// The coordinator shard, owner of the canonical state.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<ShardReplica> {
        &self.replicas[0]
    }

    /// A shard by index.
    #[must_use]
    pub fn replica(&self, shard: usize) -> &Arc<ShardReplica> {
        &self.replicas[shard]
    }

    /// Acquires the exclusive per-endpoint permit.
    pub async fn lock_endpoint(&self, endpoint: SocketAddr) -> EndpointPermit {
        self.locks.lock(endpoint).await
    }

    fn followers(&self) -> impl Iterator<Item = &Arc<ShardReplica>> {
        self.replicas.iter().skip(1)
    }

    /// Fans a full endpoint state out to every replica: the heartbeat is
    /// overwritten and every application key merged by version. Idempotent.
    pub fn replicate_full(&self, endpoint: SocketAddr, state: &EndpointState) {
        for replica in self.followers() {
            {
                let mut entry = replica
                    .states
                    .entry(endpoint)
                    .or_insert_with(|| EndpointState::new(*state.heart_beat()));
                entry.set_heart_beat_state_and_update_timestamp(*state.heart_beat());
            }
            for (key, value) in state.applications() {
                replica.merge_application_state(endpoint, *key, value);
            }
        }
    }

    /// Fans only the named keys out to every replica.
    pub fn replicate_changed(
        &self,
        endpoint: SocketAddr,
        source: &BTreeMap<ApplicationState, VersionedValue>,
        changed: &[ApplicationState],
    ) {
        for replica in self.followers() {
            for key in changed {
                if let Some(value) = source.get(key) {
                    replica.merge_application_state(endpoint, *key, value);
                }
            }
        }
    }

    /// Fans one key out to every replica.
    pub fn replicate_one(&self, endpoint: SocketAddr, key: ApplicationState, value: &VersionedValue) {
        for replica in self.followers() {
            replica.merge_application_state(endpoint, key, value);
        }
    }

    /// Removes the endpoint's state from every shard, coordinator included.
    pub fn evict(&self, endpoint: &SocketAddr) {
        for replica in &self.replicas {
            replica.remove(endpoint);
        }
    }

    /// Bumps the live-endpoints version on every shard; returns the new value.
    pub fn bump_live_version(&self) -> u64 {
        let version = self.coordinator().live_endpoints_version() + 1;
        for replica in &self.replicas {
            replica.set_live_version(version);
        }
        version
    }

    /// Copies the coordinator's live/unreachable sets and per-endpoint alive
    /// bits to every replica. Only the alive bit of each state is propagated
    /// on this path.
    pub fn sync_liveness(&self) {
        let live = self.coordinator().live_endpoints();
        let unreachable = self.coordinator().unreachable_endpoints();
        let alive_bits: Vec<(SocketAddr, bool)> = self
            .coordinator()
            .states
            .iter()
            .map(|entry| (*entry.key(), entry.is_alive()))
            .collect();
        for replica in self.followers() {
            replica.set_live(live.clone());
            replica.set_unreachable_map(unreachable.clone());
            for (endpoint, alive) in &alive_bits {
                replica.set_alive_bit(endpoint, *alive);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn endpoint_lock_is_exclusive() {
        let shards = Arc::new(ShardSet::new(2));
        let endpoint = addr(1);
        let permit = shards.lock_endpoint(endpoint).await;

        let contended = Arc::clone(&shards);
        let waiter = tokio::spawn(async move {
            contended.lock_endpoint(endpoint).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second permit granted while held");

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("lock released on drop")
            .expect("waiter task");
    }

    #[test]
    fn replication_is_idempotent_and_version_ordered() {
        let shards = ShardSet::new(3);
        let endpoint = addr(2);

        let mut state = EndpointState::new(HeartBeatState::with_version(5, 1));
        state.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version("NORMAL", 4),
        );
        shards.replicate_full(endpoint, &state);
        shards.replicate_full(endpoint, &state);

        let copy = shards.replica(2).get(&endpoint).expect("replicated");
        assert_eq!(copy.heart_beat().generation(), 5);
        assert_eq!(
            copy.get(ApplicationState::Status).map(|v| v.version),
            Some(4)
        );

        // A stale value must not clobber a newer replicated one.
        shards.replicate_one(
            endpoint,
            ApplicationState::Status,
            &VersionedValue::with_version("shutdown,true", 2),
        );
        let copy = shards.replica(1).get(&endpoint).expect("still replicated");
        assert_eq!(copy.status(), "NORMAL");
    }

    #[test]
    fn evict_clears_every_shard() {
        let shards = ShardSet::new(2);
        let endpoint = addr(3);
        let state = EndpointState::new(HeartBeatState::new(9));
        shards.coordinator().insert(endpoint, state.clone());
        shards.replicate_full(endpoint, &state);
        assert!(shards.replica(1).contains(&endpoint));

        shards.evict(&endpoint);
        assert!(!shards.coordinator().contains(&endpoint));
        assert!(!shards.replica(1).contains(&endpoint));
    }

    #[test]
    fn liveness_sync_propagates_alive_bits_and_sets() {
        let shards = ShardSet::new(2);
        let endpoint = addr(4);
        let mut state = EndpointState::new(HeartBeatState::new(1));
        state.mark_alive();
        shards.coordinator().insert(endpoint, state.clone());
        shards.replicate_full(endpoint, &state);
        shards.coordinator().push_live(endpoint);
        shards.bump_live_version();

        assert!(!shards.replica(1).is_alive(&endpoint));
        shards.sync_liveness();
        assert!(shards.replica(1).is_alive(&endpoint));
        assert_eq!(shards.replica(1).live_endpoints(), vec![endpoint]);
        assert_eq!(shards.replica(1).live_endpoints_version(), 1);
    }
}
