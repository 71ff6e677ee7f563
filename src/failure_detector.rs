//! Active failure detection: per-peer echo loops plus the endpoint-id pinger
//! used by the node-wide direct failure detector.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::GossipError;
use crate::gossiper::Gossiper;
use crate::messaging::MessagingService;

/// Cadence of active echo probes per live peer.
pub const ECHO_INTERVAL: Duration = Duration::from_millis(2000);

/// Shard-local bimap of endpoint address to numeric endpoint id, plus the
/// generation number advertised with every direct ping.
///
/// Ids are allocated only on the coordinator shard; other shards lazily fetch
/// the reverse mapping from the coordinator on first use.
pub struct DirectFdPinger {
    shards: Vec<PingerShard>,
    next_id: AtomicU64,
}

struct PingerShard {
    addr_to_id: DashMap<SocketAddr, u64>,
    id_to_addr: DashMap<u64, SocketAddr>,
    generation: AtomicI64,
}

impl PingerShard {
    fn new() -> Self {
        Self {
            addr_to_id: DashMap::new(),
            id_to_addr: DashMap::new(),
            generation: AtomicI64::new(0),
        }
    }
}

impl DirectFdPinger {
    pub(crate) fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count.max(1)).map(|_| PingerShard::new()).collect(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocates (or returns the existing) id for the address. Coordinator
    /// shard only.
    pub fn allocate_id(&self, addr: SocketAddr) -> u64 {
        let coordinator = &self.shards[0];
        if let Some(id) = coordinator.addr_to_id.get(&addr) {
            return *id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        coordinator.id_to_addr.insert(id, addr);
        coordinator.addr_to_id.insert(addr, id);
        debug!(%addr, id, "direct_fd_pinger: assigned endpoint id");
        id
    }

    /// Resolves an id on the given shard, fetching from the coordinator and
    /// caching locally when the shard has not seen it yet.
    pub fn address_of(&self, shard: usize, id: u64) -> Option<SocketAddr> {
        let local = &self.shards[shard];
        if let Some(addr) = local.id_to_addr.get(&id) {
            return Some(*addr);
        }
        let addr = *self.shards[0].id_to_addr.get(&id)?;
        local.id_to_addr.insert(id, addr);
        Some(addr)
    }

    /// Propagates a new gossip generation to every shard; stale values are
    /// ignored.
    pub fn update_generation_number(&self, generation: i64) {
        if generation <= self.shards[0].generation.load(Ordering::Acquire) {
            return;
        }
        for shard in &self.shards {
            shard.generation.store(generation, Ordering::Release);
        }
    }

    /// Generation advertised by pings issued from the shard.
    #[must_use]
    pub fn generation_number(&self, shard: usize) -> i64 {
        self.shards[shard].generation.load(Ordering::Acquire)
    }

    /// Sends one echo to the endpoint behind `id`. Returns `true` on success
    /// and `false` when the peer rejected the probe; transport failures
    /// propagate.
    pub async fn ping(
        &self,
        messaging: &MessagingService,
        shard: usize,
        id: u64,
        timeout: Duration,
    ) -> Result<bool, GossipError> {
        let addr = self
            .address_of(shard, id)
            .ok_or(GossipError::UnknownPingTarget(id))?;
        match messaging
            .send_echo(addr, Some(self.generation_number(shard)), timeout)
            .await
        {
            Ok(()) => Ok(true),
            Err(GossipError::EchoRejected { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Main loop of the active failure detector. Runs while gossip is enabled:
/// snapshots the live set, probes every member from its assigned shard, then
/// convicts any peer that dropped out of the live set between snapshots.
pub(crate) async fn failure_detector_loop(gossiper: Arc<Gossiper>) {
    info!("failure_detector_loop: Started main loop");
    while gossiper.is_enabled() {
        while gossiper.shards().coordinator().live_endpoints().is_empty() && gossiper.is_enabled() {
            debug!("failure_detector_loop: Wait until live_nodes is not empty");
            if !gossiper.sleep_abortable(Duration::from_millis(1000)).await {
                info!("failure_detector_loop: Finished main loop");
                return;
            }
        }
        if !gossiper.is_enabled() {
            break;
        }

        let coordinator = Arc::clone(gossiper.shards().coordinator());
        let nodes = coordinator.live_endpoints();
        let live_endpoints_version = coordinator.live_endpoints_version();
        let generation_number = coordinator
            .get(&gossiper.local_endpoint())
            .map_or(0, |state| i64::from(state.heart_beat().generation()));

        let mut tasks = Vec::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            let shard = idx % gossiper.shards().count();
            debug!(
                node = %node,
                shard,
                live_endpoints_version,
                "failure_detector_loop: Started new round for node"
            );
            let per_node = Arc::clone(&gossiper);
            let node = *node;
            tasks.push(tokio::spawn(async move {
                failure_detector_loop_for_node(
                    per_node,
                    node,
                    generation_number,
                    live_endpoints_version,
                    shard,
                )
                .await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        // Convict peers that dropped out of the live set while the per-node
        // loops were running; repeat until the version stops moving so no
        // down node misses its conviction.
        loop {
            let version = coordinator.live_endpoints_version();
            let current: BTreeSet<SocketAddr> = coordinator.live_endpoints().into_iter().collect();
            let previous: BTreeSet<SocketAddr> = nodes.iter().copied().collect();
            let nodes_down: Vec<SocketAddr> = previous.difference(&current).copied().collect();
            if !nodes_down.is_empty() {
                debug!(
                    previous = ?previous,
                    current = ?current,
                    down = ?nodes_down,
                    "failure_detector_loop: convicting nodes that left the live set"
                );
                for node in &nodes_down {
                    gossiper.convict(*node).await;
                }
            }
            if version == coordinator.live_endpoints_version() {
                break;
            }
        }
    }
    info!("failure_detector_loop: Finished main loop");
}

async fn failure_detector_loop_for_node(
    gossiper: Arc<Gossiper>,
    node: SocketAddr,
    gossip_generation: i64,
    live_endpoints_version: u64,
    shard: usize,
) {
    let mut last = Instant::now();
    let max_duration = ECHO_INTERVAL + gossiper.failure_detector_timeout();
    while gossiper.is_enabled() {
        let mut failed = false;
        debug!(node = %node, shard, "failure_detector_loop: Send echo to node, status = started");
        match gossiper
            .messaging()
            .send_echo(node, Some(gossip_generation), max_duration)
            .await
        {
            Ok(()) => debug!(node = %node, "failure_detector_loop: Send echo to node, status = ok"),
            Err(err) => {
                failed = true;
                warn!(node = %node, "failure_detector_loop: Send echo to node, status = failed: {err}");
            }
        }
        let now = Instant::now();
        let diff = now.duration_since(last);
        if !failed {
            last = now;
        }
        if diff > max_duration {
            info!(node = %node, "failure_detector_loop: Mark node as DOWN");
            gossiper.convict(node).await;
            return;
        }

        // A live-set version change means nodes are being re-distributed to
        // shards; the main loop restarts the per-node loops.
        if gossiper.shards().coordinator().live_endpoints_version() != live_endpoints_version {
            debug!(
                node = %node,
                live_endpoints_version,
                "failure_detector_loop: Finished loop for node"
            );
            return;
        }
        if !gossiper.sleep_abortable(ECHO_INTERVAL).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn id_allocation_is_stable_per_address() {
        let pinger = DirectFdPinger::new(3);
        let first = pinger.allocate_id(addr(1));
        let second = pinger.allocate_id(addr(2));
        assert_ne!(first, second);
        assert_eq!(pinger.allocate_id(addr(1)), first);
    }

    #[test]
    fn non_coordinator_shards_fetch_lazily() {
        let pinger = DirectFdPinger::new(2);
        let id = pinger.allocate_id(addr(7));
        assert_eq!(pinger.address_of(1, id), Some(addr(7)));
        // Cached now; still resolvable.
        assert_eq!(pinger.address_of(1, id), Some(addr(7)));
        assert_eq!(pinger.address_of(1, id + 100), None);
    }

    #[test]
    fn generation_updates_ignore_stale_values() {
        let pinger = DirectFdPinger::new(2);
        pinger.update_generation_number(10);
        pinger.update_generation_number(5);
        assert_eq!(pinger.generation_number(0), 10);
        assert_eq!(pinger.generation_number(1), 10);
    }
}
