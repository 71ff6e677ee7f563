//! Anti-entropy engine, membership manager and lifecycle of the gossip core.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::config::GossipConfig;
use crate::error::GossipError;
use crate::failure_detector::{self, DirectFdPinger};
use crate::features::{FeatureEnabler, FeatureService, PeerFeatureStore};
use crate::messages::{
    is_significant, Ack, Ack2, EndpointStateMap, GossipDigest, GossipMessage, Syn,
};
use crate::messaging::{Gate, MessagingService};
use crate::ring::TokenRing;
use crate::shard::ShardSet;
use crate::state::{
    generation_now, status, ApplicationState, EndpointState, HeartBeatState, VersionedValue,
    A_VERY_LONG_TIME, MAX_GENERATION_DIFFERENCE,
};
use crate::subscribers::{EndpointStateSubscriber, SubscriberList};

/// Every live peer is contacted at least once within this many rounds
/// (SWIM-style fan-out).
const FANOUT_ROUNDS: usize = 10;

/// Deadline for the mark-alive echo handshake.
const MARK_ALIVE_ECHO_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Per-RPC timeout inside the shadow round.
const SHADOW_ROUND_RPC_TIMEOUT: Duration = Duration::from_millis(5000);

/// Retry cadence of the shadow round.
const SHADOW_ROUND_RETRY_INTERVAL: Duration = Duration::from_secs(1);

const GOSSIP_SETTLE_MIN_WAIT: Duration = Duration::from_millis(5000);
const GOSSIP_SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(1000);
const GOSSIP_SETTLE_POLL_SUCCESSES_REQUIRED: i32 = 3;

/// Application states requested during the shadow round.
const SHADOW_ROUND_WANTED: [ApplicationState; 5] = [
    ApplicationState::Status,
    ApplicationState::HostId,
    ApplicationState::Tokens,
    ApplicationState::SupportedFeatures,
    ApplicationState::SnitchName,
];

/// Per-source coalescing slot: at most one in-flight handler and at most one
/// stashed message, most recent wins.
struct PendingSlot<T> {
    in_flight: bool,
    queued: Option<T>,
}

impl<T> Default for PendingSlot<T> {
    fn default() -> Self {
        Self {
            in_flight: false,
            queued: None,
        }
    }
}

/// Decrements the in-flight significant-message counter on drop.
struct MsgProcessingGuard<'a> {
    counter: Option<&'a AtomicI64>,
}

impl<'a> MsgProcessingGuard<'a> {
    fn new(counter: &'a AtomicI64, significant: bool) -> Self {
        if significant {
            counter.fetch_add(1, Ordering::Relaxed);
            Self {
                counter: Some(counter),
            }
        } else {
            Self { counter: None }
        }
    }
}

impl Drop for MsgProcessingGuard<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

fn system_time_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}

/// The cluster membership and liveness core.
///
/// Owns the authoritative endpoint-state tables on the coordinator shard,
/// drives the periodic anti-entropy rounds, reconciles the live/unreachable
/// sets and fans membership events out to registered subscribers.
pub struct Gossiper {
    config: GossipConfig,
    local_addr: SocketAddr,
    messaging: Arc<MessagingService>,
    shards: Arc<ShardSet>,
    subscribers: SubscriberList,
    ring: Arc<dyn TokenRing>,
    feature_store: Arc<dyn PeerFeatureStore>,
    features: FeatureService,
    fd_pinger: DirectFdPinger,

    seeds: RwLock<BTreeSet<SocketAddr>>,
    just_removed: DashMap<SocketAddr, Instant>,
    expire_time: DashMap<SocketAddr, SystemTime>,
    endpoints_to_talk_with: Mutex<VecDeque<Vec<SocketAddr>>>,
    syn_slots: DashMap<SocketAddr, PendingSlot<Syn>>,
    ack_slots: DashMap<SocketAddr, PendingSlot<Vec<GossipDigest>>>,
    pending_mark_alive: DashSet<SocketAddr>,
    shadow_live: Mutex<Vec<SocketAddr>>,
    shadow_unreachable: Mutex<HashMap<SocketAddr, Instant>>,

    enabled: AtomicBool,
    in_shadow_round: AtomicBool,
    advertise_myself: AtomicBool,
    advertise_to: RwLock<HashMap<SocketAddr, i64>>,
    gossip_settled: AtomicBool,
    msg_processing: AtomicI64,
    nr_rounds: AtomicU64,

    apply_state_semaphore: Arc<Semaphore>,
    round_running: Arc<Semaphore>,
    rng: Mutex<SmallRng>,
    shutdown_tx: watch::Sender<bool>,
    gate: Arc<Gate>,

    recv_task: Mutex<Option<JoinHandle<()>>>,
    round_task: Mutex<Option<JoinHandle<()>>>,
    fd_task: Mutex<Option<JoinHandle<()>>>,

    this: Weak<Gossiper>,
}

impl Gossiper {
    /// Builds the gossip core around a bound messaging service.
    ///
    /// `shard_count` is the number of per-core state replicas to maintain;
    /// shard 0 acts as the coordinator.
    pub fn new(
        config: GossipConfig,
        messaging: MessagingService,
        shard_count: usize,
        ring: Arc<dyn TokenRing>,
        feature_store: Arc<dyn PeerFeatureStore>,
        local_features: BTreeSet<String>,
    ) -> Result<Arc<Self>, GossipError> {
        let local_addr = messaging.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);
        let advertise_myself = config.advertise_myself;
        let gossiper = Arc::new_cyclic(|this| Self {
            config,
            local_addr,
            messaging: Arc::new(messaging),
            shards: Arc::new(ShardSet::new(shard_count)),
            subscribers: SubscriberList::new(),
            ring,
            feature_store,
            features: FeatureService::new(local_features),
            fd_pinger: DirectFdPinger::new(shard_count),
            seeds: RwLock::new(BTreeSet::new()),
            just_removed: DashMap::new(),
            expire_time: DashMap::new(),
            endpoints_to_talk_with: Mutex::new(VecDeque::new()),
            syn_slots: DashMap::new(),
            ack_slots: DashMap::new(),
            pending_mark_alive: DashSet::new(),
            shadow_live: Mutex::new(Vec::new()),
            shadow_unreachable: Mutex::new(HashMap::new()),
            enabled: AtomicBool::new(false),
            in_shadow_round: AtomicBool::new(false),
            advertise_myself: AtomicBool::new(advertise_myself),
            advertise_to: RwLock::new(HashMap::new()),
            gossip_settled: AtomicBool::new(false),
            msg_processing: AtomicI64::new(0),
            nr_rounds: AtomicU64::new(0),
            apply_state_semaphore: Arc::new(Semaphore::new(1)),
            round_running: Arc::new(Semaphore::new(1)),
            rng: Mutex::new(SmallRng::from_entropy()),
            shutdown_tx,
            gate: Gate::new(),
            recv_task: Mutex::new(None),
            round_task: Mutex::new(None),
            fd_task: Mutex::new(None),
            this: this.clone(),
        });
        gossiper
            .subscribers
            .add(Arc::new(FeatureEnabler::new(Arc::downgrade(&gossiper))));
        Ok(gossiper)
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.this.upgrade()
    }

    /// Address this node gossips as.
    #[must_use]
    pub const fn local_endpoint(&self) -> SocketAddr {
        self.local_addr
    }

    /// The sharded state store.
    #[must_use]
    pub fn shards(&self) -> &Arc<ShardSet> {
        &self.shards
    }

    pub(crate) fn messaging(&self) -> &Arc<MessagingService> {
        &self.messaging
    }

    pub(crate) fn failure_detector_timeout(&self) -> Duration {
        self.config.failure_detector_timeout
    }

    /// The direct failure detector's pinger.
    #[must_use]
    pub const fn direct_fd_pinger(&self) -> &DirectFdPinger {
        &self.fd_pinger
    }

    /// Cluster feature negotiation state.
    #[must_use]
    pub const fn feature_service(&self) -> &FeatureService {
        &self.features
    }

    /// Cluster name peers must match.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    /// Configured seed addresses currently in effect.
    #[must_use]
    pub fn seeds(&self) -> BTreeSet<SocketAddr> {
        self.seeds.read().clone()
    }

    /// Whether the endpoint is a configured seed.
    #[must_use]
    pub fn is_seed(&self, endpoint: &SocketAddr) -> bool {
        self.seeds.read().contains(endpoint)
    }

    /// Whether gossip rounds are currently scheduled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Whether the node is inside the empty-SYN shadow-round fallback.
    #[must_use]
    pub fn is_in_shadow_round(&self) -> bool {
        self.in_shadow_round.load(Ordering::Acquire)
    }

    pub(crate) fn goto_shadow_round(&self) {
        self.in_shadow_round.store(true, Ordering::Release);
    }

    pub(crate) fn finish_shadow_round(&self) {
        self.in_shadow_round.store(false, Ordering::Release);
    }

    /// Registers a membership-event subscriber.
    pub fn register(&self, subscriber: Arc<dyn EndpointStateSubscriber>) {
        self.subscribers.add(subscriber);
    }

    /// Removes a previously registered subscriber.
    pub fn unregister(&self, subscriber: &Arc<dyn EndpointStateSubscriber>) {
        self.subscribers.remove(subscriber);
    }

    /// Number of completed gossip rounds since the last start.
    #[must_use]
    pub fn rounds_run(&self) -> u64 {
        self.nr_rounds.load(Ordering::Relaxed)
    }

    /// Sleeps, returning `false` when the process-level abort fired first.
    pub(crate) async fn sleep_abortable(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = shutdown.changed() => false,
            () = time::sleep(duration) => true,
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Starts the message receive loop; the verbs are served from here on.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.recv_task.lock();
        if slot.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut shutdown = this.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = this.messaging.recv() => match received {
                        Ok((message, from)) => {
                            if let Some(message) = this.messaging.intercept_reply(message, from) {
                                this.dispatch(message, from);
                            }
                        }
                        Err(err) => warn!("gossip recv error: {err}"),
                    }
                }
            }
        }));
    }

    fn dispatch(self: &Arc<Self>, message: GossipMessage, from: SocketAddr) {
        match message {
            GossipMessage::Echo {
                request_id,
                generation,
            } => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let ok = this.handle_echo(from, generation).is_ok();
                    if let Err(err) = this.messaging.reply_echo(from, request_id, ok).await {
                        trace!(%from, "failed to send echo reply: {err}");
                    }
                });
            }
            GossipMessage::GetEndpointStates { request_id, wanted } => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let states = this.handle_get_endpoint_states(&wanted);
                    if let Err(err) = this
                        .messaging
                        .reply_endpoint_states(from, request_id, states)
                        .await
                    {
                        trace!(%from, "failed to send endpoint-states reply: {err}");
                    }
                });
            }
            message => {
                // Background verbs are admitted through the gate so shutdown
                // can drain them; exceptions are swallowed per verb.
                let Some(guard) = self.gate.enter() else {
                    debug!(verb = message.verb(), "gossip gate closed, dropping message");
                    return;
                };
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let _guard = guard;
                    let verb = message.verb();
                    let result = match message {
                        GossipMessage::Syn(syn) => this.handle_syn(from, syn).await,
                        GossipMessage::Ack(ack) => this.handle_ack(from, ack).await,
                        GossipMessage::Ack2(ack2) => this.handle_ack2(from, ack2).await,
                        GossipMessage::Shutdown { from, generation } => {
                            this.handle_shutdown(from, generation).await
                        }
                        _ => Ok(()),
                    };
                    if let Err(err) = result {
                        warn!("Failed to handle {verb}: {err}");
                    }
                });
            }
        }
    }

    async fn handle_syn(&self, from: SocketAddr, syn: Syn) -> Result<(), GossipError> {
        trace!(
            %from,
            peer_cluster = %syn.cluster_name,
            local_cluster = %self.config.cluster_name,
            "handle_syn"
        );
        if !self.is_enabled() {
            return Ok(());
        }
        if syn.cluster_name != self.config.cluster_name {
            warn!(
                "ClusterName mismatch from {from} {} != {}",
                syn.cluster_name, self.config.cluster_name
            );
            return Ok(());
        }
        if !syn.partitioner_name.is_empty() && syn.partitioner_name != self.config.partitioner_name
        {
            warn!(
                "Partitioner mismatch from {from} {} != {}",
                syn.partitioner_name, self.config.partitioner_name
            );
            return Ok(());
        }

        {
            let mut slot = self.syn_slots.entry(from).or_default();
            if slot.in_flight {
                // The latest SYN carries the latest information; drop any
                // previously stashed one.
                debug!(%from, "queueing gossip SYN behind the in-flight handler");
                slot.queued = Some(syn);
                return Ok(());
            }
            slot.in_flight = true;
        }

        let mut current = syn;
        loop {
            if let Err(err) = self.do_send_ack(from, current).await {
                if let Some(mut slot) = self.syn_slots.get_mut(&from) {
                    slot.in_flight = false;
                    slot.queued = None;
                }
                return Err(err);
            }
            let next = match self.syn_slots.get_mut(&from) {
                // The peer was removed from membership mid-exchange.
                None => None,
                Some(mut slot) => match slot.queued.take() {
                    Some(next) => Some(next),
                    None => {
                        slot.in_flight = false;
                        None
                    }
                },
            };
            match next {
                Some(next) => {
                    debug!(%from, "handling queued gossip SYN");
                    current = next;
                }
                None => return Ok(()),
            }
        }
    }

    async fn do_send_ack(&self, from: SocketAddr, syn: Syn) -> Result<(), GossipError> {
        let mut digests = syn.digests;
        self.sort_digests_by_divergence(&mut digests);
        let mut delta_digests = Vec::new();
        let mut delta_states = EndpointStateMap::new();
        self.examine_gossiper(&mut digests, &mut delta_digests, &mut delta_states);
        debug!(
            %from,
            requests = delta_digests.len(),
            deltas = delta_states.len(),
            "sending gossip ACK"
        );
        self.messaging
            .send_ack(
                from,
                Ack {
                    digests: delta_digests,
                    states: delta_states,
                },
            )
            .await
    }

    async fn handle_ack(&self, from: SocketAddr, ack: Ack) -> Result<(), GossipError> {
        trace!(%from, "handle_ack");
        if !self.is_enabled() && !self.is_in_shadow_round() {
            return Ok(());
        }
        let Ack { digests, states } = ack;

        let _mp = MsgProcessingGuard::new(&self.msg_processing, is_significant(&states));
        if !states.is_empty() {
            self.update_timestamp_for_nodes(&states);
            self.apply_state_locally(states).await?;
        }

        if self.is_in_shadow_round() {
            // We have what we came for.
            self.finish_shadow_round();
            return Ok(());
        }

        {
            let mut slot = self.ack_slots.entry(from).or_default();
            if slot.in_flight {
                debug!(%from, "queueing gossip ACK digests behind the in-flight handler");
                slot.queued = Some(digests);
                return Ok(());
            }
            slot.in_flight = true;
        }

        let mut current = digests;
        loop {
            if let Err(err) = self.do_send_ack2(from, current).await {
                if let Some(mut slot) = self.ack_slots.get_mut(&from) {
                    slot.in_flight = false;
                    slot.queued = None;
                }
                return Err(err);
            }
            let next = match self.ack_slots.get_mut(&from) {
                None => None,
                Some(mut slot) => match slot.queued.take() {
                    Some(next) => Some(next),
                    None => {
                        slot.in_flight = false;
                        None
                    }
                },
            };
            match next {
                Some(next) => {
                    debug!(%from, "handling queued gossip ACK digests");
                    current = next;
                }
                None => return Ok(()),
            }
        }
    }

    async fn do_send_ack2(
        &self,
        from: SocketAddr,
        digests: Vec<GossipDigest>,
    ) -> Result<(), GossipError> {
        let mut delta_states = EndpointStateMap::new();
        for digest in digests {
            if let Some(delta) = self.state_for_version_bigger_than(digest.endpoint, digest.max_version)
            {
                delta_states.insert(digest.endpoint, delta);
            }
        }
        debug!(%from, deltas = delta_states.len(), "sending gossip ACK2");
        self.messaging
            .send_ack2(
                from,
                Ack2 {
                    states: delta_states,
                },
            )
            .await
    }

    async fn handle_ack2(&self, from: SocketAddr, ack2: Ack2) -> Result<(), GossipError> {
        trace!(%from, "handle_ack2");
        if !self.is_enabled() {
            return Ok(());
        }
        let _mp = MsgProcessingGuard::new(&self.msg_processing, is_significant(&ack2.states));
        self.update_timestamp_for_nodes(&ack2.states);
        self.apply_state_locally(ack2.states).await
    }

    fn handle_echo(&self, from: SocketAddr, generation: Option<i64>) -> Result<(), GossipError> {
        let mut respond = self.advertise_myself.load(Ordering::Acquire);
        if respond {
            let advertise_to = self.advertise_to.read();
            if !advertise_to.is_empty() {
                match advertise_to.get(&from) {
                    None => respond = false,
                    Some(saved_generation) => match self.shards.coordinator().get(&from) {
                        Some(state) => {
                            let current = generation
                                .unwrap_or_else(|| i64::from(state.heart_beat().generation()));
                            respond = *saved_generation == current;
                            debug!(
                                %from,
                                saved_generation,
                                current_generation = current,
                                "handle_echo generation gate"
                            );
                        }
                        None => respond = false,
                    },
                }
            }
        }
        if respond {
            Ok(())
        } else {
            Err(GossipError::EchoRejected { peer: from })
        }
    }

    async fn handle_shutdown(
        &self,
        from: SocketAddr,
        generation: Option<i32>,
    ) -> Result<(), GossipError> {
        if !self.is_enabled() {
            debug!("Ignoring shutdown message from {from} because gossip is disabled");
            return Ok(());
        }
        let _permit = self.shards.lock_endpoint(from).await;
        if let Some(received_generation) = generation {
            match self.shards.coordinator().get(&from) {
                Some(state) => {
                    let local_generation = state.heart_beat().generation();
                    info!(
                        "Got shutdown message from {from}, received_generation={received_generation}, local_generation={local_generation}"
                    );
                    if local_generation != received_generation {
                        warn!(
                            "Ignoring shutdown message from {from} because generation number does not match, received_generation={received_generation}, local_generation={local_generation}"
                        );
                        return Ok(());
                    }
                }
                None => {
                    warn!(
                        "Ignoring shutdown message from {from} because generation number does not match, received_generation={received_generation}, local_generation=not found"
                    );
                    return Ok(());
                }
            }
        }
        self.mark_as_shutdown_locked(from).await;
        Ok(())
    }

    fn handle_get_endpoint_states(&self, wanted: &BTreeSet<ApplicationState>) -> EndpointStateMap {
        let coordinator = self.shards.coordinator();
        let mut map = EndpointStateMap::new();
        for endpoint in coordinator.endpoints() {
            let Some(state) = coordinator.get(&endpoint) else {
                continue;
            };
            let mut state_wanted = EndpointState::new(*state.heart_beat());
            for (key, value) in state.applications() {
                if wanted.contains(key) {
                    state_wanted.add_application_state(*key, value.clone());
                }
            }
            map.insert(endpoint, state_wanted);
        }
        map
    }

    // ------------------------------------------------------------------
    // Digest comparison
    // ------------------------------------------------------------------

    /// Reorders incoming digests so the most-diverged endpoints are examined
    /// first.
    fn sort_digests_by_divergence(&self, digests: &mut Vec<GossipDigest>) {
        let coordinator = self.shards.coordinator();
        let mut by_endpoint: HashMap<SocketAddr, GossipDigest> = HashMap::new();
        for digest in digests.iter() {
            by_endpoint.entry(digest.endpoint).or_insert(*digest);
        }

        let mut diff_digests: Vec<GossipDigest> = digests
            .iter()
            .map(|digest| {
                let local_version = coordinator
                    .get(&digest.endpoint)
                    .map_or(0, |state| state.max_version());
                GossipDigest::new(
                    digest.endpoint,
                    digest.generation,
                    (local_version - digest.max_version).abs(),
                )
            })
            .collect();
        diff_digests.sort_unstable();

        digests.clear();
        for diff in diff_digests.iter().rev() {
            if let Some(original) = by_endpoint.get(&diff.endpoint) {
                digests.push(*original);
            }
        }
    }

    /// Compares each incoming digest against local state and fills the reply:
    /// request-digests for state we are missing, state-deltas for state the
    /// peer is missing.
    fn examine_gossiper(
        &self,
        digests: &mut Vec<GossipDigest>,
        delta_digests: &mut Vec<GossipDigest>,
        delta_states: &mut EndpointStateMap,
    ) {
        if digests.is_empty() {
            // A completely empty SYN is a shadow-round probe; reply with
            // everything we know.
            debug!("Shadow request received, adding all states");
            for endpoint in self.shards.coordinator().endpoints() {
                digests.push(GossipDigest::new(endpoint, 0, 0));
            }
        }
        for digest in digests.iter() {
            let remote_generation = digest.generation;
            let max_remote_version = digest.max_version;
            let endpoint = digest.endpoint;
            let Some(state) = self.shards.coordinator().get(&endpoint) else {
                // Nothing known locally; request everything.
                self.request_all(endpoint, delta_digests, remote_generation);
                continue;
            };
            let local_generation = state.heart_beat().generation();
            let max_local_version = state.max_version();
            trace!(
                %endpoint,
                remote = format_args!("{remote_generation}.{max_remote_version}"),
                local = format_args!("{local_generation}.{max_local_version}"),
                "examine_gossiper"
            );
            if remote_generation == local_generation && max_remote_version == max_local_version {
                continue;
            }
            if remote_generation > local_generation {
                self.request_all(endpoint, delta_digests, remote_generation);
            } else if remote_generation < local_generation {
                self.send_all(endpoint, delta_states, 0);
            } else if max_remote_version > max_local_version {
                trace!(
                    %endpoint,
                    "examine_gossiper: requesting version > {max_local_version}"
                );
                delta_digests.push(GossipDigest::new(
                    endpoint,
                    remote_generation,
                    max_local_version,
                ));
            } else if max_remote_version < max_local_version {
                self.send_all(endpoint, delta_states, max_remote_version);
            }
        }
    }

    fn request_all(
        &self,
        endpoint: SocketAddr,
        delta_digests: &mut Vec<GossipDigest>,
        remote_generation: i32,
    ) {
        trace!(%endpoint, "request_all");
        delta_digests.push(GossipDigest::new(endpoint, remote_generation, 0));
    }

    fn send_all(&self, endpoint: SocketAddr, delta_states: &mut EndpointStateMap, floor: i32) {
        trace!(%endpoint, floor, "send_all");
        if let Some(delta) = self.state_for_version_bigger_than(endpoint, floor) {
            delta_states.insert(endpoint, delta);
        }
    }

    /// The slice of the endpoint's local state strictly above `version`.
    #[must_use]
    pub fn state_for_version_bigger_than(
        &self,
        endpoint: SocketAddr,
        version: i32,
    ) -> Option<EndpointState> {
        self.shards
            .coordinator()
            .get(&endpoint)
            .and_then(|state| state.state_delta_above(version))
    }

    // ------------------------------------------------------------------
    // State application
    // ------------------------------------------------------------------

    fn update_timestamp_for_nodes(&self, map: &EndpointStateMap) {
        let coordinator = self.shards.coordinator();
        for (endpoint, remote_state) in map {
            coordinator.with_state_mut(endpoint, |local_state| {
                let local_generation = local_state.heart_beat().generation();
                let remote_generation = remote_state.heart_beat().generation();
                let update = remote_generation > local_generation
                    || (remote_generation == local_generation
                        && remote_state.heart_beat().version() > local_state.max_version());
                if update {
                    trace!(%endpoint, "updated timestamp for node");
                    local_state.update_timestamp_to_now();
                }
            });
        }
    }

    /// Applies a batch of remote endpoint states, firing subscribers.
    pub async fn apply_state_locally(&self, map: EndpointStateMap) -> Result<(), GossipError> {
        let start = Instant::now();
        let mut endpoints: Vec<SocketAddr> = map.keys().copied().collect();
        {
            let mut rng = self.rng.lock();
            endpoints.shuffle(&mut *rng);
        }
        // Seeds first, to converge quickly on cluster-wide facts.
        endpoints.sort_by_key(|endpoint| !self.is_seed(endpoint));
        debug!(endpoints = ?endpoints, "apply_state_locally");

        for endpoint in endpoints {
            if endpoint == self.local_addr && !self.is_in_shadow_round() {
                continue;
            }
            if self.just_removed.contains_key(&endpoint) {
                trace!("Ignoring gossip for {endpoint} because it is quarantined");
                continue;
            }
            let Some(remote_state) = map.get(&endpoint) else {
                continue;
            };
            let permit = self
                .apply_state_semaphore
                .acquire()
                .await
                .expect("apply semaphore is never closed");
            self.do_apply_state_locally(endpoint, remote_state.clone(), true)
                .await?;
            drop(permit);
        }
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "apply_state_locally done");
        Ok(())
    }

    /// Shadow-round application: no subscriber notifications, no liveness
    /// handshakes.
    pub async fn apply_state_locally_without_listener_notification(
        &self,
        map: EndpointStateMap,
    ) -> Result<(), GossipError> {
        for (endpoint, remote_state) in map {
            self.do_apply_state_locally(endpoint, remote_state, false)
                .await?;
        }
        Ok(())
    }

    async fn do_apply_state_locally(
        &self,
        endpoint: SocketAddr,
        remote_state: EndpointState,
        listener_notification: bool,
    ) -> Result<(), GossipError> {
        let _permit = self.shards.lock_endpoint(endpoint).await;
        let local = self.shards.coordinator().get(&endpoint);
        let Some(local_state) = local else {
            if listener_notification {
                self.handle_major_state_change_locked(endpoint, remote_state)
                    .await;
            } else {
                debug!("Applying remote state for node {endpoint} (new node)");
                self.shards.coordinator().insert(endpoint, remote_state.clone());
                self.shards.replicate_full(endpoint, &remote_state);
            }
            return Ok(());
        };

        let local_generation = local_state.heart_beat().generation();
        let remote_generation = remote_state.heart_beat().generation();
        trace!("{endpoint} local generation {local_generation}, remote generation {remote_generation}");

        if i64::from(remote_generation) > i64::from(generation_now()) + MAX_GENERATION_DIFFERENCE {
            // Some peer is broadcasting an unbelievable generation about
            // another peer (or itself); assume corrupt memory.
            warn!(
                "received an invalid gossip generation for peer {endpoint}; local generation = {local_generation}, received generation = {remote_generation}"
            );
        } else if remote_generation > local_generation {
            if listener_notification {
                trace!(
                    "Updating heartbeat state generation to {remote_generation} from {local_generation} for {endpoint}"
                );
                self.handle_major_state_change_locked(endpoint, remote_state)
                    .await;
            } else {
                debug!("Applying remote state for node {endpoint} (remote generation > local generation)");
                self.shards.coordinator().insert(endpoint, remote_state.clone());
                self.shards.replicate_full(endpoint, &remote_state);
            }
        } else if remote_generation == local_generation {
            if listener_notification {
                let local_max_version = local_state.max_version();
                let remote_max_version = remote_state.max_version();
                if remote_max_version > local_max_version {
                    self.apply_new_states_locked(endpoint, local_state, &remote_state)
                        .await;
                } else {
                    trace!(
                        "Ignoring remote version {remote_max_version} <= {local_max_version} for {endpoint}"
                    );
                }
                if let Some(current) = self.shards.coordinator().get(&endpoint) {
                    if !current.is_alive() && !current.is_dead_state() {
                        self.mark_alive(endpoint);
                    }
                }
            } else {
                let mut merged = local_state;
                let mut changed = Vec::new();
                for (key, value) in remote_state.applications() {
                    let newer = merged
                        .get(*key)
                        .map_or(true, |local_value| value.version > local_value.version);
                    if newer {
                        debug!(
                            "Applying remote state for node {endpoint} (remote generation = local generation), key={key:?}"
                        );
                        merged.add_application_state(*key, value.clone());
                        changed.push(*key);
                    } else {
                        debug!(
                            "Ignoring remote state for node {endpoint} (remote generation = local generation), key={key:?}"
                        );
                    }
                }
                self.shards.coordinator().insert(endpoint, merged.clone());
                self.shards
                    .replicate_changed(endpoint, merged.applications(), &changed);
            }
        } else {
            debug!("Ignoring remote generation {remote_generation} < {local_generation}");
        }
        Ok(())
    }

    /// Same-generation delta merge. Applies every newer key, replicates, then
    /// notifies. Caller holds the endpoint permit.
    async fn apply_new_states_locked(
        &self,
        endpoint: SocketAddr,
        mut local_state: EndpointState,
        remote_state: &EndpointState,
    ) {
        local_state.set_heart_beat_state_and_update_timestamp(*remote_state.heart_beat());

        let mut updates: Vec<(ApplicationState, VersionedValue)> = Vec::new();
        for (key, value) in remote_state.applications() {
            let newer = local_state
                .get(*key)
                .map_or(true, |local_value| value.version > local_value.version);
            if newer {
                updates.push((*key, value.clone()));
            }
        }

        let before = local_state.clone();
        for (key, value) in &updates {
            self.subscribers
                .notify_before_change(endpoint, &before, *key, value)
                .await;
        }

        let mut changed = Vec::with_capacity(updates.len());
        for (key, value) in &updates {
            local_state.add_application_state(*key, value.clone());
            changed.push(*key);
        }
        self.shards.coordinator().insert(endpoint, local_state.clone());

        // Replication must precede notification so every shard observes the
        // new state before any listener runs.
        self.shards
            .replicate_changed(endpoint, local_state.applications(), &changed);

        for key in &changed {
            if let Some(value) = local_state.get(*key) {
                self.subscribers.notify_change(endpoint, *key, value).await;
            }
        }
    }

    /// First observation of an endpoint or a generation restart. Caller holds
    /// the endpoint permit.
    async fn handle_major_state_change_locked(
        &self,
        endpoint: SocketAddr,
        new_state: EndpointState,
    ) {
        let old_state = self.shards.coordinator().get(&endpoint);

        if !new_state.is_dead_state() && !self.is_in_shadow_round() {
            if old_state.is_some() {
                debug!(
                    "Node {endpoint} has restarted, now UP, status = {}",
                    new_state.status()
                );
            } else {
                debug!(
                    "Node {endpoint} is now part of the cluster, status = {}",
                    new_state.status()
                );
            }
        }
        trace!(
            "Adding endpoint state for {endpoint}, status = {}",
            new_state.status()
        );
        self.shards.coordinator().insert(endpoint, new_state.clone());
        self.shards.replicate_full(endpoint, &new_state);

        if self.is_in_shadow_round() {
            // Only the state itself matters during the shadow round; the
            // callbacks and the mark-alive handshake run during normal rounds.
            debug!(%endpoint, "in shadow round, skipping notifications");
            return;
        }

        if let Some(old_state) = &old_state {
            // The node restarted; subscribers see the pre-restart state.
            self.subscribers.notify_restart(endpoint, old_state).await;
        }

        let Some(current) = self.shards.coordinator().get(&endpoint) else {
            return;
        };
        if !current.is_dead_state() {
            self.mark_alive(endpoint);
        } else {
            debug!(
                "Not marking {endpoint} alive due to dead state {}",
                current.status()
            );
            self.mark_dead_locked(endpoint).await;
        }

        if let Some(state) = self.shards.coordinator().get(&endpoint) {
            self.subscribers.notify_join(endpoint, &state).await;
        }
        // Check at the end so peers first learn about the endpoint.
        if self.is_shutdown(&endpoint) {
            self.mark_as_shutdown_locked(endpoint).await;
        }
    }

    // ------------------------------------------------------------------
    // Liveness transitions
    // ------------------------------------------------------------------

    /// Two-phase mark-alive: echo first, promote to UP only on a reply.
    fn mark_alive(&self, endpoint: SocketAddr) {
        if !self.pending_mark_alive.insert(endpoint) {
            debug!("Node {endpoint} is being marked as up, ignoring duplicated mark alive operation");
            return;
        }
        debug!("Mark Node {endpoint} alive with echo");

        self.shards.coordinator().with_state_mut(&endpoint, |state| {
            state.mark_dead();
        });

        let generation = self
            .shards
            .coordinator()
            .get(&self.local_addr)
            .map(|state| i64::from(state.heart_beat().generation()));
        let Some(this) = self.strong() else {
            self.pending_mark_alive.remove(&endpoint);
            return;
        };
        let Some(guard) = self.gate.enter() else {
            self.pending_mark_alive.remove(&endpoint);
            return;
        };
        tokio::spawn(async move {
            let _guard = guard;
            debug!("Sending an echo to {endpoint}, with generation_number={generation:?}");
            match this
                .messaging
                .send_echo(endpoint, generation, MARK_ALIVE_ECHO_TIMEOUT)
                .await
            {
                Ok(()) => {
                    trace!("Got echo reply from {endpoint}");
                    this.real_mark_alive(endpoint).await;
                }
                Err(err) => warn!("Failed to send echo to {endpoint}: {err}"),
            }
            this.pending_mark_alive.remove(&endpoint);
        });
    }

    async fn real_mark_alive(&self, endpoint: SocketAddr) {
        let _permit = self.shards.lock_endpoint(endpoint).await;
        // The node may be gone from the state map by the time the echo
        // handshake finishes.
        let Some(mut state) = self.shards.coordinator().get(&endpoint) else {
            info!("Node {endpoint} is not in endpoint_state_map anymore");
            return;
        };
        trace!("marking as alive {endpoint}");

        let current_status = state.status().to_string();
        if current_status == status::SHUTDOWN {
            warn!("Skip marking node {endpoint} with status = {current_status} as UP");
            return;
        }

        state.mark_alive();
        // Refreshing the timestamp prevents the status check from racing us
        // and evicting a node that was down for a very long time.
        state.update_timestamp_to_now();
        self.shards.coordinator().insert(endpoint, state.clone());

        debug!("removing expire time for endpoint : {endpoint}");
        self.shards.coordinator().remove_unreachable(&endpoint);
        self.expire_time.remove(&endpoint);

        let was_live = self
            .shards
            .coordinator()
            .live_endpoints()
            .contains(&endpoint);
        if was_live {
            return;
        }
        self.shards.coordinator().push_live(endpoint);
        self.shards.bump_live_version();
        {
            let mut talk = self.endpoints_to_talk_with.lock();
            match talk.front_mut() {
                Some(front) => front.push(endpoint),
                None => talk.push_back(vec![endpoint]),
            }
        }

        if !self.is_in_shadow_round() {
            info!("Endpoint {endpoint} is now UP, status = {current_status}");
        }
        self.subscribers.notify_alive(endpoint, &state).await;
    }

    async fn mark_dead_locked(&self, endpoint: SocketAddr) {
        trace!("marking as down {endpoint}");
        let Some(mut state) = self.shards.coordinator().get(&endpoint) else {
            return;
        };
        state.mark_dead();
        self.shards.coordinator().insert(endpoint, state.clone());
        self.shards.coordinator().remove_live(&endpoint);
        self.shards.bump_live_version();
        self.shards
            .coordinator()
            .insert_unreachable(endpoint, Instant::now());
        info!("Endpoint {endpoint} is now DOWN, status = {}", state.status());
        self.subscribers.notify_dead(endpoint, &state).await;
    }

    /// Marks a peer that told us it is shutting down. Caller holds the
    /// endpoint permit.
    async fn mark_as_shutdown_locked(&self, endpoint: SocketAddr) {
        let Some(mut state) = self.shards.coordinator().get(&endpoint) else {
            return;
        };
        state.add_application_state(ApplicationState::Status, VersionedValue::shutdown());
        state
            .heart_beat_mut()
            .force_highest_possible_version_unsafe();
        self.shards.coordinator().insert(endpoint, state.clone());
        self.shards.replicate_full(endpoint, &state);
        self.mark_dead_locked(endpoint).await;
    }

    /// Declares a peer dead after the failure detector gave up on it.
    pub async fn convict(&self, endpoint: SocketAddr) {
        let _permit = self.shards.lock_endpoint(endpoint).await;
        let Some(state) = self.shards.coordinator().get(&endpoint) else {
            return;
        };
        if !state.is_alive() {
            return;
        }
        if self.is_shutdown(&endpoint) {
            self.mark_as_shutdown_locked(endpoint).await;
        } else {
            self.mark_dead_locked(endpoint).await;
        }
    }

    // ------------------------------------------------------------------
    // The periodic round
    // ------------------------------------------------------------------

    async fn run_round(&self) {
        let _round = self
            .round_running
            .acquire()
            .await
            .expect("round semaphore is never closed");
        if !self.is_enabled() {
            return;
        }
        trace!("=== Gossip round START");

        {
            let _permit = self.shards.lock_endpoint(self.local_addr).await;
            self.shards
                .coordinator()
                .with_state_mut(&self.local_addr, |state| {
                    state.heart_beat_mut().update_heart_beat();
                    trace!("My heartbeat is now {}", state.heart_beat().version());
                });
        }

        let digests = self.make_random_gossip_digest();
        if !digests.is_empty() {
            let message = Syn {
                cluster_name: self.config.cluster_name.clone(),
                partitioner_name: self.config.partitioner_name.clone(),
                digests,
            };

            let round_targets = self.pick_round_targets();
            match round_targets {
                Some(live_nodes) => {
                    debug!("Talk to live nodes: {live_nodes:?}");
                    for endpoint in live_nodes {
                        self.spawn_send_syn(endpoint, message.clone());
                    }
                }
                None => debug!("No one to talk with"),
            }

            self.maybe_gossip_to_unreachable(&message);
            self.do_status_check().await;
        }

        // If the live or unreachable sets moved, mirror them (and the alive
        // bits) to every shard before the next round.
        let live = self.shards.coordinator().live_endpoints();
        let unreachable = self.shards.coordinator().unreachable_endpoints();
        let live_changed = *self.shadow_live.lock() != live;
        let unreachable_changed = *self.shadow_unreachable.lock() != unreachable;
        if live_changed || unreachable_changed {
            if live_changed {
                *self.shadow_live.lock() = live;
            }
            if unreachable_changed {
                *self.shadow_unreachable.lock() = unreachable;
            }
            self.shards.sync_liveness();
        }

        if let Some(state) = self.shards.coordinator().get(&self.local_addr) {
            self.fd_pinger
                .update_generation_number(i64::from(state.heart_beat().generation()));
        }

        self.nr_rounds.fetch_add(1, Ordering::Relaxed);
        trace!("=== Gossip round OK");
    }

    fn pick_round_targets(&self) -> Option<Vec<SocketAddr>> {
        let mut talk = self.endpoints_to_talk_with.lock();
        if talk.is_empty() {
            {
                let mut rng = self.rng.lock();
                self.shards.coordinator().shuffle_live(&mut *rng);
            }
            let live = self.shards.coordinator().live_endpoints();
            if !live.is_empty() {
                let nodes_per_round = (live.len() + FANOUT_ROUNDS - 1) / FANOUT_ROUNDS;
                for chunk in live.chunks(nodes_per_round) {
                    talk.push_back(chunk.to_vec());
                }
                debug!(
                    endpoint_state_map = self.shards.coordinator().len(),
                    all_live_nodes = ?live,
                    chunks = talk.len(),
                    "Set live nodes to talk"
                );
            }
        }
        if talk.is_empty() {
            let nodes: Vec<SocketAddr> = self.seeds.read().iter().copied().collect();
            debug!("No live nodes yet: try initial contact point nodes={nodes:?}");
            if !nodes.is_empty() {
                talk.push_back(nodes);
            }
        }
        talk.pop_front()
    }

    fn spawn_send_syn(&self, endpoint: SocketAddr, message: Syn) {
        let Some(this) = self.strong() else {
            return;
        };
        let Some(guard) = self.gate.enter() else {
            return;
        };
        tokio::spawn(async move {
            let _guard = guard;
            trace!("Sending a GossipDigestSyn to {endpoint} ...");
            if let Err(err) = this.messaging.send_syn(endpoint, message).await {
                // It is normal for this to fail when the peer went down before
                // the failure detector noticed.
                trace!("Failed to send GossipDigestSyn to {endpoint}: {err}");
            }
        });
    }

    /// Gossips to a random non-LEFT unreachable peer with probability
    /// `unreachable / (live + 1)`, to check whether it is back up.
    fn maybe_gossip_to_unreachable(&self, message: &Syn) {
        let live_count = self.shards.coordinator().live_endpoints().len() as f64;
        let unreachable = self.shards.coordinator().unreachable_endpoints();
        if unreachable.is_empty() {
            return;
        }
        let probability = unreachable.len() as f64 / (live_count + 1.0);
        let roll: f64 = self.rng.lock().gen();
        if roll >= probability {
            return;
        }
        let candidates: Vec<SocketAddr> = unreachable
            .keys()
            .filter(|endpoint| self.gossip_status(endpoint) != status::LEFT)
            .copied()
            .collect();
        if candidates.is_empty() {
            return;
        }
        let index = self.rng.lock().gen_range(0..candidates.len());
        trace!(
            live = live_count,
            unreachable = unreachable.len(),
            "gossiping to unreachable member"
        );
        self.spawn_send_syn(candidates[index], message.clone());
    }

    async fn do_status_check(&self) {
        trace!("Performing status check ...");
        let now = Instant::now();
        let fat_client_timeout = self.config.fat_client_timeout();
        let quarantine_delay = self.config.quarantine_delay();

        for endpoint in self.shards.coordinator().endpoints() {
            if endpoint == self.local_addr {
                continue;
            }
            let Some(state) = self.shards.coordinator().get(&endpoint) else {
                continue;
            };

            // Fat clients are dropped automatically after a silence timeout;
            // dead states are not touched here.
            if self.is_gossip_only_member(&endpoint)
                && !self.just_removed.contains_key(&endpoint)
                && now.saturating_duration_since(state.update_timestamp()) > fat_client_timeout
            {
                info!(
                    "FatClient {endpoint} has been silent for {}ms, removing from gossip",
                    fat_client_timeout.as_millis()
                );
                self.remove_endpoint(endpoint).await;
                self.evict_from_membership(endpoint).await;
                continue;
            }

            let expire = self.expire_time_for_endpoint(&endpoint);
            if !state.is_alive() && SystemTime::now() > expire && !self.ring.is_member(&endpoint) {
                debug!("time is expiring for endpoint : {endpoint}");
                self.evict_from_membership(endpoint).await;
            }
        }

        self.just_removed.retain(|endpoint, since| {
            if now.saturating_duration_since(*since) > quarantine_delay {
                info!(
                    "{}ms elapsed, {endpoint} gossip quarantine over",
                    quarantine_delay.as_millis()
                );
                false
            } else {
                true
            }
        });
    }

    fn make_random_gossip_digest(&self) -> Vec<GossipDigest> {
        let coordinator = self.shards.coordinator();
        let mut endpoints = coordinator.endpoints();
        {
            let mut rng = self.rng.lock();
            endpoints.shuffle(&mut *rng);
        }
        endpoints
            .into_iter()
            .map(|endpoint| match coordinator.get(&endpoint) {
                Some(state) => GossipDigest::new(
                    endpoint,
                    state.heart_beat().generation(),
                    state.max_version(),
                ),
                None => GossipDigest::new(endpoint, 0, 0),
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Membership management
    // ------------------------------------------------------------------

    /// Whether the peer participates in gossip without owning ring tokens.
    #[must_use]
    pub fn is_gossip_only_member(&self, endpoint: &SocketAddr) -> bool {
        let Some(state) = self.shards.coordinator().get(endpoint) else {
            return false;
        };
        !state.is_dead_state() && !self.ring.is_member(endpoint)
    }

    fn quarantine_endpoint(&self, endpoint: SocketAddr) {
        self.just_removed.insert(endpoint, Instant::now());
    }

    /// Removes the endpoint from the live machinery and quarantines it.
    pub async fn remove_endpoint(&self, endpoint: SocketAddr) {
        // Subscribers run first (in the background) so anything that depends
        // on gossiper state is not confused by the removal below.
        if let (Some(this), Some(guard)) = (self.strong(), self.gate.enter()) {
            tokio::spawn(async move {
                let _guard = guard;
                this.subscribers.notify_remove(endpoint).await;
            });
        }

        {
            let mut seeds = self.seeds.write();
            seeds.clear();
            for seed in &self.config.seeds {
                if *seed != self.local_addr {
                    seeds.insert(*seed);
                }
            }
            if seeds.remove(&endpoint) {
                info!("removed {endpoint} from seeds, updated seeds list = {seeds:?}");
            }
        }

        self.shards.coordinator().remove_live(&endpoint);
        self.shards.bump_live_version();
        self.shards.coordinator().remove_unreachable(&endpoint);
        self.syn_slots.remove(&endpoint);
        self.ack_slots.remove(&endpoint);
        self.quarantine_endpoint(endpoint);
        debug!("removing endpoint {endpoint}");
    }

    /// Erases the endpoint's state on every shard and quarantines it.
    pub async fn evict_from_membership(&self, endpoint: SocketAddr) {
        let _permit = self.shards.lock_endpoint(endpoint).await;
        self.shards.coordinator().remove_unreachable(&endpoint);
        self.shards.evict(&endpoint);
        self.expire_time.remove(&endpoint);
        self.quarantine_endpoint(endpoint);
        debug!("evicting {endpoint} from gossip");
    }

    /// Administrative removal: `remove_endpoint` plus immediate eviction.
    pub async fn force_remove_endpoint(&self, endpoint: SocketAddr) -> Result<(), GossipError> {
        if endpoint == self.local_addr {
            return Err(GossipError::LocalEndpoint(endpoint));
        }
        self.remove_endpoint(endpoint).await;
        self.evict_from_membership(endpoint).await;
        info!("Finished to force remove node {endpoint}");
        Ok(())
    }

    /// STATUS=removing with the coordinator host id, after verifying the
    /// target's generation stays put for a ring delay.
    pub async fn advertise_removing(
        &self,
        endpoint: SocketAddr,
        host_id: &str,
        local_host_id: &str,
    ) -> Result<(), GossipError> {
        let state = self
            .shards
            .coordinator()
            .get(&endpoint)
            .ok_or(GossipError::UnknownEndpoint(endpoint))?;
        let generation = state.heart_beat().generation();
        info!("Removing host: {host_id}");
        info!(
            "Sleeping for {}ms to ensure {endpoint} does not change",
            self.config.ring_delay.as_millis()
        );
        self.sleep_abortable(self.config.ring_delay).await;

        let mut state = self
            .shards
            .coordinator()
            .get(&endpoint)
            .ok_or(GossipError::UnknownEndpoint(endpoint))?;
        if state.heart_beat().generation() != generation {
            return Err(GossipError::GenerationChanged(endpoint));
        }

        info!("Advertising removal for {endpoint}");
        state.update_timestamp_to_now(); // make sure we don't evict it too soon
        state.heart_beat_mut().force_newer_generation_unsafe();
        state.add_application_state(
            ApplicationState::Status,
            VersionedValue::removing_nonlocal(host_id),
        );
        state.add_application_state(
            ApplicationState::RemovalCoordinator,
            VersionedValue::removal_coordinator(local_host_id),
        );
        self.shards.coordinator().insert(endpoint, state.clone());
        self.shards.replicate_full(endpoint, &state);
        Ok(())
    }

    /// STATUS=removed with a far-future expiry; sleeps two rounds so the fact
    /// propagates before returning.
    pub async fn advertise_token_removed(
        &self,
        endpoint: SocketAddr,
        host_id: &str,
    ) -> Result<(), GossipError> {
        let mut state = self
            .shards
            .coordinator()
            .get(&endpoint)
            .ok_or(GossipError::UnknownEndpoint(endpoint))?;
        state.update_timestamp_to_now(); // make sure we don't evict it too soon
        state.heart_beat_mut().force_newer_generation_unsafe();
        let expire_time = SystemTime::now() + A_VERY_LONG_TIME;
        state.add_application_state(
            ApplicationState::Status,
            VersionedValue::removed_nonlocal(host_id, system_time_millis(expire_time)),
        );
        info!("Completing removal of {endpoint}");
        self.add_expire_time_for_endpoint(endpoint, expire_time);
        self.shards.coordinator().insert(endpoint, state.clone());
        self.shards.replicate_full(endpoint, &state);
        // Ensure at least one gossip round occurs before returning.
        self.sleep_abortable(self.config.interval * 2).await;
        Ok(())
    }

    /// Forges a STATUS=LEFT entry for an endpoint that cannot be removed any
    /// other way, then pushes it through a major state change.
    pub async fn assassinate_endpoint(&self, endpoint: SocketAddr) -> Result<(), GossipError> {
        let _permit = self.shards.lock_endpoint(endpoint).await;
        let existing = self.shards.coordinator().get(&endpoint);
        let mut ep_state = existing.clone().unwrap_or_else(|| {
            EndpointState::new(HeartBeatState::with_version(generation_now() + 60, 9999))
        });
        warn!("Assassinating {endpoint} via gossip");

        let mut tokens = Vec::new();
        if existing.is_some() {
            tokens = self.ring.tokens(&endpoint);
            if tokens.is_empty() {
                warn!("Unable to calculate tokens for {endpoint}. Will use a random one");
                return Err(GossipError::NoTokens(endpoint));
            }

            let generation = ep_state.heart_beat().generation();
            let heartbeat = ep_state.heart_beat().version();
            info!(
                "Sleeping for {} ms to ensure {endpoint} does not change",
                self.config.ring_delay.as_millis()
            );
            self.sleep_abortable(self.config.ring_delay).await;

            match self.shards.coordinator().get(&endpoint) {
                None => {
                    warn!("Endpoint {endpoint} disappeared while trying to assassinate, continuing anyway");
                }
                Some(new_state) => {
                    if new_state.heart_beat().generation() != generation {
                        return Err(GossipError::StillAlive {
                            endpoint,
                            what: "generation",
                        });
                    }
                    if new_state.heart_beat().version() != heartbeat {
                        return Err(GossipError::StillAlive {
                            endpoint,
                            what: "heartbeat",
                        });
                    }
                }
            }
            ep_state.update_timestamp_to_now(); // make sure we don't evict it too soon
            ep_state.heart_beat_mut().force_newer_generation_unsafe();
        }

        let expire_time = SystemTime::now() + A_VERY_LONG_TIME;
        ep_state.add_application_state(
            ApplicationState::Status,
            VersionedValue::left(&tokens, system_time_millis(expire_time)),
        );
        self.add_expire_time_for_endpoint(endpoint, expire_time);
        self.handle_major_state_change_locked(endpoint, ep_state)
            .await;
        self.sleep_abortable(self.config.interval * 4).await;
        warn!("Finished assassinating {endpoint}");
        Ok(())
    }

    /// Records when the endpoint's dead state may be evicted.
    pub fn add_expire_time_for_endpoint(&self, endpoint: SocketAddr, expire_time: SystemTime) {
        let now = SystemTime::now();
        let diff = expire_time
            .duration_since(now)
            .unwrap_or_default()
            .as_secs();
        info!(
            "Node {endpoint} will be removed from gossip at: (expire = {}, now = {}, diff = {diff} seconds)",
            system_time_millis(expire_time),
            system_time_millis(now)
        );
        self.expire_time.insert(endpoint, expire_time);
    }

    fn expire_time_for_endpoint(&self, endpoint: &SocketAddr) -> SystemTime {
        self.expire_time
            .get(endpoint)
            .map_or_else(|| SystemTime::now() + A_VERY_LONG_TIME, |entry| *entry)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn build_seeds_list(&self) {
        let mut seeds = self.seeds.write();
        for seed in &self.config.seeds {
            if *seed == self.local_addr {
                continue;
            }
            seeds.insert(*seed);
        }
    }

    /// Creates the local endpoint state if this is the first start.
    pub fn maybe_initialize_local_state(&self, generation: i32) {
        if self.shards.coordinator().contains(&self.local_addr) {
            return;
        }
        let mut local_state = EndpointState::new(HeartBeatState::new(generation));
        local_state.mark_alive();
        self.shards.coordinator().insert(self.local_addr, local_state);
    }

    /// Loads the persisted generation and derives the next one to boot with,
    /// persisting it back through the key/value hook.
    pub async fn bootstrap_generation(&self) -> Result<i32, GossipError> {
        let saved = self.feature_store.load_generation().await?;
        let now = generation_now();
        let generation = match saved {
            Some(previous) if previous >= now => previous + 1,
            _ => now,
        };
        self.feature_store.save_generation(generation).await?;
        Ok(generation)
    }

    /// Enables gossip: publishes the local state, arms the periodic round and
    /// starts the failure detector loop.
    pub async fn start_gossiping(
        self: &Arc<Self>,
        generation: i32,
        preload_local_states: Vec<(ApplicationState, VersionedValue)>,
        advertise: bool,
    ) -> Result<(), GossipError> {
        self.advertise_myself.store(advertise, Ordering::Release);
        self.build_seeds_list();

        let mut generation_nbr = generation;
        if self.config.force_gossip_generation > 0 {
            generation_nbr = self.config.force_gossip_generation;
            warn!("Use the generation number provided by user: generation = {generation_nbr}");
        }

        {
            let _permit = self.shards.lock_endpoint(self.local_addr).await;
            let mut local_state = self
                .shards
                .coordinator()
                .get(&self.local_addr)
                .unwrap_or_else(|| EndpointState::new(HeartBeatState::new(generation_nbr)));
            local_state
                .set_heart_beat_state_and_update_timestamp(HeartBeatState::new(generation_nbr));
            local_state.mark_alive();
            for (key, value) in preload_local_states {
                local_state.add_application_state(key, value);
            }
            self.shards
                .coordinator()
                .insert(self.local_addr, local_state.clone());
            self.shards.replicate_full(self.local_addr, &local_state);
        }

        trace!("gossip started with generation {generation_nbr}");
        self.enabled.store(true, Ordering::Release);
        self.nr_rounds.store(0, Ordering::Relaxed);
        self.gate.reopen();

        {
            let this = Arc::clone(self);
            *self.round_task.lock() = Some(tokio::spawn(async move {
                loop {
                    if !this.is_enabled() {
                        info!("Gossip loop is not scheduled because it is disabled");
                        break;
                    }
                    this.run_round().await;
                    if !this.sleep_abortable(this.config.interval).await {
                        break;
                    }
                }
            }));
        }
        {
            let this = Arc::clone(self);
            *self.fd_task.lock() = Some(tokio::spawn(async move {
                failure_detector::failure_detector_loop(this).await;
            }));
        }
        self.fd_pinger
            .update_generation_number(i64::from(generation_nbr));
        Ok(())
    }

    /// Bootstrap-time state harvest: queries every contact for a filtered
    /// state map and applies the replies without firing listeners. Falls back
    /// to empty-SYN probing for peers lacking the newer verb.
    pub async fn do_shadow_round(
        &self,
        mut nodes: BTreeSet<SocketAddr>,
    ) -> Result<(), GossipError> {
        nodes.remove(&self.local_addr);
        let wanted: BTreeSet<ApplicationState> = SHADOW_ROUND_WANTED.into_iter().collect();
        info!("Gossip shadow round started with nodes={nodes:?}");

        let mut nodes_talked: BTreeSet<SocketAddr> = BTreeSet::new();
        let start = Instant::now();
        let mut fall_back_to_syn = false;

        loop {
            let mut nodes_down = 0usize;
            let mut responses = Vec::new();
            for node in &nodes {
                debug!("Sent get_endpoint_states request to {node}");
                match self
                    .messaging
                    .send_get_endpoint_states(*node, wanted.clone(), SHADOW_ROUND_RPC_TIMEOUT)
                    .await
                {
                    Ok(states) => {
                        debug!("Got get_endpoint_states response from {node}");
                        responses.push(states);
                        nodes_talked.insert(*node);
                    }
                    Err(GossipError::UnknownVerb { .. }) => {
                        warn!("Node {node} does not support get_endpoint_states verb");
                        fall_back_to_syn = true;
                    }
                    Err(GossipError::Timeout { .. }) => {
                        warn!("The get_endpoint_states verb to node {node} was timeout");
                    }
                    Err(err) => {
                        nodes_down += 1;
                        warn!("Node {node} is down for get_endpoint_states verb: {err}");
                    }
                }
            }
            for states in responses {
                self.apply_state_locally_without_listener_notification(states)
                    .await?;
            }
            if !nodes_talked.is_empty() {
                break;
            }
            if !nodes.is_empty() && nodes_down == nodes.len() {
                warn!("All nodes={nodes:?} are down for get_endpoint_states verb. Skip ShadowRound.");
                break;
            }
            if fall_back_to_syn {
                break;
            }
            if start.elapsed() > self.config.shadow_round_timeout {
                return Err(GossipError::ShadowRoundFailed(
                    nodes.iter().copied().collect(),
                ));
            }
            if !self.sleep_abortable(SHADOW_ROUND_RETRY_INTERVAL).await {
                return Err(GossipError::Disabled);
            }
            info!(
                "Connect nodes={nodes:?} again ... ({} seconds passed)",
                start.elapsed().as_secs()
            );
        }

        if fall_back_to_syn {
            info!("Fallback to old method for ShadowRound");
            let fallback_start = Instant::now();
            self.goto_shadow_round();
            while self.is_in_shadow_round() {
                // A completely empty SYN asks the peer for everything it has.
                for node in &nodes {
                    let message = Syn {
                        cluster_name: self.config.cluster_name.clone(),
                        partitioner_name: self.config.partitioner_name.clone(),
                        digests: Vec::new(),
                    };
                    trace!("Sending a GossipDigestSyn (ShadowRound) to {node} ...");
                    self.spawn_send_syn(*node, message);
                }
                if !self.sleep_abortable(SHADOW_ROUND_RETRY_INTERVAL).await {
                    return Err(GossipError::Disabled);
                }
                if self.is_in_shadow_round() {
                    if fallback_start.elapsed() > self.config.shadow_round_timeout {
                        return Err(GossipError::ShadowRoundFailed(
                            nodes.iter().copied().collect(),
                        ));
                    }
                    info!(
                        "Connect nodes={nodes:?} again ... ({} seconds passed)",
                        fallback_start.elapsed().as_secs()
                    );
                }
            }
        }
        info!("Gossip shadow round finished with nodes_talked={nodes_talked:?}");
        Ok(())
    }

    /// Announces shutdown, pushes the shutdown verb to every live peer, then
    /// disables scheduling and drains the background machinery.
    pub async fn do_stop_gossiping(&self) {
        if !self.is_enabled() {
            info!("gossip is already stopped");
            return;
        }

        let my_state = self.shards.coordinator().get(&self.local_addr);
        if let Some(state) = &my_state {
            info!("My status = {}", state.status());
        }
        let announce = my_state
            .as_ref()
            .is_some_and(|state| !state.is_silent_shutdown_state());
        if announce {
            let local_generation = my_state
                .as_ref()
                .map_or(0, |state| state.heart_beat().generation());
            info!("Announcing shutdown");
            self.announce_shutdown().await;
            for endpoint in self.shards.coordinator().live_endpoints() {
                info!("Sending a GossipShutdown to {endpoint} with generation {local_generation}");
                match self
                    .messaging
                    .send_shutdown(endpoint, self.local_addr, Some(local_generation))
                    .await
                {
                    Ok(()) => trace!("Sent GossipShutdown to {endpoint}"),
                    Err(err) => warn!("Fail to send GossipShutdown to {endpoint}: {err}"),
                }
            }
            time::sleep(self.config.shutdown_announce).await;
        } else {
            warn!("No local state or state is in silent shutdown, not announcing shutdown");
        }

        info!("Disable and wait for gossip loop started");
        self.enabled.store(false, Ordering::Release);
        // Taking and releasing the round unit waits out any mid-flight round;
        // it must not be held while awaiting the round task below.
        let round_unit = self
            .round_running
            .acquire()
            .await
            .expect("round semaphore is never closed");
        drop(round_unit);
        let round_task = self.round_task.lock().take();
        if let Some(task) = round_task {
            let _ = task.await;
        }
        let fd_task = self.fd_task.lock().take();
        if let Some(task) = fd_task {
            let _ = task.await;
        }
        self.gate.close().await;
        info!("Gossip is now stopped");
    }

    async fn announce_shutdown(&self) {
        let _permit = self.shards.lock_endpoint(self.local_addr).await;
        let Some(mut state) = self.shards.coordinator().get(&self.local_addr) else {
            return;
        };
        // The shutdown notice must win over any concurrently gossiped value.
        let value = VersionedValue::with_version(format!("{},true", status::SHUTDOWN), i32::MAX);
        let before = state.clone();
        self.subscribers
            .notify_before_change(self.local_addr, &before, ApplicationState::Status, &value)
            .await;
        state.add_application_state(ApplicationState::Status, value.clone());
        state
            .heart_beat_mut()
            .force_highest_possible_version_unsafe();
        self.shards.coordinator().insert(self.local_addr, state.clone());
        self.shards.replicate_full(self.local_addr, &state);
        self.subscribers
            .notify_change(self.local_addr, ApplicationState::Status, &value)
            .await;
    }

    /// Full stop: graceful shutdown plus tearing down the receive loop.
    pub async fn stop(&self) {
        self.do_stop_gossiping().await;
        let _ = self.shutdown_tx.send(true);
        let recv_task = self.recv_task.lock().take();
        if let Some(task) = recv_task {
            let _ = task.await;
        }
    }

    // ------------------------------------------------------------------
    // Local state publication
    // ------------------------------------------------------------------

    /// Publishes one application state for the local node.
    pub async fn add_local_application_state(&self, key: ApplicationState, value: VersionedValue) {
        self.add_local_application_states(vec![(key, value)]).await;
    }

    /// Publishes a batch of application states for the local node. Versions
    /// are re-stamped after the before-change notifications so the externally
    /// visible set stays monotonic even if notifications suspend.
    pub async fn add_local_application_states(
        &self,
        states: Vec<(ApplicationState, VersionedValue)>,
    ) {
        if states.is_empty() {
            return;
        }
        let endpoint = self.local_addr;
        let _permit = self.shards.lock_endpoint(endpoint).await;
        let Some(before) = self.shards.coordinator().get(&endpoint) else {
            warn!(
                "Fail to apply application_state: endpoint_state_map does not contain endpoint = {endpoint}"
            );
            return;
        };

        for (key, value) in &states {
            self.subscribers
                .notify_before_change(endpoint, &before, *key, value)
                .await;
        }

        let Some(mut local_state) = self.shards.coordinator().get(&endpoint) else {
            return;
        };
        let mut stamped = Vec::with_capacity(states.len());
        for (key, value) in states {
            // Notifications may have suspended; raise the version so the
            // value cannot lose to anything received in the meantime.
            let value = value.clone_with_higher_version();
            local_state.add_application_state(key, value.clone());
            stamped.push((key, value));
        }
        self.shards.coordinator().insert(endpoint, local_state);

        for (key, value) in &stamped {
            self.shards.replicate_one(endpoint, *key, value);
            self.subscribers.notify_change(endpoint, *key, value).await;
        }
    }

    /// Seeds the state map from persisted peer info before gossip starts.
    pub async fn add_saved_endpoint(&self, endpoint: SocketAddr) {
        if endpoint == self.local_addr {
            debug!("Attempt to add self as saved endpoint");
            return;
        }
        let _permit = self.shards.lock_endpoint(endpoint).await;

        // Preserve any previously known, in-memory data about the endpoint.
        let mut ep_state = match self.shards.coordinator().get(&endpoint) {
            Some(mut existing) => {
                debug!("not replacing a previous ep_state for {endpoint}, but reusing it");
                existing.set_heart_beat_state_and_update_timestamp(HeartBeatState::new(0));
                existing
            }
            None => EndpointState::new(HeartBeatState::new(0)),
        };
        let tokens = self.ring.tokens(&endpoint);
        if !tokens.is_empty() {
            ep_state.add_application_state(ApplicationState::Tokens, VersionedValue::tokens(&tokens));
        }
        if let Some(host_id) = self.ring.host_id(&endpoint) {
            ep_state
                .add_application_state(ApplicationState::HostId, VersionedValue::host_id(&host_id));
        }
        ep_state.mark_dead();
        self.shards.coordinator().insert(endpoint, ep_state.clone());
        self.shards.replicate_full(endpoint, &ep_state);
        self.shards
            .coordinator()
            .insert_unreachable(endpoint, Instant::now());
        trace!(
            "Adding saved endpoint {endpoint} {}",
            ep_state.heart_beat().generation()
        );
    }

    /// Bumps the local generation for administrative state pushes.
    pub fn force_newer_generation(&self) {
        self.shards
            .coordinator()
            .with_state_mut(&self.local_addr, |state| {
                state.heart_beat_mut().force_newer_generation_unsafe();
            });
    }

    /// Clears every membership table; used when rejoining from scratch.
    pub fn reset_endpoint_state_map(&self) {
        let coordinator = self.shards.coordinator();
        for endpoint in coordinator.endpoints() {
            self.shards.evict(&endpoint);
        }
        coordinator.set_live(Vec::new());
        coordinator.set_unreachable_map(HashMap::new());
        self.shards.bump_live_version();
        self.shards.sync_liveness();
    }

    // ------------------------------------------------------------------
    // Views and checks
    // ------------------------------------------------------------------

    /// Whether the endpoint is alive in the local view. The local node is
    /// always alive.
    #[must_use]
    pub fn is_alive(&self, endpoint: &SocketAddr) -> bool {
        if *endpoint == self.local_addr {
            return true;
        }
        if let Some(state) = self.shards.coordinator().get(endpoint) {
            return state.is_alive();
        }
        warn!("unknown endpoint {endpoint}");
        false
    }

    /// Clone of the endpoint's state, if known.
    #[must_use]
    pub fn endpoint_state(&self, endpoint: &SocketAddr) -> Option<EndpointState> {
        self.shards.coordinator().get(endpoint)
    }

    /// Snapshot of every known endpoint state.
    #[must_use]
    pub fn endpoint_states(&self) -> EndpointStateMap {
        let coordinator = self.shards.coordinator();
        coordinator
            .endpoints()
            .into_iter()
            .filter_map(|endpoint| coordinator.get(&endpoint).map(|state| (endpoint, state)))
            .collect()
    }

    /// Live members including the local node (unless it announced shutdown).
    #[must_use]
    pub fn get_live_members(&self) -> BTreeSet<SocketAddr> {
        let mut members: BTreeSet<SocketAddr> = self
            .shards
            .coordinator()
            .live_endpoints()
            .into_iter()
            .collect();
        members.insert(self.local_addr);
        if self.is_shutdown(&self.local_addr) {
            members.remove(&self.local_addr);
        }
        members
    }

    /// Currently unreachable members.
    #[must_use]
    pub fn get_unreachable_members(&self) -> BTreeSet<SocketAddr> {
        self.shards
            .coordinator()
            .unreachable_endpoints()
            .into_keys()
            .collect()
    }

    /// Ring members that are alive.
    #[must_use]
    pub fn get_live_token_owners(&self) -> BTreeSet<SocketAddr> {
        self.ring
            .members()
            .into_iter()
            .filter(|endpoint| self.is_alive(endpoint))
            .collect()
    }

    /// Ring members that are not alive.
    #[must_use]
    pub fn get_unreachable_token_owners(&self) -> BTreeSet<SocketAddr> {
        self.ring
            .members()
            .into_iter()
            .filter(|endpoint| !self.is_alive(endpoint))
            .collect()
    }

    /// How long the endpoint has been unreachable, zero when it is not.
    #[must_use]
    pub fn get_endpoint_downtime(&self, endpoint: &SocketAddr) -> Duration {
        self.shards
            .coordinator()
            .unreachable_endpoints()
            .get(endpoint)
            .map_or(Duration::ZERO, |since| {
                Instant::now().saturating_duration_since(*since)
            })
    }

    /// Endpoints that are alive in the local view.
    #[must_use]
    pub fn get_up_endpoint_count(&self) -> usize {
        let coordinator = self.shards.coordinator();
        coordinator
            .endpoints()
            .iter()
            .filter(|endpoint| coordinator.is_alive(endpoint))
            .count()
    }

    /// Endpoints that are not alive in the local view.
    #[must_use]
    pub fn get_down_endpoint_count(&self) -> usize {
        self.shards.coordinator().len() - self.get_up_endpoint_count()
    }

    /// Status token gossiped by the endpoint.
    #[must_use]
    pub fn gossip_status(&self, endpoint: &SocketAddr) -> String {
        self.shards
            .coordinator()
            .get(endpoint)
            .map_or_else(|| status::UNKNOWN.to_string(), |state| state.status().to_string())
    }

    /// Raw value of one application state for the endpoint.
    #[must_use]
    pub fn get_application_state_value(
        &self,
        endpoint: &SocketAddr,
        key: ApplicationState,
    ) -> Option<String> {
        self.shards
            .coordinator()
            .get(endpoint)
            .and_then(|state| state.get(key).map(|value| value.value.clone()))
    }

    /// Host id gossiped by the endpoint.
    pub fn get_host_id(&self, endpoint: &SocketAddr) -> Result<String, GossipError> {
        self.get_application_state_value(endpoint, ApplicationState::HostId)
            .ok_or(GossipError::UnknownEndpoint(*endpoint))
    }

    /// Whether the endpoint announced a graceful shutdown.
    #[must_use]
    pub fn is_shutdown(&self, endpoint: &SocketAddr) -> bool {
        self.gossip_status(endpoint) == status::SHUTDOWN
    }

    /// Whether the endpoint gossips STATUS=NORMAL.
    #[must_use]
    pub fn is_normal(&self, endpoint: &SocketAddr) -> bool {
        self.gossip_status(endpoint) == status::NORMAL
    }

    /// Whether the endpoint gossips STATUS=LEFT.
    #[must_use]
    pub fn is_left(&self, endpoint: &SocketAddr) -> bool {
        self.gossip_status(endpoint) == status::LEFT
    }

    /// Normal ring member or one that is shutting down.
    #[must_use]
    pub fn is_normal_ring_member(&self, endpoint: &SocketAddr) -> bool {
        let current = self.gossip_status(endpoint);
        current == status::NORMAL || current == status::SHUTDOWN
    }

    /// A node may bootstrap only with no prior gossip state or a state that
    /// says it already left the cluster.
    #[must_use]
    pub fn is_safe_for_bootstrap(&self, endpoint: &SocketAddr) -> bool {
        let Some(state) = self.shards.coordinator().get(endpoint) else {
            debug!(
                "is_safe_for_bootstrap: node={endpoint}, status=no state in gossip, allowed_to_bootstrap=true"
            );
            return true;
        };
        let current = state.status().to_string();
        let allowed = current == status::LEFT || current == status::REMOVED;
        debug!("is_safe_for_bootstrap: node={endpoint}, status={current}, allowed_to_bootstrap={allowed}");
        allowed
    }

    /// Orders two peers by process start time.
    pub fn compare_endpoint_startup(
        &self,
        a: &SocketAddr,
        b: &SocketAddr,
    ) -> Result<i32, GossipError> {
        let state_a = self
            .shards
            .coordinator()
            .get(a)
            .ok_or(GossipError::UnknownEndpoint(*a))?;
        let state_b = self
            .shards
            .coordinator()
            .get(b)
            .ok_or(GossipError::UnknownEndpoint(*b))?;
        Ok(state_a.heart_beat().generation() - state_b.heart_beat().generation())
    }

    /// Current generation of the endpoint.
    pub fn get_current_generation_number(&self, endpoint: &SocketAddr) -> Result<i32, GossipError> {
        self.shards
            .coordinator()
            .get(endpoint)
            .map(|state| state.heart_beat().generation())
            .ok_or(GossipError::UnknownEndpoint(*endpoint))
    }

    /// Current heartbeat version of the endpoint.
    pub fn get_current_heart_beat_version(
        &self,
        endpoint: &SocketAddr,
    ) -> Result<i32, GossipError> {
        self.shards
            .coordinator()
            .get(endpoint)
            .map(|state| state.heart_beat().version())
            .ok_or(GossipError::UnknownEndpoint(*endpoint))
    }

    /// Generations for a set of nodes, failing when any is unknown.
    pub fn get_generation_for_nodes(
        &self,
        nodes: &[SocketAddr],
    ) -> Result<HashMap<SocketAddr, i32>, GossipError> {
        let mut generations = HashMap::with_capacity(nodes.len());
        for node in nodes {
            generations.insert(*node, self.get_current_generation_number(node)?);
        }
        Ok(generations)
    }

    /// Restricts echo replies to the given nodes at the given generations.
    pub fn advertise_to_nodes(&self, nodes: HashMap<SocketAddr, i64>) {
        *self.advertise_to.write() = nodes;
        self.advertise_myself.store(true, Ordering::Release);
    }

    /// Waits until every node is alive on every shard.
    pub async fn wait_alive(
        &self,
        nodes: &[SocketAddr],
        timeout: Duration,
    ) -> Result<(), GossipError> {
        let start = Instant::now();
        loop {
            let mut live_nodes = Vec::new();
            for node in nodes {
                let alive_on_all = (0..self.shards.count())
                    .all(|shard| self.shards.replica(shard).is_alive(node));
                if alive_on_all {
                    live_nodes.push(*node);
                }
            }
            debug!("Waited for marking node as up, nodes={nodes:?}, live_nodes={live_nodes:?}");
            if live_nodes.len() == nodes.len() {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(GossipError::AliveWaitTimeout {
                    nodes: nodes.to_vec(),
                    alive: live_nodes,
                });
            }
            if !self.sleep_abortable(Duration::from_millis(100)).await {
                return Err(GossipError::Disabled);
            }
        }
    }

    /// Startup diagnostic: fails when no configured seed was ever observed,
    /// directly or through an INTERNAL_IP alias.
    pub fn check_seen_seeds(&self) -> Result<(), GossipError> {
        let seeds = self.seeds.read();
        let coordinator = self.shards.coordinator();
        let seen = coordinator.endpoints().into_iter().any(|endpoint| {
            if seeds.contains(&endpoint) {
                return true;
            }
            coordinator
                .get(&endpoint)
                .and_then(|state| {
                    state
                        .get(ApplicationState::InternalIp)
                        .map(|value| value.value.parse::<SocketAddr>())
                })
                .and_then(Result::ok)
                .is_some_and(|internal| seeds.contains(&internal))
        });
        info!(
            "Known endpoints={:?}, current_seeds={:?}, seeds_from_config={:?}, seen_any_seed={seen}",
            coordinator.endpoints(),
            *seeds,
            self.config.seeds
        );
        if seen {
            Ok(())
        } else {
            self.dump_endpoint_state_map();
            Err(GossipError::SeedsUnreachable)
        }
    }

    /// Logs the full state map for diagnostics.
    pub fn dump_endpoint_state_map(&self) {
        info!("=== endpoint_state_map dump starts ===");
        let coordinator = self.shards.coordinator();
        for endpoint in coordinator.endpoints() {
            if let Some(state) = coordinator.get(&endpoint) {
                info!(
                    "endpoint={endpoint}, generation={}, heartbeat={}, status={}, alive={}",
                    state.heart_beat().generation(),
                    state.heart_beat().version(),
                    state.status(),
                    state.is_alive()
                );
            }
        }
        info!("=== endpoint_state_map dump ends ===");
    }

    // ------------------------------------------------------------------
    // Features
    // ------------------------------------------------------------------

    /// Features gossiped by the endpoint.
    #[must_use]
    pub fn get_supported_features_of(&self, endpoint: &SocketAddr) -> BTreeSet<String> {
        self.get_application_state_value(endpoint, ApplicationState::SupportedFeatures)
            .map_or_else(BTreeSet::new, |value| FeatureService::to_feature_set(&value))
    }

    /// Intersection of every known peer's features, merging live gossip with
    /// the persisted peer-features mapping.
    #[must_use]
    pub fn common_supported_features(
        &self,
        loaded_peer_features: &HashMap<SocketAddr, String>,
        ignore_local_node: bool,
    ) -> BTreeSet<String> {
        let mut features_map: HashMap<SocketAddr, BTreeSet<String>> = HashMap::new();
        for (endpoint, value) in loaded_peer_features {
            let features = FeatureService::to_feature_set(value);
            if features.is_empty() {
                warn!("Loaded empty features for peer node {endpoint}");
            } else {
                features_map.insert(*endpoint, features);
            }
        }

        for endpoint in self.shards.coordinator().endpoints() {
            let features = self.get_supported_features_of(&endpoint);
            if ignore_local_node && endpoint == self.local_addr {
                debug!("Ignore SUPPORTED_FEATURES of local node: features={features:?}");
                continue;
            }
            if features.is_empty() {
                if loaded_peer_features.contains_key(&endpoint) {
                    info!(
                        "Node {endpoint} does not contain SUPPORTED_FEATURES in gossip, using features saved in the peer table"
                    );
                } else {
                    warn!("Node {endpoint} does not contain SUPPORTED_FEATURES in gossip or the peer table");
                }
            } else {
                // Live info replaces whatever was persisted.
                features_map.insert(endpoint, features);
            }
        }

        if ignore_local_node {
            features_map.remove(&self.local_addr);
        }

        let mut common: Option<BTreeSet<String>> = None;
        for features in features_map.values() {
            common = Some(match common {
                None => features.clone(),
                Some(current) => current.intersection(features).cloned().collect(),
            });
        }
        let mut common = common.unwrap_or_default();
        common.remove("");
        common
    }

    /// Enables every cluster-common feature once gossip has settled.
    pub async fn maybe_enable_features(&self) -> Result<(), GossipError> {
        if !self.gossip_settled.load(Ordering::Acquire) {
            return Ok(());
        }
        let loaded_peer_features = self.feature_store.load_peer_features().await?;
        let features = self.common_supported_features(&loaded_peer_features, false);
        for name in &features {
            self.features.enable(name);
        }
        Ok(())
    }

    /// Refuses to join when the cluster uses features this node lacks.
    pub fn check_knows_remote_features(
        &self,
        loaded_peer_features: &HashMap<SocketAddr, String>,
    ) -> Result<(), GossipError> {
        let local_features = self.features.local_features();
        let common = self.common_supported_features(loaded_peer_features, true);
        if common.is_subset(local_features) {
            info!(
                "Feature check passed. Local node {} features = {local_features:?}, Remote common_features = {common:?}",
                self.local_addr
            );
            Ok(())
        } else {
            Err(GossipError::FeatureCheck {
                local: local_features.iter().cloned().collect(),
                common: common.into_iter().collect(),
            })
        }
    }

    /// Refuses to join when any peer gossips a different snitch name.
    pub fn check_snitch_name_matches(&self, local_snitch: &str) -> Result<(), GossipError> {
        let coordinator = self.shards.coordinator();
        for endpoint in coordinator.endpoints() {
            let Some(remote) =
                self.get_application_state_value(&endpoint, ApplicationState::SnitchName)
            else {
                continue;
            };
            if remote != local_snitch {
                return Err(GossipError::SnitchMismatch {
                    local: local_snitch.to_string(),
                    remote,
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Settling
    // ------------------------------------------------------------------

    async fn wait_for_gossip(&self, initial_delay: Duration, force_after: Option<i32>) {
        if force_after == Some(0) {
            warn!(
                "Skipped to wait for gossip to settle by user request since skip_wait_for_gossip_to_settle is set to zero. Do not use this in production!"
            );
            return;
        }

        let mut total_polls = 0i32;
        let mut num_okay = 0i32;
        let mut ep_size = self.shards.coordinator().len();
        let mut delay = initial_delay;

        self.sleep_abortable(GOSSIP_SETTLE_MIN_WAIT).await;
        while num_okay < GOSSIP_SETTLE_POLL_SUCCESSES_REQUIRED {
            if !self.sleep_abortable(delay).await {
                return;
            }
            delay = GOSSIP_SETTLE_POLL_INTERVAL;

            let current_size = self.shards.coordinator().len();
            total_polls += 1;
            if current_size == ep_size && self.msg_processing.load(Ordering::Relaxed) == 0 {
                debug!("Gossip looks settled");
                num_okay += 1;
            } else {
                info!("Gossip not settled after {total_polls} polls.");
                num_okay = 0;
            }
            ep_size = current_size;
            if let Some(force) = force_after {
                if force > 0 && total_polls > force {
                    warn!(
                        "Gossip not settled but startup forced by skip_wait_for_gossip_to_settle. Gossip total polls: {total_polls}"
                    );
                    break;
                }
            }
        }
        if total_polls > GOSSIP_SETTLE_POLL_SUCCESSES_REQUIRED {
            info!(
                "Gossip settled after {} extra polls; proceeding",
                total_polls - GOSSIP_SETTLE_POLL_SUCCESSES_REQUIRED
            );
        } else {
            info!("No gossip backlog; proceeding");
        }
    }

    /// Blocks until the membership view stops churning, then runs the first
    /// feature evaluation.
    pub async fn wait_for_gossip_to_settle(&self) -> Result<(), GossipError> {
        let force_after = self.config.skip_wait_for_gossip_to_settle;
        if force_after != 0 {
            let force_after = (force_after >= 0).then_some(force_after);
            self.wait_for_gossip(GOSSIP_SETTLE_MIN_WAIT, force_after).await;
        }
        if !self.gossip_settled.swap(true, Ordering::AcqRel) {
            self.maybe_enable_features().await?;
        }
        Ok(())
    }

    /// Settle wait used before range movements, based on the ring delay.
    pub async fn wait_for_range_setup(&self) {
        info!("Waiting for pending range setup...");
        let force_after = self.config.skip_wait_for_gossip_to_settle;
        let force_after = (force_after >= 0).then_some(force_after);
        self.wait_for_gossip(self.config.ring_delay, force_after).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::NullPeerFeatureStore;
    use crate::ring::EmptyTokenRing;
    use crate::subscribers::EndpointStateSubscriber;
    use async_trait::async_trait;

    async fn new_gossiper(config: GossipConfig) -> Arc<Gossiper> {
        let messaging = MessagingService::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind");
        Gossiper::new(
            config,
            messaging,
            2,
            Arc::new(EmptyTokenRing),
            Arc::new(NullPeerFeatureStore),
            BTreeSet::new(),
        )
        .expect("gossiper")
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn peer_state(generation: i32, heartbeat_version: i32) -> EndpointState {
        EndpointState::new(HeartBeatState::with_version(generation, heartbeat_version))
    }

    #[derive(Default)]
    struct EventRecorder {
        events: Mutex<Vec<(String, i32)>>,
    }

    impl EventRecorder {
        fn record(&self, event: &str, state_generation: i32) {
            self.events.lock().push((event.to_string(), state_generation));
        }

        fn events(&self) -> Vec<(String, i32)> {
            self.events.lock().clone()
        }

        fn count(&self, event: &str) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|(name, _)| name == event)
                .count()
        }
    }

    #[async_trait]
    impl EndpointStateSubscriber for EventRecorder {
        async fn on_join(
            &self,
            _endpoint: SocketAddr,
            state: EndpointState,
        ) -> Result<(), GossipError> {
            self.record("join", state.heart_beat().generation());
            Ok(())
        }

        async fn on_restart(
            &self,
            _endpoint: SocketAddr,
            old_state: EndpointState,
        ) -> Result<(), GossipError> {
            self.record("restart", old_state.heart_beat().generation());
            Ok(())
        }

        async fn on_dead(
            &self,
            _endpoint: SocketAddr,
            state: EndpointState,
        ) -> Result<(), GossipError> {
            self.record("dead", state.heart_beat().generation());
            Ok(())
        }

        async fn on_change(
            &self,
            _endpoint: SocketAddr,
            _key: ApplicationState,
            value: VersionedValue,
        ) -> Result<(), GossipError> {
            self.record("change", value.version);
            Ok(())
        }
    }

    #[tokio::test]
    async fn examine_gossiper_covers_all_generation_cases() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let peer = addr(1);
        let mut state = peer_state(5, 3);
        state.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version("NORMAL", 8),
        );
        gossiper.shards.coordinator().insert(peer, state);

        // Remote generation ahead: request everything.
        let mut requests = Vec::new();
        let mut deltas = EndpointStateMap::new();
        gossiper.examine_gossiper(
            &mut vec![GossipDigest::new(peer, 6, 2)],
            &mut requests,
            &mut deltas,
        );
        assert_eq!(requests, vec![GossipDigest::new(peer, 6, 0)]);
        assert!(deltas.is_empty());

        // Remote generation behind: send the full local state.
        let mut requests = Vec::new();
        let mut deltas = EndpointStateMap::new();
        gossiper.examine_gossiper(
            &mut vec![GossipDigest::new(peer, 4, 99)],
            &mut requests,
            &mut deltas,
        );
        assert!(requests.is_empty());
        assert_eq!(deltas.get(&peer).map(EndpointState::max_version), Some(8));

        // Equal generation, remote ahead: request the delta above our max.
        let mut requests = Vec::new();
        let mut deltas = EndpointStateMap::new();
        gossiper.examine_gossiper(
            &mut vec![GossipDigest::new(peer, 5, 10)],
            &mut requests,
            &mut deltas,
        );
        assert_eq!(requests, vec![GossipDigest::new(peer, 5, 8)]);
        assert!(deltas.is_empty());

        // Equal generation, remote behind: send the delta above theirs.
        let mut requests = Vec::new();
        let mut deltas = EndpointStateMap::new();
        gossiper.examine_gossiper(
            &mut vec![GossipDigest::new(peer, 5, 2)],
            &mut requests,
            &mut deltas,
        );
        assert!(requests.is_empty());
        let delta = deltas.get(&peer).expect("delta for peer");
        assert!(delta.get(ApplicationState::Status).is_some());

        // Identical digests: nothing to say.
        let mut requests = Vec::new();
        let mut deltas = EndpointStateMap::new();
        gossiper.examine_gossiper(
            &mut vec![GossipDigest::new(peer, 5, 8)],
            &mut requests,
            &mut deltas,
        );
        assert!(requests.is_empty());
        assert!(deltas.is_empty());

        // Unknown endpoint: request everything.
        let unknown = addr(9);
        let mut requests = Vec::new();
        let mut deltas = EndpointStateMap::new();
        gossiper.examine_gossiper(
            &mut vec![GossipDigest::new(unknown, 7, 1)],
            &mut requests,
            &mut deltas,
        );
        assert_eq!(requests, vec![GossipDigest::new(unknown, 7, 0)]);
    }

    #[tokio::test]
    async fn empty_syn_is_answered_with_everything() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        gossiper.shards.coordinator().insert(addr(1), peer_state(3, 1));
        gossiper.shards.coordinator().insert(addr(2), peer_state(4, 1));

        let mut digests = Vec::new();
        let mut requests = Vec::new();
        let mut deltas = EndpointStateMap::new();
        gossiper.examine_gossiper(&mut digests, &mut requests, &mut deltas);
        assert_eq!(deltas.len(), 2);
    }

    #[tokio::test]
    async fn digests_are_sorted_most_diverged_first() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let close = addr(1);
        let far = addr(2);
        gossiper.shards.coordinator().insert(close, peer_state(1, 10));
        gossiper.shards.coordinator().insert(far, peer_state(1, 10));

        let mut digests = vec![
            GossipDigest::new(close, 1, 9),
            GossipDigest::new(far, 1, 100),
        ];
        gossiper.sort_digests_by_divergence(&mut digests);
        assert_eq!(digests[0].endpoint, far);
        assert_eq!(digests[1].endpoint, close);
    }

    #[tokio::test]
    async fn quarantined_peer_is_not_applied() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let peer = addr(3);
        gossiper.quarantine_endpoint(peer);

        let mut map = EndpointStateMap::new();
        map.insert(peer, peer_state(5, 1));
        gossiper.apply_state_locally(map).await.expect("apply");
        assert!(!gossiper.shards.coordinator().contains(&peer));
    }

    #[tokio::test]
    async fn applying_the_same_delta_twice_is_idempotent() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let peer = addr(4);
        let mut remote = peer_state(7, 2);
        remote.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version("NORMAL", 5),
        );

        let mut map = EndpointStateMap::new();
        map.insert(peer, remote);
        gossiper.apply_state_locally(map.clone()).await.expect("first apply");
        let first = gossiper.shards.coordinator().get(&peer).expect("state");
        gossiper.apply_state_locally(map).await.expect("second apply");
        let second = gossiper.shards.coordinator().get(&peer).expect("state");

        assert_eq!(first.heart_beat(), second.heart_beat());
        assert_eq!(first.max_version(), second.max_version());
        assert_eq!(
            first.get(ApplicationState::Status),
            second.get(ApplicationState::Status)
        );
    }

    #[tokio::test]
    async fn stale_versions_never_regress_state() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let peer = addr(5);
        let mut newer = peer_state(7, 2);
        newer.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version("NORMAL", 9),
        );
        let mut map = EndpointStateMap::new();
        map.insert(peer, newer);
        gossiper.apply_state_locally(map).await.expect("apply newer");

        let mut stale = peer_state(7, 1);
        stale.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version("shutdown,true", 4),
        );
        let mut map = EndpointStateMap::new();
        map.insert(peer, stale);
        gossiper.apply_state_locally(map).await.expect("apply stale");

        let state = gossiper.shards.coordinator().get(&peer).expect("state");
        assert_eq!(state.status(), "NORMAL");
        assert_eq!(state.max_version(), 9);
    }

    #[tokio::test]
    async fn corrupt_generation_is_rejected() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let peer = addr(6);
        gossiper.shards.coordinator().insert(peer, peer_state(100, 1));

        let corrupt_generation =
            (i64::from(generation_now()) + MAX_GENERATION_DIFFERENCE + 10) as i32;
        let mut map = EndpointStateMap::new();
        map.insert(peer, peer_state(corrupt_generation, 1));
        gossiper.apply_state_locally(map).await.expect("apply");

        let state = gossiper.shards.coordinator().get(&peer).expect("state");
        assert_eq!(state.heart_beat().generation(), 100);
    }

    #[tokio::test]
    async fn restart_hands_old_state_to_on_restart() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let recorder = Arc::new(EventRecorder::default());
        gossiper.register(recorder.clone());
        let peer = addr(7);

        let mut map = EndpointStateMap::new();
        map.insert(peer, peer_state(10, 1));
        gossiper.apply_state_locally(map).await.expect("join");

        let mut map = EndpointStateMap::new();
        map.insert(peer, peer_state(11, 1));
        gossiper.apply_state_locally(map).await.expect("restart");

        let events = recorder.events();
        assert_eq!(
            events,
            vec![
                ("join".to_string(), 10),
                ("restart".to_string(), 10),
                ("join".to_string(), 11),
            ]
        );
        let state = gossiper.shards.coordinator().get(&peer).expect("state");
        assert_eq!(state.heart_beat().generation(), 11);
    }

    #[tokio::test]
    async fn dead_state_peers_are_marked_dead_not_alive() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let recorder = Arc::new(EventRecorder::default());
        gossiper.register(recorder.clone());
        let peer = addr(8);

        let mut left = peer_state(5, 1);
        left.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version("LEFT,t1,123", 2),
        );
        let mut map = EndpointStateMap::new();
        map.insert(peer, left);
        gossiper.apply_state_locally(map).await.expect("apply");

        assert_eq!(recorder.count("dead"), 1);
        assert!(!gossiper.is_alive(&peer));
        assert!(gossiper
            .shards
            .coordinator()
            .unreachable_endpoints()
            .contains_key(&peer));
        assert!(!gossiper.shards.coordinator().live_endpoints().contains(&peer));
        assert!(gossiper.pending_mark_alive.is_empty());
    }

    #[tokio::test]
    async fn convict_fires_on_dead_exactly_once() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let recorder = Arc::new(EventRecorder::default());
        gossiper.register(recorder.clone());
        let peer = addr(9);

        let mut state = peer_state(5, 1);
        state.mark_alive();
        gossiper.shards.coordinator().insert(peer, state);
        gossiper.shards.coordinator().push_live(peer);
        gossiper.shards.bump_live_version();

        gossiper.convict(peer).await;
        gossiper.convict(peer).await;

        assert_eq!(recorder.count("dead"), 1);
        assert!(!gossiper.is_alive(&peer));
        assert!(gossiper.get_unreachable_members().contains(&peer));
        assert!(!gossiper.shards.coordinator().live_endpoints().contains(&peer));
    }

    #[tokio::test]
    async fn shutdown_message_with_stale_generation_is_ignored() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        gossiper.enabled.store(true, Ordering::Release);
        let peer = addr(10);
        let mut state = peer_state(10, 1);
        state.mark_alive();
        gossiper.shards.coordinator().insert(peer, state);
        gossiper.shards.coordinator().push_live(peer);

        gossiper.handle_shutdown(peer, Some(9)).await.expect("stale shutdown");
        assert!(gossiper.is_alive(&peer));
        assert_ne!(gossiper.gossip_status(&peer), status::SHUTDOWN);

        gossiper.handle_shutdown(peer, Some(10)).await.expect("matching shutdown");
        assert!(!gossiper.is_alive(&peer));
        assert_eq!(gossiper.gossip_status(&peer), status::SHUTDOWN);
    }

    #[tokio::test]
    async fn get_endpoint_states_filters_to_wanted_keys() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let peer = addr(11);
        let mut state = peer_state(5, 1);
        state.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version("NORMAL", 2),
        );
        state.add_application_state(
            ApplicationState::Load,
            VersionedValue::with_version("0.7", 3),
        );
        gossiper.shards.coordinator().insert(peer, state);

        let wanted: BTreeSet<ApplicationState> = [ApplicationState::Status].into_iter().collect();
        let states = gossiper.handle_get_endpoint_states(&wanted);
        let filtered = states.get(&peer).expect("peer state");
        assert!(filtered.get(ApplicationState::Status).is_some());
        assert!(filtered.get(ApplicationState::Load).is_none());
    }

    #[tokio::test]
    async fn local_application_states_get_monotonic_versions() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let recorder = Arc::new(EventRecorder::default());
        gossiper.register(recorder.clone());
        gossiper.maybe_initialize_local_state(42);
        let local = gossiper.local_endpoint();

        gossiper
            .add_local_application_state(ApplicationState::Status, VersionedValue::normal())
            .await;
        gossiper
            .add_local_application_state(
                ApplicationState::Load,
                VersionedValue::with_version("0.2", 1),
            )
            .await;

        let state = gossiper.shards.coordinator().get(&local).expect("local state");
        let status_version = state.get(ApplicationState::Status).expect("status").version;
        let load_version = state.get(ApplicationState::Load).expect("load").version;
        assert!(load_version > status_version);

        // Replicas observe the same values.
        let replica = gossiper.shards.replica(1).get(&local).expect("replica state");
        assert_eq!(
            replica.get(ApplicationState::Load).map(|v| v.version),
            Some(load_version)
        );
        assert_eq!(recorder.count("change"), 2);
    }

    #[tokio::test]
    async fn echo_gating_respects_advertise_flags() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let peer = addr(12);
        assert!(gossiper.handle_echo(peer, None).is_ok());

        gossiper.advertise_myself.store(false, Ordering::Release);
        assert!(matches!(
            gossiper.handle_echo(peer, None),
            Err(GossipError::EchoRejected { .. })
        ));

        gossiper.shards.coordinator().insert(peer, peer_state(7, 1));
        let mut advertise_to = HashMap::new();
        advertise_to.insert(peer, 7i64);
        gossiper.advertise_to_nodes(advertise_to);
        assert!(gossiper.handle_echo(peer, Some(7)).is_ok());
        assert!(gossiper.handle_echo(peer, Some(8)).is_err());
        assert!(gossiper.handle_echo(addr(13), Some(7)).is_err());
    }

    #[tokio::test]
    async fn syn_coalescing_keeps_only_the_newest_stash() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        gossiper.enabled.store(true, Ordering::Release);
        let peer = addr(14);

        gossiper.syn_slots.insert(
            peer,
            PendingSlot {
                in_flight: true,
                queued: None,
            },
        );
        let syn = |marker: u16| Syn {
            cluster_name: String::new(),
            partitioner_name: String::new(),
            digests: vec![GossipDigest::new(addr(marker), 1, 1)],
        };

        gossiper.handle_syn(peer, syn(100)).await.expect("stash syn2");
        gossiper.handle_syn(peer, syn(101)).await.expect("stash syn3");

        let slot = gossiper.syn_slots.get(&peer).expect("slot");
        assert!(slot.in_flight);
        let stashed = slot.queued.as_ref().expect("stashed syn");
        assert_eq!(stashed.digests[0].endpoint, addr(101));
    }

    #[tokio::test]
    async fn status_check_spares_fresh_fat_clients_and_expires_dead_peers() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let fresh = addr(15);
        let mut state = peer_state(5, 1);
        state.mark_alive();
        gossiper.shards.coordinator().insert(fresh, state);

        // A recently heard-from gossip-only member survives the check.
        gossiper.do_status_check().await;
        assert!(gossiper.shards.coordinator().contains(&fresh));
        assert!(gossiper.is_gossip_only_member(&fresh));

        // A dead peer whose expiry has passed is evicted and quarantined.
        let expired = addr(16);
        let mut dead = peer_state(4, 1);
        dead.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version("LEFT,t,1", 2),
        );
        gossiper.shards.coordinator().insert(expired, dead);
        gossiper.add_expire_time_for_endpoint(expired, SystemTime::now() - Duration::from_secs(1));
        gossiper.do_status_check().await;
        assert!(!gossiper.shards.coordinator().contains(&expired));
        assert!(gossiper.just_removed.contains_key(&expired));
    }

    #[tokio::test]
    async fn settle_wait_is_skipped_when_configured_off() {
        let config = GossipConfig {
            skip_wait_for_gossip_to_settle: 0,
            ..GossipConfig::default()
        };
        let gossiper = new_gossiper(config).await;
        tokio::time::timeout(Duration::from_secs(1), gossiper.wait_for_gossip_to_settle())
            .await
            .expect("settle wait skipped")
            .expect("settle result");
        assert!(gossiper.gossip_settled.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn common_features_intersect_gossip_and_persisted_views() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let a = addr(16);
        let b = addr(17);

        let mut state_a = peer_state(1, 1);
        state_a.add_application_state(
            ApplicationState::SupportedFeatures,
            VersionedValue::with_version("lwt,cdc,mv", 2),
        );
        gossiper.shards.coordinator().insert(a, state_a);
        // b has nothing in gossip; only the persisted view knows it.
        let mut loaded = HashMap::new();
        loaded.insert(b, "lwt,cdc".to_string());

        let common = gossiper.common_supported_features(&loaded, false);
        assert_eq!(
            common,
            ["lwt", "cdc"].into_iter().map(String::from).collect()
        );
    }

    #[tokio::test]
    async fn bootstrap_is_allowed_only_for_gone_peers() {
        let gossiper = new_gossiper(GossipConfig::default()).await;
        let peer = addr(18);
        assert!(gossiper.is_safe_for_bootstrap(&peer));

        let mut state = peer_state(5, 1);
        state.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version("NORMAL", 2),
        );
        gossiper.shards.coordinator().insert(peer, state);
        assert!(!gossiper.is_safe_for_bootstrap(&peer));

        let mut left = peer_state(6, 1);
        left.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version("LEFT,t,9", 2),
        );
        gossiper.shards.coordinator().insert(peer, left);
        assert!(gossiper.is_safe_for_bootstrap(&peer));
    }
}
