use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Default retention for dead endpoint state before eviction (~3 days).
pub const A_VERY_LONG_TIME: Duration = Duration::from_secs(3 * 24 * 3600);

/// A remote generation further than this ahead of the local clock is corrupt
/// (one year of seconds).
pub const MAX_GENERATION_DIFFERENCE: i64 = 365 * 24 * 3600;

static NEXT_VERSION: AtomicI32 = AtomicI32::new(0);

/// Next value of the process-wide monotonic version counter.
///
/// Heartbeat versions and application-state versions are drawn from the same
/// counter, which defines the per-peer total order used by digest comparison.
pub fn next_version() -> i32 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed) + 1
}

/// Wall-clock seconds since the epoch, the generation of a freshly started node.
#[must_use]
pub fn generation_now() -> i32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    secs as i32
}

/// Closed set of application-state keys disseminated through gossip.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationState {
    /// Ring status of the peer (`NORMAL`, `shutdown`, `LEFT`, ...).
    Status,
    /// Token ownership advertised by the peer.
    Tokens,
    /// Stable host identifier.
    HostId,
    /// Whether the peer's client-facing RPC server is up.
    RpcReady,
    /// Storage load; high-frequency noise for settle purposes.
    Load,
    /// Materialized-view backlog; high-frequency noise for settle purposes.
    ViewBacklog,
    /// Cache hit rates; high-frequency noise for settle purposes.
    CacheHitrates,
    /// Comma-separated feature names the peer supports.
    SupportedFeatures,
    /// Alternate address a seed may be known by.
    InternalIp,
    /// Snitch implementation name; must match across the cluster.
    SnitchName,
    /// Messaging protocol version.
    NetVersion,
    /// Host id of the node coordinating this peer's removal.
    RemovalCoordinator,
    /// Datacenter label.
    Dc,
    /// Rack label.
    Rack,
}

/// Status tokens carried as the first comma-separated field of [`ApplicationState::Status`].
pub mod status {
    /// Regular ring member.
    pub const NORMAL: &str = "NORMAL";
    /// Peer announced a graceful shutdown.
    pub const SHUTDOWN: &str = "shutdown";
    /// Peer left the ring.
    pub const LEFT: &str = "LEFT";
    /// Peer's tokens are being removed by a coordinator.
    pub const REMOVING: &str = "removing";
    /// Peer's tokens were removed by a coordinator.
    pub const REMOVED: &str = "removed";
    /// No status gossiped yet.
    pub const UNKNOWN: &str = "";
}

/// Statuses that may never transition back to alive.
pub const DEAD_STATES: [&str; 3] = [status::LEFT, status::REMOVED, status::REMOVING];

/// Statuses for which a stopping node skips the shutdown announcement.
pub const SILENT_SHUTDOWN_STATES: [&str; 4] = [
    status::LEFT,
    status::REMOVED,
    status::REMOVING,
    status::SHUTDOWN,
];

/// First comma-separated field of a STATUS value.
#[must_use]
pub fn status_token(value: &str) -> &str {
    match value.find(',') {
        Some(pos) => &value[..pos],
        None => value,
    }
}

/// A string value paired with the monotonic version that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Opaque payload; STATUS values use the `token,detail` format.
    pub value: String,
    /// Version drawn from the owner's monotonic counter.
    pub version: i32,
}

impl VersionedValue {
    /// Wraps a value with the next local version.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            version: next_version(),
        }
    }

    /// Wraps a value received over the wire with its original version.
    pub fn with_version(value: impl Into<String>, version: i32) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }

    /// Re-stamps the value with a fresh version so it wins over anything
    /// produced before the clone.
    #[must_use]
    pub fn clone_with_higher_version(&self) -> Self {
        Self {
            value: self.value.clone(),
            version: next_version(),
        }
    }

    /// STATUS value for a regular ring member.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(status::NORMAL)
    }

    /// STATUS value announcing a graceful shutdown.
    #[must_use]
    pub fn shutdown() -> Self {
        Self::new(format!("{},true", status::SHUTDOWN))
    }

    /// STATUS value for a peer that left the ring, with its tokens and the
    /// wall-clock expiry (milliseconds since the epoch) of the tombstone.
    #[must_use]
    pub fn left(tokens: &[String], expiry_ms: i64) -> Self {
        Self::new(format!("{},{},{expiry_ms}", status::LEFT, tokens.join(";")))
    }

    /// STATUS value advertising an in-progress coordinated removal.
    #[must_use]
    pub fn removing_nonlocal(host_id: &str) -> Self {
        Self::new(format!("{},{host_id}", status::REMOVING))
    }

    /// STATUS value advertising a completed coordinated removal.
    #[must_use]
    pub fn removed_nonlocal(host_id: &str, expiry_ms: i64) -> Self {
        Self::new(format!("{},{host_id},{expiry_ms}", status::REMOVED))
    }

    /// Identifies the node coordinating a removal.
    #[must_use]
    pub fn removal_coordinator(host_id: &str) -> Self {
        Self::new(format!("REMOVER,{host_id}"))
    }

    /// HOST_ID value.
    #[must_use]
    pub fn host_id(id: &str) -> Self {
        Self::new(id)
    }

    /// TOKENS value.
    #[must_use]
    pub fn tokens(tokens: &[String]) -> Self {
        Self::new(tokens.join(";"))
    }

    /// SUPPORTED_FEATURES value.
    #[must_use]
    pub fn supported_features(features: &[String]) -> Self {
        Self::new(features.join(","))
    }

    /// RPC_READY value.
    #[must_use]
    pub fn rpc_ready(ready: bool) -> Self {
        Self::new(if ready { "true" } else { "false" })
    }

    /// Wall-clock expiry parsed from a `LEFT`/`removed` STATUS value, if any.
    #[must_use]
    pub fn expiry_from_status(value: &str) -> Option<SystemTime> {
        let millis: i64 = value.rsplit(',').next()?.parse().ok()?;
        u64::try_from(millis)
            .ok()
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
    }
}

/// Generation plus in-generation heartbeat version of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeatState {
    generation: i32,
    version: i32,
}

impl HeartBeatState {
    /// Fresh heartbeat for the given process incarnation.
    #[must_use]
    pub const fn new(generation: i32) -> Self {
        Self {
            generation,
            version: 0,
        }
    }

    /// Heartbeat with an explicit version, as received over the wire.
    #[must_use]
    pub const fn with_version(generation: i32, version: i32) -> Self {
        Self {
            generation,
            version,
        }
    }

    /// Process incarnation of the peer.
    #[must_use]
    pub const fn generation(&self) -> i32 {
        self.generation
    }

    /// In-generation heartbeat version.
    #[must_use]
    pub const fn version(&self) -> i32 {
        self.version
    }

    /// Bumps the heartbeat version; called exactly once per gossip round.
    pub fn update_heart_beat(&mut self) {
        self.version = next_version();
    }

    /// Bumps the generation for administrative state pushes.
    pub fn force_newer_generation_unsafe(&mut self) {
        self.generation = generation_now().max(self.generation + 1);
    }

    /// Sets the version to the maximum so the carrying state wins everywhere.
    pub fn force_highest_possible_version_unsafe(&mut self) {
        self.version = i32::MAX;
    }
}

fn instant_now() -> Instant {
    Instant::now()
}

/// Complete versioned view of one peer: heartbeat, application states, the
/// locally computed liveness bit and the monotonic timestamp of the last
/// observed advance.
///
/// Only the heartbeat and the application-state map travel over the wire; the
/// liveness bit and timestamp are recomputed by each observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointState {
    heart_beat: HeartBeatState,
    applications: BTreeMap<ApplicationState, VersionedValue>,
    #[serde(skip)]
    alive: bool,
    #[serde(skip, default = "instant_now")]
    update_ts: Instant,
}

impl EndpointState {
    /// State holding only a heartbeat.
    #[must_use]
    pub fn new(heart_beat: HeartBeatState) -> Self {
        Self {
            heart_beat,
            applications: BTreeMap::new(),
            alive: false,
            update_ts: Instant::now(),
        }
    }

    /// The peer's heartbeat.
    #[must_use]
    pub const fn heart_beat(&self) -> &HeartBeatState {
        &self.heart_beat
    }

    /// Mutable access to the heartbeat.
    pub fn heart_beat_mut(&mut self) -> &mut HeartBeatState {
        &mut self.heart_beat
    }

    /// Replaces the heartbeat and refreshes the update timestamp.
    pub fn set_heart_beat_state_and_update_timestamp(&mut self, heart_beat: HeartBeatState) {
        self.heart_beat = heart_beat;
        self.update_timestamp();
    }

    /// The application-state map.
    #[must_use]
    pub const fn applications(&self) -> &BTreeMap<ApplicationState, VersionedValue> {
        &self.applications
    }

    /// Looks up one application state.
    #[must_use]
    pub fn get(&self, key: ApplicationState) -> Option<&VersionedValue> {
        self.applications.get(&key)
    }

    /// Inserts or overwrites one application state.
    pub fn add_application_state(&mut self, key: ApplicationState, value: VersionedValue) {
        self.applications.insert(key, value);
    }

    /// Maximum of the heartbeat version and every application-state version.
    #[must_use]
    pub fn max_version(&self) -> i32 {
        self.applications
            .values()
            .map(|value| value.version)
            .fold(self.heart_beat.version(), i32::max)
    }

    /// Locally computed liveness.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.alive
    }

    /// Marks the peer alive.
    pub fn mark_alive(&mut self) {
        self.alive = true;
    }

    /// Marks the peer dead.
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    /// Monotonic instant of the last observed state advance.
    #[must_use]
    pub const fn update_timestamp(&self) -> Instant {
        self.update_ts
    }

    /// Refreshes the update timestamp to now.
    pub fn update_timestamp_to_now(&mut self) {
        self.update_ts = Instant::now();
    }

    /// Status token gossiped by the peer, or empty when none.
    #[must_use]
    pub fn status(&self) -> &str {
        self.get(ApplicationState::Status)
            .map_or(status::UNKNOWN, |value| status_token(&value.value))
    }

    /// Whether the status forbids ever marking the peer alive again.
    #[must_use]
    pub fn is_dead_state(&self) -> bool {
        DEAD_STATES.contains(&self.status())
    }

    /// Whether a stopping node with this state skips the shutdown announcement.
    #[must_use]
    pub fn is_silent_shutdown_state(&self) -> bool {
        SILENT_SHUTDOWN_STATES.contains(&self.status())
    }

    /// The slice of this state strictly above `floor`, or `None` when nothing
    /// qualifies.
    ///
    /// The heartbeat is included only when newer than the floor; when only
    /// application states qualify the (possibly stale) heartbeat is attached
    /// anyway and discarded as redundant by the receiver.
    #[must_use]
    pub fn state_delta_above(&self, floor: i32) -> Option<Self> {
        let mut delta = if self.heart_beat.version() > floor {
            Some(Self::new(self.heart_beat))
        } else {
            None
        };
        for (key, value) in &self.applications {
            if value.version > floor {
                delta
                    .get_or_insert_with(|| Self::new(self.heart_beat))
                    .add_application_state(*key, value.clone());
            }
        }
        delta
    }
}
