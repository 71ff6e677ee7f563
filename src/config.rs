use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Gossip tuning knobs loaded from node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Cluster identity checked against every incoming SYN; mismatched peers are ignored.
    pub cluster_name: String,
    /// Partitioner identity checked against incoming SYNs; empty disables the check.
    pub partitioner_name: String,
    /// Initial contact addresses, never emptied at runtime.
    pub seeds: Vec<SocketAddr>,
    /// Period of the anti-entropy round.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Basis for the quarantine delay and the "make sure it did not change" waits.
    #[serde(with = "humantime_serde")]
    pub ring_delay: Duration,
    /// Grace period granted to a peer on top of the echo interval before conviction.
    #[serde(with = "humantime_serde")]
    pub failure_detector_timeout: Duration,
    /// Hard cap for shadow-round convergence.
    #[serde(with = "humantime_serde")]
    pub shadow_round_timeout: Duration,
    /// Sleep after announcing shutdown, before gossip is disabled.
    #[serde(with = "humantime_serde")]
    pub shutdown_announce: Duration,
    /// `0` bypasses the settle wait, positive caps the poll count, negative means default.
    pub skip_wait_for_gossip_to_settle: i32,
    /// If positive, overrides the startup generation (operational recovery).
    pub force_gossip_generation: i32,
    /// When off, echo requests from peers are rejected.
    pub advertise_myself: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            partitioner_name: String::new(),
            seeds: Vec::new(),
            interval: Duration::from_millis(1000),
            ring_delay: Duration::from_secs(30),
            failure_detector_timeout: Duration::from_secs(20),
            shadow_round_timeout: Duration::from_secs(300),
            shutdown_announce: Duration::from_secs(2),
            skip_wait_for_gossip_to_settle: -1,
            force_gossip_generation: 0,
            advertise_myself: true,
        }
    }
}

impl GossipConfig {
    /// Window during which an evicted peer may not re-enter the state map.
    #[must_use]
    pub fn quarantine_delay(&self) -> Duration {
        self.ring_delay.max(Duration::from_millis(30_000)) * 2
    }

    /// Silence timeout after which a gossip-only member is dropped.
    ///
    /// Half of the quarantine delay, so the quarantine has enough leeway to
    /// prevent re-gossip of the removed peer.
    #[must_use]
    pub fn fat_client_timeout(&self) -> Duration {
        self.quarantine_delay() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarantine_is_twice_ring_delay_with_floor() {
        let mut config = GossipConfig {
            ring_delay: Duration::from_secs(45),
            ..GossipConfig::default()
        };
        assert_eq!(config.quarantine_delay(), Duration::from_secs(90));

        config.ring_delay = Duration::from_secs(5);
        assert_eq!(config.quarantine_delay(), Duration::from_secs(60));
        assert_eq!(config.fat_client_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn defaults_carry_documented_constants() {
        let config = GossipConfig::default();
        assert_eq!(config.interval, Duration::from_millis(1000));
        assert_eq!(config.skip_wait_for_gossip_to_settle, -1);
        assert!(config.advertise_myself);
    }
}
