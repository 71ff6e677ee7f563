//! Multi-node gossip scenarios over loopback UDP.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keelson_gossip::{
    generation_now, status, Ack, Ack2, ApplicationState, EmptyTokenRing, EndpointState,
    EndpointStateMap, EndpointStateSubscriber, GossipConfig, GossipDigest, GossipError,
    GossipMessage, GossipTransport, Gossiper, HeartBeatState, MessagingService,
    NullPeerFeatureStore, Syn, VersionedValue,
};

const CLUSTER: &str = "itest";

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

async fn spawn_node(seeds: Vec<SocketAddr>) -> Arc<Gossiper> {
    let config = GossipConfig {
        cluster_name: CLUSTER.to_string(),
        seeds,
        interval: Duration::from_millis(50),
        shutdown_announce: Duration::from_millis(100),
        failure_detector_timeout: Duration::from_millis(300),
        ..GossipConfig::default()
    };
    let messaging = MessagingService::bind(loopback()).await.expect("bind node");
    let gossiper = Gossiper::new(
        config,
        messaging,
        2,
        Arc::new(EmptyTokenRing),
        Arc::new(NullPeerFeatureStore),
        BTreeSet::new(),
    )
    .expect("gossiper");
    gossiper.start();
    gossiper
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[derive(Default)]
struct MembershipRecorder {
    dead: Mutex<Vec<SocketAddr>>,
    joined: Mutex<Vec<SocketAddr>>,
}

impl MembershipRecorder {
    fn dead_count(&self, endpoint: &SocketAddr) -> usize {
        self.dead
            .lock()
            .expect("dead lock")
            .iter()
            .filter(|seen| *seen == endpoint)
            .count()
    }

    fn joined_count(&self) -> usize {
        self.joined.lock().expect("joined lock").len()
    }
}

#[async_trait]
impl EndpointStateSubscriber for MembershipRecorder {
    async fn on_join(
        &self,
        endpoint: SocketAddr,
        _state: EndpointState,
    ) -> Result<(), GossipError> {
        self.joined.lock().expect("joined lock").push(endpoint);
        Ok(())
    }

    async fn on_dead(
        &self,
        endpoint: SocketAddr,
        _state: EndpointState,
    ) -> Result<(), GossipError> {
        self.dead.lock().expect("dead lock").push(endpoint);
        Ok(())
    }
}

fn normal_status() -> Vec<(ApplicationState, VersionedValue)> {
    vec![(ApplicationState::Status, VersionedValue::normal())]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_converge_and_observe_graceful_shutdown() {
    let a = spawn_node(Vec::new()).await;
    let a_addr = a.local_endpoint();
    let recorder = Arc::new(MembershipRecorder::default());
    a.register(recorder.clone());
    a.start_gossiping(generation_now(), normal_status(), true)
        .await
        .expect("start a");

    let b = spawn_node(vec![a_addr]).await;
    let b_addr = b.local_endpoint();
    b.start_gossiping(generation_now(), normal_status(), true)
        .await
        .expect("start b");
    let c = spawn_node(vec![a_addr]).await;
    let c_addr = c.local_endpoint();
    c.start_gossiping(generation_now(), normal_status(), true)
        .await
        .expect("start c");

    let converged = wait_until(Duration::from_secs(30), || {
        a.is_alive(&b_addr)
            && a.is_alive(&c_addr)
            && b.is_alive(&a_addr)
            && b.is_alive(&c_addr)
            && c.is_alive(&a_addr)
            && c.is_alive(&b_addr)
            && a.gossip_status(&b_addr) == status::NORMAL
            && b.gossip_status(&c_addr) == status::NORMAL
            && c.gossip_status(&a_addr) == status::NORMAL
    })
    .await;
    assert!(converged, "cluster did not converge");

    assert_eq!(
        a.get_live_members(),
        [a_addr, b_addr, c_addr].into_iter().collect()
    );
    assert!(a.get_unreachable_members().is_empty());

    // Replicas carry the liveness view too.
    let replica_live = wait_until(Duration::from_secs(5), || {
        let live = a.shards().replica(1).live_endpoints();
        live.contains(&b_addr) && live.contains(&c_addr)
    })
    .await;
    assert!(replica_live, "replica live set did not sync");

    c.stop().await;

    let observed = wait_until(Duration::from_secs(15), || {
        !a.is_alive(&c_addr) && a.gossip_status(&c_addr) == status::SHUTDOWN
    })
    .await;
    assert!(observed, "a did not observe c's shutdown");
    assert_eq!(recorder.dead_count(&c_addr), 1);
    assert!(a.get_unreachable_members().contains(&c_addr));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_advertising_node_is_never_marked_up() {
    let a = spawn_node(Vec::new()).await;
    let a_addr = a.local_endpoint();
    a.start_gossiping(generation_now(), normal_status(), true)
        .await
        .expect("start a");

    let b = spawn_node(vec![a_addr]).await;
    let b_addr = b.local_endpoint();
    b.start_gossiping(generation_now(), normal_status(), false)
        .await
        .expect("start b");

    // a learns b's state through b's SYN/ACK2 exchange.
    let learned =
        wait_until(Duration::from_secs(15), || a.endpoint_state(&b_addr).is_some()).await;
    assert!(learned, "b's state did not propagate");

    // b rejects every echo, so the mark-alive handshake never promotes it.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!a.is_alive(&b_addr));
    assert!(!a.shards().coordinator().live_endpoints().contains(&b_addr));

    a.stop().await;
    b.stop().await;
}

fn fake_peer_state(generation: i32) -> EndpointState {
    let mut state = EndpointState::new(HeartBeatState::with_version(generation, 1));
    state.add_application_state(
        ApplicationState::Status,
        VersionedValue::with_version(status::NORMAL, 2),
    );
    state
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_detector_convicts_a_peer_that_stops_answering() {
    let a = spawn_node(Vec::new()).await;
    let a_addr = a.local_endpoint();
    let recorder = Arc::new(MembershipRecorder::default());
    a.register(recorder.clone());
    a.start_gossiping(generation_now(), normal_status(), true)
        .await
        .expect("start a");

    // A scripted peer that speaks just enough of the protocol to be marked
    // alive, then goes silent.
    let fake = Arc::new(GossipTransport::bind(loopback()).await.expect("bind fake"));
    let fake_addr = fake.local_addr().expect("fake addr");
    let fake_generation = generation_now();
    let responsive = Arc::new(AtomicBool::new(true));
    {
        let fake = Arc::clone(&fake);
        let responsive = Arc::clone(&responsive);
        tokio::spawn(async move {
            let own_state = fake_peer_state(fake_generation);
            loop {
                let Ok((message, from)) = fake.recv().await else {
                    break;
                };
                if !responsive.load(Ordering::Acquire) {
                    continue;
                }
                let mut states = EndpointStateMap::new();
                states.insert(fake_addr, own_state.clone());
                match message {
                    GossipMessage::Echo { request_id, .. } => {
                        let _ = fake
                            .send(&GossipMessage::EchoReply { request_id, ok: true }, from)
                            .await;
                    }
                    GossipMessage::Ack(_) => {
                        let _ = fake.send(&GossipMessage::Ack2(Ack2 { states }), from).await;
                    }
                    GossipMessage::Syn(_) => {
                        let _ = fake
                            .send(
                                &GossipMessage::Ack(Ack {
                                    digests: Vec::new(),
                                    states,
                                }),
                                from,
                            )
                            .await;
                    }
                    _ => {}
                }
            }
        });
    }
    // Introduce the fake peer by gossiping its digest at the real node until
    // the mark-alive handshake lands.
    {
        let fake = Arc::clone(&fake);
        let responsive = Arc::clone(&responsive);
        tokio::spawn(async move {
            while responsive.load(Ordering::Acquire) {
                let syn = Syn {
                    cluster_name: CLUSTER.to_string(),
                    partitioner_name: String::new(),
                    digests: vec![GossipDigest::new(fake_addr, fake_generation, 2)],
                };
                let _ = fake.send(&GossipMessage::Syn(syn), a_addr).await;
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        });
    }

    let introduced = wait_until(Duration::from_secs(15), || a.is_alive(&fake_addr)).await;
    assert!(introduced, "fake peer was never marked alive");

    responsive.store(false, Ordering::Release);
    let convicted = wait_until(Duration::from_secs(20), || !a.is_alive(&fake_addr)).await;
    assert!(convicted, "silent peer was not convicted");
    assert_eq!(recorder.dead_count(&fake_addr), 1);
    assert!(a.get_unreachable_members().contains(&fake_addr));

    a.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shadow_round_harvests_state_without_firing_listeners() {
    let a = spawn_node(Vec::new()).await;
    let a_addr = a.local_endpoint();
    a.start_gossiping(
        generation_now(),
        vec![
            (ApplicationState::Status, VersionedValue::normal()),
            (
                ApplicationState::Load,
                VersionedValue::with_version("0.4", 1),
            ),
        ],
        true,
    )
    .await
    .expect("start a");

    let newcomer = spawn_node(vec![a_addr]).await;
    let recorder = Arc::new(MembershipRecorder::default());
    newcomer.register(recorder.clone());

    newcomer
        .do_shadow_round([a_addr].into_iter().collect())
        .await
        .expect("shadow round");

    let harvested = newcomer.endpoint_state(&a_addr).expect("a's state");
    assert!(harvested.get(ApplicationState::Status).is_some());
    // LOAD is not among the keys the shadow round asks for.
    assert!(harvested.get(ApplicationState::Load).is_none());
    assert!(!newcomer.is_alive(&a_addr));
    assert_eq!(recorder.joined_count(), 0);

    a.stop().await;
    newcomer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shadow_round_falls_back_to_empty_syn_for_legacy_peers() {
    // A legacy peer: no get_endpoint_states verb, but answers an empty SYN
    // with everything it knows.
    let legacy = GossipTransport::bind(loopback()).await.expect("bind legacy");
    let legacy_addr = legacy.local_addr().expect("legacy addr");
    let legacy_generation = generation_now();
    tokio::spawn(async move {
        let own_state = fake_peer_state(legacy_generation);
        loop {
            let Ok((message, from)) = legacy.recv().await else {
                break;
            };
            match message {
                GossipMessage::GetEndpointStates { request_id, .. } => {
                    let _ = legacy
                        .send(&GossipMessage::Unsupported { request_id }, from)
                        .await;
                }
                GossipMessage::Syn(Syn { digests, .. }) if digests.is_empty() => {
                    let mut states = EndpointStateMap::new();
                    states.insert(legacy_addr, own_state.clone());
                    let _ = legacy
                        .send(
                            &GossipMessage::Ack(Ack {
                                digests: vec![GossipDigest::new(legacy_addr, legacy_generation, 0)],
                                states,
                            }),
                            from,
                        )
                        .await;
                }
                _ => {}
            }
        }
    });

    let newcomer = spawn_node(vec![legacy_addr]).await;
    newcomer
        .do_shadow_round([legacy_addr].into_iter().collect())
        .await
        .expect("fallback shadow round");

    let harvested = newcomer.endpoint_state(&legacy_addr).expect("legacy state");
    assert_eq!(harvested.heart_beat().generation(), legacy_generation);
    assert!(!newcomer.is_in_shadow_round());

    newcomer.stop().await;
}
