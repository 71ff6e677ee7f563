//! RPC surface: verb sends, reply correlation and background-task supervision.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time;
use tracing::trace;

use crate::error::GossipError;
use crate::messages::{Ack, Ack2, EndpointStateMap, GossipMessage, Syn};
use crate::state::ApplicationState;
use crate::transport::GossipTransport;

/// Tracks fire-and-forget background tasks so shutdown can drain them.
pub(crate) struct Gate {
    inner: Mutex<GateState>,
    drained: Notify,
}

struct GateState {
    open: bool,
    active: usize,
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(GateState {
                open: true,
                active: 0,
            }),
            drained: Notify::new(),
        })
    }

    /// Enters the gate; returns `None` once the gate has been closed.
    pub(crate) fn enter(self: &Arc<Self>) -> Option<GateGuard> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return None;
        }
        inner.active += 1;
        Some(GateGuard {
            gate: Arc::clone(self),
        })
    }

    /// Closes the gate and waits until every admitted task has finished.
    pub(crate) async fn close(&self) {
        self.inner.lock().open = false;
        loop {
            let drained = self.drained.notified();
            if self.inner.lock().active == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Reopens a previously closed gate.
    pub(crate) fn reopen(&self) {
        self.inner.lock().open = true;
    }
}

/// Releases the gate slot on drop, panics included.
pub(crate) struct GateGuard {
    gate: Arc<Gate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut inner = self.gate.inner.lock();
        inner.active -= 1;
        if inner.active == 0 {
            self.gate.drained.notify_waiters();
        }
    }
}

/// Sends the six gossip verbs and correlates request/reply pairs.
///
/// SYN/ACK/ACK2/SHUTDOWN are one-way; ECHO and GET_ENDPOINT_STATES register a
/// pending slot that the receive loop completes when the matching reply
/// arrives.
pub struct MessagingService {
    transport: GossipTransport,
    pending_echo: DashMap<u64, oneshot::Sender<bool>>,
    pending_states: DashMap<u64, oneshot::Sender<Result<EndpointStateMap, GossipError>>>,
    next_request_id: AtomicU64,
}

impl MessagingService {
    /// Binds the gossip socket.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, GossipError> {
        Ok(Self {
            transport: GossipTransport::bind(bind_addr).await?,
            pending_echo: DashMap::new(),
            pending_states: DashMap::new(),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Address of the local gossip socket.
    pub fn local_addr(&self) -> Result<SocketAddr, GossipError> {
        self.transport.local_addr()
    }

    /// Receives the next raw message.
    pub(crate) async fn recv(&self) -> Result<(GossipMessage, SocketAddr), GossipError> {
        self.transport.recv().await
    }

    pub(crate) async fn send_syn(&self, peer: SocketAddr, syn: Syn) -> Result<(), GossipError> {
        self.transport.send(&GossipMessage::Syn(syn), peer).await
    }

    pub(crate) async fn send_ack(&self, peer: SocketAddr, ack: Ack) -> Result<(), GossipError> {
        self.transport.send(&GossipMessage::Ack(ack), peer).await
    }

    pub(crate) async fn send_ack2(&self, peer: SocketAddr, ack2: Ack2) -> Result<(), GossipError> {
        self.transport.send(&GossipMessage::Ack2(ack2), peer).await
    }

    pub(crate) async fn send_shutdown(
        &self,
        peer: SocketAddr,
        from: SocketAddr,
        generation: Option<i32>,
    ) -> Result<(), GossipError> {
        self.transport
            .send(&GossipMessage::Shutdown { from, generation }, peer)
            .await
    }

    /// Sends an echo probe and waits for the peer's verdict.
    pub(crate) async fn send_echo(
        &self,
        peer: SocketAddr,
        generation: Option<i64>,
        timeout: Duration,
    ) -> Result<(), GossipError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_echo.insert(request_id, tx);
        let message = GossipMessage::Echo {
            request_id,
            generation,
        };
        if let Err(err) = self.transport.send(&message, peer).await {
            self.pending_echo.remove(&request_id);
            return Err(err);
        }
        match time::timeout(timeout, rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(GossipError::EchoRejected { peer }),
            Ok(Err(_)) | Err(_) => {
                self.pending_echo.remove(&request_id);
                Err(GossipError::Timeout { peer })
            }
        }
    }

    /// Shadow-round request for every known peer's state, filtered to `wanted`.
    pub(crate) async fn send_get_endpoint_states(
        &self,
        peer: SocketAddr,
        wanted: BTreeSet<ApplicationState>,
        timeout: Duration,
    ) -> Result<EndpointStateMap, GossipError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_states.insert(request_id, tx);
        let message = GossipMessage::GetEndpointStates { request_id, wanted };
        if let Err(err) = self.transport.send(&message, peer).await {
            self.pending_states.remove(&request_id);
            return Err(err);
        }
        match time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => {
                self.pending_states.remove(&request_id);
                Err(GossipError::Timeout { peer })
            }
        }
    }

    pub(crate) async fn reply_echo(
        &self,
        peer: SocketAddr,
        request_id: u64,
        ok: bool,
    ) -> Result<(), GossipError> {
        self.transport
            .send(&GossipMessage::EchoReply { request_id, ok }, peer)
            .await
    }

    pub(crate) async fn reply_endpoint_states(
        &self,
        peer: SocketAddr,
        request_id: u64,
        states: EndpointStateMap,
    ) -> Result<(), GossipError> {
        self.transport
            .send(&GossipMessage::EndpointStatesReply { request_id, states }, peer)
            .await
    }

    /// Routes reply messages to their pending request; returns the message
    /// back when it is a request that needs dispatching.
    pub(crate) fn intercept_reply(
        &self,
        message: GossipMessage,
        from: SocketAddr,
    ) -> Option<GossipMessage> {
        match message {
            GossipMessage::EchoReply { request_id, ok } => {
                if let Some((_, tx)) = self.pending_echo.remove(&request_id) {
                    let _ = tx.send(ok);
                } else {
                    trace!(%from, request_id, "dropping unmatched echo reply");
                }
                None
            }
            GossipMessage::EndpointStatesReply { request_id, states } => {
                if let Some((_, tx)) = self.pending_states.remove(&request_id) {
                    let _ = tx.send(Ok(states));
                } else {
                    trace!(%from, request_id, "dropping unmatched endpoint-states reply");
                }
                None
            }
            GossipMessage::Unsupported { request_id } => {
                if let Some((_, tx)) = self.pending_states.remove(&request_id) {
                    let _ = tx.send(Err(GossipError::UnknownVerb { peer: from }));
                }
                None
            }
            other => Some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn gate_drains_before_close_returns() {
        let gate = Gate::new();
        let guard = gate.enter().expect("gate open");

        let closing = Arc::clone(&gate);
        let close_task = tokio::spawn(async move { closing.close().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!close_task.is_finished(), "close returned while task active");
        assert!(gate.enter().is_none(), "gate admitted work while closing");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), close_task)
            .await
            .expect("close completes after drain")
            .expect("close task");
    }

    #[tokio::test]
    async fn echo_round_trip_over_loopback() {
        let server = MessagingService::bind(loopback()).await.expect("bind server");
        let client = MessagingService::bind(loopback()).await.expect("bind client");
        let server_addr = server.local_addr().expect("server addr");

        let responder = tokio::spawn(async move {
            let (message, from) = server.recv().await.expect("recv");
            match message {
                GossipMessage::Echo { request_id, .. } => {
                    server.reply_echo(from, request_id, true).await.expect("reply");
                }
                other => panic!("unexpected message {other:?}"),
            }
        });

        let probe = client.send_echo(server_addr, Some(42), Duration::from_secs(2));
        let recv_loop = async {
            loop {
                let (message, from) = client.recv().await.expect("client recv");
                client.intercept_reply(message, from);
            }
        };
        tokio::select! {
            result = probe => result.expect("echo accepted"),
            () = recv_loop => unreachable!("receive loop never finishes"),
        }
        responder.await.expect("responder");
    }

    #[tokio::test]
    async fn unsupported_reply_maps_to_unknown_verb() {
        let server = MessagingService::bind(loopback()).await.expect("bind server");
        let client = MessagingService::bind(loopback()).await.expect("bind client");
        let server_addr = server.local_addr().expect("server addr");

        tokio::spawn(async move {
            let (message, from) = server.recv().await.expect("recv");
            if let GossipMessage::GetEndpointStates { request_id, .. } = message {
                server
                    .transport
                    .send(&GossipMessage::Unsupported { request_id }, from)
                    .await
                    .expect("send unsupported");
            }
        });

        let request =
            client.send_get_endpoint_states(server_addr, BTreeSet::new(), Duration::from_secs(2));
        let recv_loop = async {
            loop {
                let (message, from) = client.recv().await.expect("client recv");
                client.intercept_reply(message, from);
            }
        };
        let result = tokio::select! {
            result = request => result,
            () = recv_loop => unreachable!("receive loop never finishes"),
        };
        assert!(matches!(result, Err(GossipError::UnknownVerb { .. })));
    }
}
