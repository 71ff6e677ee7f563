use std::net::SocketAddr;
use std::sync::Arc;

use bincode::{deserialize, serialize};
use tokio::net::UdpSocket;

use crate::error::GossipError;
use crate::messages::GossipMessage;

// State maps for a large cluster do not fit the usual 1400-byte MTU budget;
// stay within a single maximum-size UDP datagram instead.
const DEFAULT_MAX_PACKET_SIZE: usize = 61_440;

/// UDP-based transport for gossip traffic.
pub struct GossipTransport {
    socket: Arc<UdpSocket>,
    max_packet_size: usize,
}

impl GossipTransport {
    /// Bind a UDP socket for gossip traffic.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, GossipError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        })
    }

    /// Returns the socket address assigned to the underlying UDP socket.
    pub fn local_addr(&self) -> Result<SocketAddr, GossipError> {
        Ok(self.socket.local_addr()?)
    }

    /// Send a serialized gossip message to the provided peer.
    pub async fn send(&self, message: &GossipMessage, addr: SocketAddr) -> Result<(), GossipError> {
        let payload =
            serialize(message).map_err(|err| GossipError::Serialization(err.to_string()))?;
        if payload.len() > self.max_packet_size {
            return Err(GossipError::MessageTooLarge(payload.len()));
        }
        self.socket.send_to(&payload, addr).await?;
        Ok(())
    }

    /// Receive the next gossip message from the UDP socket.
    pub async fn recv(&self) -> Result<(GossipMessage, SocketAddr), GossipError> {
        let mut buf = vec![0u8; self.max_packet_size];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        let message =
            deserialize(&buf[..len]).map_err(|err| GossipError::Serialization(err.to_string()))?;
        Ok((message, addr))
    }
}
