//! The real transport: an unreliable, UDP-shaped datagram socket
//! (§6 "Transport"), replacing the teacher crate's TCP + TLS backing
//! since the protocol is specified to tolerate loss, duplication, and
//! reordering at the transport layer rather than hide it behind a
//! reliable stream.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::communication::message::Header;
use crate::communication::{NodeId, PeerHandle};
use crate::error::*;

/// Maximum size of a single datagram this crate will ever send or
/// accept; comfortably under the common path MTU of 1500 bytes minus
/// IP/UDP overhead, with headroom for a handful of batched messages.
pub const MAX_DATAGRAM_SIZE: usize = 1usize << 16;

/// A `PeerHandle` backed by a real `tokio::net::UdpSocket`.
///
/// Every peer's address is known a priori from [`crate::communication::NodeConfig`];
/// there is no connection handshake, matching an unreliable-datagram
/// transport.
pub struct UdpPeerHandle {
    socket: Arc<UdpSocket>,
    addrs: std::collections::BTreeMap<NodeId, SocketAddr>,
}

impl UdpPeerHandle {
    /// Binds a UDP socket at `bind_addr`, routing to peers per `addrs`.
    pub async fn bind(
        bind_addr: SocketAddr,
        addrs: std::collections::BTreeMap<NodeId, SocketAddr>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.wrapped(ErrorKind::Communication)?;
        Ok(Self { socket: Arc::new(socket), addrs })
    }

    /// Receives the next inbound datagram, splitting it into its
    /// `Header` and payload slice.
    pub async fn recv_datagram(&self, buf: &mut [u8]) -> Result<(Header, usize)> {
        let (n, _from) = self
            .socket
            .recv_from(buf)
            .await
            .wrapped(ErrorKind::Communication)?;
        if n < Header::LENGTH {
            return Err("datagram shorter than a Header").wrapped(ErrorKind::CommunicationMessage);
        }
        let header = Header::deserialize_from(&buf[..Header::LENGTH])?;
        Ok((header, n))
    }
}

#[async_trait::async_trait]
impl PeerHandle for UdpPeerHandle {
    async fn send_to(&self, to: NodeId, bytes: Vec<u8>) -> Result<()> {
        let addr = self
            .addrs
            .get(&to)
            .ok_or_else(|| format!("no known address for {}", to))
            .wrapped(ErrorKind::Configuration)?;
        self.socket
            .send_to(&bytes, addr)
            .await
            .wrapped(ErrorKind::Communication)?;
        Ok(())
    }
}
