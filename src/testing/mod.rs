//! An in-memory [`PeerHandle`] backed by channels (§4.M), used to drive
//! deterministic [`Replica`](crate::core::server::Replica)/
//! [`Client`](crate::core::client::Client) integration tests without
//! binding real sockets.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::communication::channel::{new_channel, ChannelRx, ChannelTx};
use crate::communication::{NodeId, PeerHandle};
use crate::error::*;

/// A fully-connected in-memory network: every registered node's
/// already-framed, already-signed datagrams are routed straight into
/// its peer's inbound queue, with no encoding, loss, or latency.
#[derive(Clone, Default)]
pub struct Network {
    inboxes: Arc<Mutex<BTreeMap<NodeId, ChannelTx<Vec<u8>>>>>,
}

impl Network {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id`, returning its [`PeerHandle`] and the receiving
    /// end of its inbound queue.
    ///
    /// Registering the same `id` twice replaces its inbox; the handle
    /// returned by the earlier call keeps sending into the stale,
    /// now-orphaned channel.
    pub fn register(&self, id: NodeId) -> (InMemoryPeerHandle, ChannelRx<Vec<u8>>) {
        let (tx, rx) = new_channel();
        self.inboxes.lock().insert(id, tx);
        (InMemoryPeerHandle { id, network: self.clone() }, rx)
    }
}

/// A [`PeerHandle`] routing through a shared in-memory [`Network`]
/// rather than a real socket.
pub struct InMemoryPeerHandle {
    id: NodeId,
    network: Network,
}

#[async_trait::async_trait]
impl PeerHandle for InMemoryPeerHandle {
    async fn send_to(&self, to: NodeId, bytes: Vec<u8>) -> Result<()> {
        let tx = self.network.inboxes.lock().get(&to).cloned();
        match tx {
            Some(tx) => {
                trace!("in-memory network: {} -> {}, {} bytes", self.id, to, bytes.len());
                tx.send(bytes)
            }
            None => Err(format!("no such node registered on the in-memory network: {}", to))
                .wrapped(ErrorKind::Configuration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_a_datagram_to_its_registered_peer() {
        let net = Network::new();
        let (a, _a_rx) = net.register(NodeId(0));
        let (_b, mut b_rx) = net.register(NodeId(1));

        a.send_to(NodeId(1), vec![1, 2, 3]).await.unwrap();
        assert_eq!(b_rx.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn rejects_an_unregistered_destination() {
        let net = Network::new();
        let (a, _a_rx) = net.register(NodeId(0));
        let err = a.send_to(NodeId(9), vec![1]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
