//! Node addressing, the wire message model, and the inter-node
//! transport abstraction.
//!
//! Mirrors the teacher crate's `bft::communication` module: a flat
//! `NodeId` numbering scheme shared by replicas and clients, and a
//! [`PeerHandle`] abstraction over "send to one / broadcast to all"
//! with two concrete backings — a UDP socket (§4.L) and an in-memory
//! test double (§4.M) — so the protocol engine never talks to a socket
//! directly.

pub mod channel;
pub mod message;
pub mod socket;

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::communication::message::SystemMessage;
use crate::crypto::signature::PublicKey;
use crate::error::*;

/// Numbers every participant in the system, replicas and clients alike.
///
/// By convention replicas occupy `0..n` and clients occupy `n..`,
/// mirroring the teacher crate's flat `NodeId` space rather than
/// keeping replicas and clients in disjoint id types.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u32);

impl NodeId {
    /// Returns the raw numeric id.
    pub fn id(self) -> u32 {
        self.0
    }
}

impl From<u32> for NodeId {
    fn from(v: u32) -> Self {
        NodeId(v)
    }
}

impl From<NodeId> for u32 {
    fn from(n: NodeId) -> Self {
        n.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static addressing and key material for every node in the system,
/// shared by replicas and clients alike.
#[derive(Clone)]
pub struct NodeConfig {
    /// This node's own id.
    pub id: NodeId,
    /// Total number of replicas, `N`.
    pub n: usize,
    /// Maximum tolerated faulty replicas, `f`.
    pub f: usize,
    /// Every node's socket address, replicas and clients alike.
    pub addrs: BTreeMap<NodeId, SocketAddr>,
    /// Every node's public key, used to verify incoming signatures.
    pub public_keys: BTreeMap<NodeId, PublicKey>,
}

impl NodeConfig {
    /// Iterates over every replica id, `0..n`.
    pub fn replica_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.n as u32).map(NodeId)
    }

    /// Looks up a node's address.
    pub fn addr_of(&self, id: NodeId) -> Result<SocketAddr> {
        self.addrs
            .get(&id)
            .copied()
            .ok_or_else(|| format!("no known address for {}", id))
            .wrapped(ErrorKind::Configuration)
    }

    /// Looks up a node's public key.
    pub fn public_key_of(&self, id: NodeId) -> Result<&PublicKey> {
        self.public_keys
            .get(&id)
            .ok_or_else(|| format!("no known public key for {}", id))
            .wrapped(ErrorKind::Configuration)
    }
}

/// Abstracts "send this already-framed, already-signed datagram to a
/// peer" over two backings: a real UDP socket ([`socket`]), and an
/// in-memory channel used by the test harness (§4.M, [`crate::testing`]).
///
/// Neither the consensus engine nor the client quorum engine depends on
/// a concrete transport; both are generic over this trait.
#[async_trait::async_trait]
pub trait PeerHandle: Send + Sync {
    /// Sends a single already-framed datagram to `to`.
    async fn send_to(&self, to: NodeId, bytes: Vec<u8>) -> Result<()>;

    /// Sends a single already-framed datagram to every id in `targets`.
    ///
    /// The default implementation fans out sequentially; backings for
    /// which true multicast is cheaper (or for which fan-out ordering
    /// matters, as in the in-memory test double) are expected to
    /// override it.
    async fn broadcast(&self, targets: &[NodeId], bytes: Vec<u8>) -> Result<()> {
        for &to in targets {
            self.send_to(to, bytes.clone()).await?;
        }
        Ok(())
    }
}

/// A message the protocol engine has decided to send, still addressed
/// but not yet encoded or signed — the boundary between the (pure,
/// synchronously testable) state machines of [`crate::consensus`],
/// [`crate::view_change`], [`crate::checkpoint`] and the actual
/// transport.
pub enum Outbound<O, P> {
    /// Sent to a single node (a reply to a client, a dominance-check
    /// response, a missing-commits answer).
    To(NodeId, SystemMessage<O, P>),
    /// Sent to every replica in the system.
    ToAllReplicas(SystemMessage<O, P>),
}
