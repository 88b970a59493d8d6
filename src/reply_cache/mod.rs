//! At-most-once reply delivery: the last `Reply` sent to each client.
//!
//! Consulted on every `Request`: a replica re-sends a cached reply for
//! a retransmitted timestamp rather than re-executing the operation
//! (§4.C, invariant 4 "at-most-once").

use crate::communication::message::ReplyMessage;
use crate::communication::NodeId;
use crate::ordering::SeqNo;

/// Maps `client_id -> last Reply delivered to that client`.
#[derive(Default)]
pub struct ReplyCache<P> {
    cache: crate::collections::HashMap<NodeId, (u64, ReplyMessage<P>)>,
}

impl<P: Clone> ReplyCache<P> {
    /// Creates an empty reply cache.
    pub fn new() -> Self {
        Self { cache: crate::collections::hash_map() }
    }

    /// Returns the cached reply for `client_id`, if any.
    pub fn get(&self, client_id: NodeId) -> Option<&ReplyMessage<P>> {
        self.cache.get(&client_id).map(|(_, r)| r)
    }

    /// Compares `t` (a request's client timestamp) against the cached
    /// entry for `client_id`: `None` if there is nothing cached yet,
    /// `Some(Ordering::Equal)` if `t` matches the cached reply exactly
    /// (the request should be re-answered from cache), `Some(Less)` if
    /// `t` is a stale resend (drop it), `Some(Greater)` if `t` is new
    /// (proceed to ordering).
    pub fn compare(&self, client_id: NodeId, t: u64) -> Option<std::cmp::Ordering> {
        self.cache.get(&client_id).map(|(cached_t, _)| t.cmp(cached_t))
    }

    /// Records `reply` as the last reply sent to `client_id` at
    /// timestamp `t`.
    pub fn put(&mut self, client_id: NodeId, t: u64, reply: ReplyMessage<P>) {
        self.cache.insert(client_id, (t, reply));
    }

    /// Drops cached replies whose underlying sequence number is below
    /// `floor`, as part of checkpoint garbage collection (§4.G).
    pub fn drop_before(&mut self, floor: SeqNo, seq_of: impl Fn(&ReplyMessage<P>) -> SeqNo) {
        self.cache.retain(|_, (_, reply)| seq_of(reply) >= floor);
    }

    /// Replaces the whole cache with a checkpoint's snapshot, as part of
    /// catching up to a stable checkpoint received from peers.
    pub fn restore_snapshot(
        &mut self,
        snapshot: crate::collections::HashMap<NodeId, (u64, ReplyMessage<P>)>,
    ) {
        self.cache = snapshot;
    }

    /// Returns an immutable view of the cache, suitable for inclusion in
    /// an outgoing `Checkpoint` message.
    pub fn snapshot(&self) -> crate::collections::HashMap<NodeId, (u64, ReplyMessage<P>)>
    where
        ReplyMessage<P>: Clone,
    {
        self.cache.clone()
    }
}
