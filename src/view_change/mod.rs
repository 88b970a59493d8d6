//! Leader election and log recovery (§4.F).
//!
//! Builds and validates `ViewChange`/`NewView` messages, assembles the
//! re-issued `O`-set at a prospective primary, and implements the
//! BFT2F-specific dominance check that stops a lagging replica from
//! rolling the system back during a view change.

use std::sync::Arc;

use crate::communication::message::{
    CommitCertificate, Header, NewViewMessage, OSetEntry, OperationsDictMessage, PreparedCert,
    PrePrepareMessage, PrimaryNotDominantMessage, StoredMessage, SystemMessage, ViewChangeMessage,
};
use crate::communication::{NodeId, Outbound};
use crate::crypto::hash::Digest;
use crate::crypto::signature::KeyPair;
use crate::error::*;
use crate::log::ViewChangeStore;
use crate::ordering::{SeqNo, View};
use crate::version_vector::{self, VersionVectorEntry};

/// Owns one replica's view-change bookkeeping: the id of the view it is
/// currently trying to move to, and the votes collected so far for it.
pub struct ViewChangeState<O> {
    id: NodeId,
    n: usize,
    f: usize,
    keypair: Arc<KeyPair>,
    votes: ViewChangeStore<O>,
}

/// What the replica should do in response to a view-change-related
/// message; the caller (`core::server`) is responsible for actually
/// adopting a new view or dispatching the listed catch-up request.
pub struct Effects<O, P> {
    pub outbound: Vec<Outbound<O, P>>,
    /// Set once a valid `NewView` has been accepted: the view it
    /// installs, and the `O`-set to replay as this replica's new
    /// decision log.
    pub adopt: Option<(View, Vec<OSetEntry<O>>)>,
}

impl<O, P> Default for Effects<O, P> {
    fn default() -> Self {
        Self { outbound: Vec::new(), adopt: None }
    }
}

impl<O> ViewChangeState<O>
where
    O: Clone,
{
    pub fn new(id: NodeId, n: usize, f: usize, keypair: Arc<KeyPair>) -> Self {
        Self { id, n, f, keypair, votes: ViewChangeStore::new() }
    }

    fn sign_entry(&self, view: View, seq: SeqNo, digest: Digest) -> VersionVectorEntry {
        let bytes = version_vector::entry_signing_bytes(self.id, view, seq, digest);
        VersionVectorEntry { replica_id: self.id, view, seq, digest, signature: self.keypair.sign(&bytes) }
    }

    /// Builds this replica's own `ViewChange` vote for `new_view`,
    /// broadcast on a view timer's expiry (§4.F, steps 1-3).
    ///
    /// `dispatch` never loops a broadcast back to its own sender, so
    /// the vote is registered here directly rather than waiting for it
    /// to arrive over the network (it never would).
    pub fn build_view_change(
        &mut self,
        new_view: View,
        last_committed: VersionVectorEntry,
        p_set: Vec<PreparedCert<O>>,
    ) -> ViewChangeMessage<O> {
        let vc = ViewChangeMessage { new_view, replica_id: self.id, last_committed, p_set };
        let header = Header::synthetic(self.id);
        self.votes.add(new_view, StoredMessage::new(header, vc.clone()));
        vc
    }

    /// Handles an inbound `ViewChange`: records the vote, and if the
    /// sender's `last_committed` trails our own, answers with
    /// `PrimaryNotDominant` instead of (only) counting the vote
    /// (§4.F "Dominance check").
    pub fn on_view_change<P>(
        &mut self,
        header: Header,
        msg: ViewChangeMessage<O>,
        our_last_committed: &VersionVectorEntry,
    ) -> Effects<O, P> {
        let mut fx = Effects::default();
        let sender = msg.replica_id;
        let new_view = msg.new_view;

        if msg.last_committed.order_key() < our_last_committed.order_key() {
            let response = PrimaryNotDominantMessage {
                sender: self.id,
                sender_last_committed: our_last_committed.clone(),
            };
            fx.outbound
                .push(Outbound::To(sender, SystemMessage::PrimaryNotDominant(response)));
        }

        self.votes.add(new_view, StoredMessage::new(header, msg));
        fx
    }

    /// Returns whether `2f+1` mutually non-conflicting `ViewChange`
    /// votes have been collected for `new_view`: for every sequence
    /// shared between two votes' `P`-sets, they must agree on the
    /// proven digest.
    fn quorum_for(&self, new_view: View) -> Option<Vec<&StoredMessage<ViewChangeMessage<O>>>> {
        let votes = self.votes.votes_for(new_view);
        if votes.len() < 2 * self.f + 1 {
            return None;
        }
        for (i, a) in votes.iter().enumerate() {
            for b in &votes[i + 1..] {
                for pa in &a.message.p_set {
                    for pb in &b.message.p_set {
                        if pa.seq() == pb.seq() && pa.digest() != pb.digest() {
                            return None;
                        }
                    }
                }
            }
        }
        Some(votes.iter().take(2 * self.f + 1).collect())
    }

    /// At the prospective primary of `new_view`: once a non-conflicting
    /// quorum is held, assembles and returns the `NewView` to broadcast
    /// (§4.F, prospective-primary steps).
    pub fn try_assemble_new_view(&self, new_view: View) -> Option<NewViewMessage<O>> {
        let quorum = self.quorum_for(new_view)?;

        let min_s = quorum
            .iter()
            .map(|v| v.message.last_committed.seq)
            .min()
            .unwrap_or(SeqNo::ZERO);
        let max_s = quorum
            .iter()
            .flat_map(|v| v.message.p_set.iter().map(|p| p.seq()))
            .max()
            .unwrap_or(min_s);

        let mut o_set = Vec::new();
        let mut seq = min_s.next();
        while seq <= max_s {
            let proven = quorum
                .iter()
                .flat_map(|v| v.message.p_set.iter())
                .find(|p| p.seq() == seq);
            let pre_prepare = proven.map(|p| PrePrepareMessage {
                view: new_view,
                seq,
                digest: p.digest(),
                request: p.pre_prepare.message.request.clone(),
            });
            o_set.push(OSetEntry { seq, pre_prepare });
            seq = seq.next();
        }

        let v_set = quorum.into_iter().cloned().collect();
        Some(NewViewMessage { new_view, v_set, o_set })
    }

    /// Validates an inbound `NewView` for `current_view` (§4.F "Reject
    /// if..."): the proposed view must be strictly ahead, `V` must hold
    /// `2f+1` distinct signers, and `O` must only contain pre-prepares
    /// (never a mixed-kind set, per the resolved Open Question).
    pub fn validate_new_view(
        &self,
        current_view: View,
        msg: &NewViewMessage<O>,
    ) -> Result<()> {
        if msg.new_view <= current_view {
            return Err("new-view does not advance the current view")
                .wrapped(ErrorKind::ViewChange);
        }
        let mut signers = crate::collections::hash_set();
        for v in &msg.v_set {
            signers.insert(v.header.from());
        }
        if signers.len() < 2 * self.f + 1 {
            return Err("new-view's V-set lacks 2f+1 distinct signers")
                .wrapped(ErrorKind::ViewChange);
        }
        for entry in &msg.o_set {
            if let Some(pp) = &entry.pre_prepare {
                if pp.seq != entry.seq || pp.view != msg.new_view {
                    return Err("new-view O-set entry does not match its slot")
                        .wrapped(ErrorKind::ViewChange);
                }
            }
        }
        Ok(())
    }

    /// Builds the catch-up answer to a `PrimaryNotDominant` response:
    /// one commit certificate per sequence number the sender proved we
    /// are missing (§4.F "Dominance check").
    pub fn build_operations_dict(
        missing: Vec<(SeqNo, CommitCertificate)>,
    ) -> OperationsDictMessage {
        OperationsDictMessage { entries: missing }
    }

    pub fn clear_votes_below(&mut self, floor: View) {
        self.votes.clear_below(floor);
    }
}
