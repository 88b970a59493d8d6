//! The replica state machine: the REQUEST → PRE-PREPARE → PREPARE →
//! COMMIT pipeline and its per-sequence slot transitions (§4.E).
//!
//! Deliberately free of any transport or executor dependency: every
//! method here takes an inbound message (plus, where needed, its
//! `Header`) and returns the outbound messages and execution requests
//! it provokes, so the whole pipeline is testable without a socket or
//! an application thread (§4.M).

use std::sync::Arc;

use serde::Serialize;

use crate::communication::message::{
    CommitMessage, Header, PrePrepareMessage, PrepareMessage, ReplyMessage, ReplyResult,
    RequestMessage, StoredMessage, SystemMessage,
};
use crate::communication::{NodeId, Outbound};
use crate::crypto::hash::Digest;
use crate::crypto::signature::KeyPair;
use crate::error::*;
use crate::hash_chain::HashChainDigest;
use crate::log::{DecisionLog, SlotState};
use crate::ordering::{SeqNo, View};
use crate::reply_cache::ReplyCache;
use crate::version_vector::{self, VersionVector, VersionVectorEntry};

/// Effects produced by feeding one message into the consensus engine:
/// messages to send, and committed requests ready for the application.
pub struct Effects<O, P> {
    pub outbound: Vec<Outbound<O, P>>,
    pub to_execute: Vec<crate::executable::Update<O>>,
}

impl<O, P> Default for Effects<O, P> {
    fn default() -> Self {
        Self { outbound: Vec::new(), to_execute: Vec::new() }
    }
}

impl<O, P> Effects<O, P> {
    fn send(mut self, m: Outbound<O, P>) -> Self {
        self.outbound.push(m);
        self
    }

    fn merge(mut self, other: Effects<O, P>) -> Self {
        self.outbound.extend(other.outbound);
        self.to_execute.extend(other.to_execute);
        self
    }
}

/// Owns one replica's consensus-relevant state: its view, watermark
/// window, hash chain, version vector, reply cache, and the current
/// view's decision log.
pub struct ConsensusState<O, P> {
    id: NodeId,
    n: usize,
    f: usize,
    keypair: Arc<KeyPair>,
    view: View,
    seq_high: SeqNo,
    watermark: u64,
    hcd: HashChainDigest,
    vv: VersionVector,
    rcache: ReplyCache<P>,
    /// The highest client timestamp the primary has already assigned a
    /// sequence number to, tracked separately from `rcache` since a
    /// request can be re-forwarded by several backups before it is
    /// executed and cached (§4.C, invariant 4 "at-most-once").
    assigned: crate::collections::HashMap<NodeId, u64>,
    log: DecisionLog<O>,
}

impl<O, P> ConsensusState<O, P>
where
    O: Clone + Serialize,
    P: Clone,
{
    pub fn new(id: NodeId, n: usize, f: usize, watermark: u64, keypair: Arc<KeyPair>) -> Self {
        Self {
            id,
            n,
            f,
            keypair,
            view: View::INITIAL,
            seq_high: SeqNo::ZERO,
            watermark,
            hcd: HashChainDigest::new(),
            vv: VersionVector::new(),
            rcache: ReplyCache::new(),
            assigned: crate::collections::hash_map(),
            log: DecisionLog::new(View::INITIAL, SeqNo::ZERO, watermark),
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn is_primary(&self) -> bool {
        self.view.primary(self.n) == self.id.id() as usize
    }

    pub fn primary(&self) -> NodeId {
        NodeId(self.view.primary(self.n) as u32)
    }

    pub fn hcd(&self) -> &HashChainDigest {
        &self.hcd
    }

    pub fn vv(&self) -> &VersionVector {
        &self.vv
    }

    pub fn log(&self) -> &DecisionLog<O> {
        &self.log
    }

    /// Builds this replica's outgoing `Checkpoint` for `seq` (§4.G),
    /// snapshotting the reply cache and version vector as they stand.
    pub fn build_checkpoint(
        &self,
        seq: SeqNo,
        cohesion_window: u64,
    ) -> crate::communication::message::CheckpointMessage<P> {
        let vv_snapshot = self.vv.latest_entries();
        let e_set = crate::checkpoint::build_e_set(&self.vv, self.vv.principals(), seq, cohesion_window);
        crate::checkpoint::build_checkpoint(self.id, seq, self.rcache.snapshot(), vv_snapshot, e_set)
    }

    /// Truncates every sequence-bounded store below `floor`, once a
    /// checkpoint at or beyond it has stabilized (§4.G).
    pub fn gc_below(&mut self, floor: SeqNo) {
        self.log.gc_below(floor);
        self.log.advance_low(floor);
        self.hcd.truncate_below(floor);
        self.rcache.drop_before(floor, |r| r.entry.seq);
    }

    /// Gathers this replica's own `PreparedCert` evidence for every slot
    /// that reached `PREPARED` or later, used to build a `ViewChange`
    /// vote (§4.F, steps 1-3).
    pub fn prepared_certs(&self) -> Vec<crate::communication::message::PreparedCert<O>>
    where
        O: Clone,
    {
        self.log.slots().filter_map(|(_, slot)| slot.prepared_cert()).collect()
    }

    /// Installs a validated `NewView`: advances to `new_view` with a
    /// fresh, empty `DecisionLog`, then replays every pre-prepare named
    /// by the `O`-set so the slots they name start life already
    /// `PRE_PREPARED` in the new view (§4.F, replica-side effects of
    /// accepting a `NewView`).
    pub fn adopt_new_view(
        &mut self,
        new_view: View,
        o_set: Vec<crate::communication::message::OSetEntry<O>>,
    ) -> Effects<O, P> {
        let mut fx = Effects::default();
        self.view = new_view;
        self.log = DecisionLog::new(new_view, self.seq_high, self.watermark);
        for entry in o_set {
            let (seq, pre_prepare) = (entry.seq, entry.pre_prepare);
            let pre_prepare = match pre_prepare {
                Some(pp) => pp,
                None => continue,
            };
            if seq >= self.seq_high {
                self.seq_high = seq.next();
            }
            let digest = pre_prepare.digest;
            let header = Header::synthetic(self.primary());
            self.log.slot_mut(seq).set_pre_prepare(StoredMessage::new(header, pre_prepare));
            let prepare = PrepareMessage { view: new_view, seq, digest };
            fx = fx.send(Outbound::ToAllReplicas(SystemMessage::Prepare(prepare)));
        }
        fx
    }

    fn digest_of_request(req: &RequestMessage<O>) -> Result<Digest> {
        let bytes = bincode::serialize(req).wrapped(ErrorKind::Consensus)?;
        Ok(Digest::from_data(&bytes))
    }

    fn sign_entry(&self, seq: SeqNo, digest: Digest) -> VersionVectorEntry {
        let bytes = version_vector::entry_signing_bytes(self.id, self.view, seq, digest);
        VersionVectorEntry {
            replica_id: self.id,
            view: self.view,
            seq,
            digest,
            signature: self.keypair.sign(&bytes),
        }
    }

    /// Handles an inbound client request (§4.E "On REQUEST").
    pub fn on_request(&mut self, req: RequestMessage<O>) -> Result<Effects<O, P>> {
        let mut fx = Effects::default();
        let client_id = req.client_id;

        if let Some(ordering) = self.rcache.compare(client_id, req.t) {
            match ordering {
                std::cmp::Ordering::Equal => {
                    if let Some(cached) = self.rcache.get(client_id).cloned() {
                        fx = fx.send(Outbound::To(client_id, SystemMessage::Reply(cached)));
                    }
                    return Ok(fx);
                }
                std::cmp::Ordering::Less => return Ok(fx),
                std::cmp::Ordering::Greater => {}
            }
        }

        if let Some(css) = self.vv.current_system_state(self.f) {
            if let Some(known) = &req.known_state {
                if known.seq == css.seq && known.digest != css.digest {
                    let entry = self.sign_entry(css.seq, css.digest);
                    let reply = ReplyMessage {
                        client_id,
                        t: req.t,
                        result: ReplyResult::ForkSuspected,
                        entry,
                    };
                    return Ok(fx.send(Outbound::To(client_id, SystemMessage::Reply(reply))));
                }
            }
        }

        if !self.is_primary() {
            // backups forward to the primary; the caller is expected to
            // also arm a view timer for this request.
            return Ok(fx.send(Outbound::To(self.primary(), SystemMessage::Request(req))));
        }

        if let Some(&last) = self.assigned.get(&client_id) {
            if req.t <= last {
                // already assigned a sequence to this (or a newer)
                // request from this client; a backup's forwarded copy
                // of the same request, or a premature resend.
                return Ok(fx);
            }
        }

        // sequence numbers are 0-based, matching `HashChainDigest::append`'s
        // indexing of a fresh chain (§4.A): the first request ever ordered
        // gets `seq 0`, not `seq 1`.
        let seq = self.seq_high;
        self.seq_high = seq.next();
        self.assigned.insert(client_id, req.t);
        let digest = Self::digest_of_request(&req)?;
        let pre_prepare = PrePrepareMessage { view: self.view, seq, digest, request: req };
        // the primary's own pre-prepare is its implicit PREPARE vote
        // (`matching_prepares` doesn't count it again); record it in our
        // own slot so the quorum checks below ever see this sequence as
        // more than `Empty`.
        let header = Header::synthetic(self.id);
        self.log.slot_mut(seq).set_pre_prepare(StoredMessage::new(header, pre_prepare.clone()));
        Ok(fx.send(Outbound::ToAllReplicas(SystemMessage::PrePrepare(pre_prepare))))
    }

    /// Handles an inbound `PrePrepare` at a backup (§4.E).
    pub fn on_pre_prepare(
        &mut self,
        header: Header,
        msg: PrePrepareMessage<O>,
    ) -> Result<Effects<O, P>> {
        let mut fx = Effects::default();
        if msg.view != self.view || !self.log.in_window(msg.seq) {
            return Ok(fx);
        }
        if Self::digest_of_request(&msg.request)? != msg.digest {
            return Err("pre-prepare digest does not match its request")
                .wrapped(ErrorKind::Consensus);
        }
        let (view, seq, digest) = (msg.view, msg.seq, msg.digest);
        let accepted = self
            .log
            .slot_mut(seq)
            .set_pre_prepare(StoredMessage::new(header, msg));
        if !accepted {
            return Err("conflicting pre-prepare for the same (view, seq)")
                .wrapped(ErrorKind::Consensus);
        }
        let prepare = PrepareMessage { view, seq, digest };
        // this replica's own vote; `dispatch` never loops messages back
        // to their sender, so without this no quorum could ever include
        // a correct backup's agreement with itself (§4.E, PREPARED).
        let self_header = Header::synthetic(self.id);
        self.log.slot_mut(seq).add_prepare(StoredMessage::new(self_header, prepare));
        fx = fx.send(Outbound::ToAllReplicas(SystemMessage::Prepare(prepare)));
        if let Some(commit) = self.try_advance_to_prepared(seq)? {
            fx = fx.merge(self.emit_commit(commit));
        }
        Ok(fx)
    }

    /// Handles an inbound `Prepare` (§4.E "A slot becomes PREPARED").
    pub fn on_prepare(&mut self, header: Header, msg: PrepareMessage) -> Result<Effects<O, P>> {
        let mut fx = Effects::default();
        if msg.view != self.view || !self.log.in_window(msg.seq) {
            return Ok(fx);
        }
        let seq = msg.seq;
        if !self.log.slot_mut(seq).add_prepare(StoredMessage::new(header, msg)) {
            return Err("conflicting prepare for the same (view, seq)")
                .wrapped(ErrorKind::Consensus);
        }
        if let Some(commit) = self.try_advance_to_prepared(seq)? {
            fx = fx.merge(self.emit_commit(commit));
        }
        Ok(fx)
    }

    /// Checks whether `seq`'s slot now holds `2f` matching prepares from
    /// distinct backups beyond its pre-prepare (the primary's own,
    /// implicit vote), appending the next hash-chain block and advancing
    /// the slot to `PREPARED` if so (§4.E "A slot becomes PREPARED").
    fn try_advance_to_prepared(&mut self, seq: SeqNo) -> Result<Option<CommitMessage>> {
        let slot = self.log.slot_mut(seq);
        if slot.state() != SlotState::PrePrepared {
            return Ok(None);
        }
        let digest = match slot.pre_prepare() {
            Some(pp) => pp.message.digest,
            None => return Ok(None),
        };
        if slot.matching_prepares(digest) < 2 * self.f {
            return Ok(None);
        }

        let request_bytes = bincode::serialize(&slot.pre_prepare().unwrap().message.request)
            .wrapped(ErrorKind::Consensus)?;
        let hcd = self.hcd.append(seq, request_bytes)?;
        self.log.slot_mut(seq).advance_to(SlotState::Prepared);

        Ok(Some(CommitMessage { view: self.view, seq, digest, hcd }))
    }

    /// Records this replica's own commit vote alongside broadcasting it,
    /// then checks whether the slot is already committable (§4.E "A slot
    /// becomes COMMITTED").
    fn emit_commit(&mut self, commit: CommitMessage) -> Effects<O, P> {
        let self_header = Header::synthetic(self.id);
        self.log.slot_mut(commit.seq).add_commit(StoredMessage::new(self_header, commit));
        Effects::default()
            .send(Outbound::ToAllReplicas(SystemMessage::Commit(commit)))
            .merge(self.try_advance_to_committed(commit.seq, commit.digest, commit.hcd))
    }

    /// Handles an inbound `Commit` (§4.E "A slot becomes COMMITTED").
    pub fn on_commit(&mut self, header: Header, msg: CommitMessage) -> Result<Effects<O, P>> {
        if msg.view != self.view || !self.log.in_window(msg.seq) {
            return Ok(Effects::default());
        }
        let seq = msg.seq;
        self.log.slot_mut(seq).add_commit(StoredMessage::new(header, msg));
        Ok(self.try_advance_to_committed(seq, msg.digest, msg.hcd))
    }

    /// Checks whether `seq`'s slot now holds `2f+1` matching commits
    /// (every correct replica's own vote included), and if so advances
    /// it to `COMMITTED` and queues the request for execution.
    fn try_advance_to_committed(&mut self, seq: SeqNo, digest: Digest, hcd: Digest) -> Effects<O, P> {
        let mut fx = Effects::default();
        let slot = self.log.slot_mut(seq);
        if slot.state() != SlotState::Prepared {
            return fx;
        }
        if slot.matching_commits(digest, hcd) < 2 * self.f + 1 {
            return fx;
        }

        slot.advance_to(SlotState::Committed);
        let pre_prepare = slot.pre_prepare().unwrap();
        let client_id = pre_prepare.message.request.client_id;
        let op = pre_prepare.message.request.op.clone();

        fx.to_execute.push(crate::executable::Update { seq, client_id, digest, op });

        let entry = self.sign_entry(seq, hcd);
        self.vv.update(entry);

        fx
    }

    /// Completes a committed request once the application has produced
    /// its reply (§4.E "REPLIED"): updates the reply cache, and returns
    /// the signed reply to send back to the client.
    pub fn on_executed(
        &mut self,
        seq: SeqNo,
        client_id: NodeId,
        t: u64,
        reply: P,
    ) -> Result<Outbound<O, P>> {
        let hcd = self.hcd.digest_at(seq).ok_or("executed a sequence with no retained digest")
            .wrapped(ErrorKind::Consensus)?;
        let entry = self.sign_entry(seq, hcd);
        let reply = ReplyMessage { client_id, t, result: ReplyResult::Ok(reply), entry };
        self.rcache.put(client_id, t, reply.clone());
        self.log.slot_mut(seq).advance_to(SlotState::Replied);
        Ok(Outbound::To(client_id, SystemMessage::Reply(reply)))
    }
}
