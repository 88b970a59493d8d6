//! The top-level `Replica`: wires the consensus, view-change, and
//! checkpoint engines to an application [`Service`] and a [`PeerHandle`]
//! transport, and drives them from a single event loop (§5).

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::checkpoint::{self, CheckpointStore};
use crate::communication::channel::ChannelTx;
use crate::communication::message::{Header, NewViewMessage, SystemMessage, WireMessage};
use crate::communication::{NodeConfig, NodeId, Outbound, PeerHandle};
use crate::consensus::ConsensusState;
use crate::crypto::signature::KeyPair;
use crate::error::*;
use crate::executable::{ExecutedReply, Executor, ExecutorHandle, Service, Update};
use crate::ordering::View;
use crate::timeouts::TimeoutsHandle;
use crate::view_change::ViewChangeState;

/// Tunable system parameters read from CLI flags / environment
/// variables at startup (§4.K); no part of the engine reads the
/// environment directly.
#[derive(Clone, Copy)]
pub struct SystemParams {
    pub n: usize,
    pub f: usize,
    pub watermark: u64,
    pub checkpoint_interval: u64,
    pub cohesion_window: u64,
    pub view_timeout: Duration,
}

impl SystemParams {
    /// The smallest `n` that tolerates `f` Byzantine replicas.
    pub fn minimum_n(f: usize) -> usize {
        3 * f + 1
    }
}

/// Events driving the replica's single-threaded event loop, beyond
/// plain inbound protocol messages.
#[derive(Clone)]
pub enum ReplicaEvent<P> {
    ViewTimeout(View),
    NewViewTimeout(View),
    Executed(ExecutedReply<P>),
}

/// A single BFT2F replica.
pub struct Replica<S: Service> {
    id: NodeId,
    config: NodeConfig,
    params: SystemParams,
    consensus: ConsensusState<S::Operation, S::Reply>,
    view_change: ViewChangeState<S::Operation>,
    checkpoints: CheckpointStore<S::Reply>,
    executor: ExecutorHandle<S>,
    peers: Arc<dyn PeerHandle>,
    keypair: Arc<KeyPair>,
    events: TimeoutsHandle<ReplicaEvent<S::Reply>>,
    /// The highest view this replica has already broadcast a
    /// `ViewChange` vote for, so a new-view timeout escalates past it
    /// (`v+2`, `v+3`, ...) instead of re-requesting the same view
    /// forever (§4.F, step 4).
    requested_view: View,
    /// A test/demonstration knob (`--faulty`): suppresses this
    /// replica's own PRE-PREPARE/PREPARE votes, modeling a silently
    /// crashed backup for view-change exercising.
    faulty: bool,
}

impl<S> Replica<S>
where
    S: Service,
    S::Operation: Clone + Serialize + DeserializeOwned + Send,
    S::Reply: Clone + Serialize + DeserializeOwned + Send,
{
    /// Boots a replica: spawns the application executor thread, and
    /// builds its initial (view 0) consensus/view-change/checkpoint
    /// state.
    pub fn new(
        id: NodeId,
        config: NodeConfig,
        params: SystemParams,
        service: S,
        peers: Arc<dyn PeerHandle>,
        keypair: Arc<KeyPair>,
        executed_tx: ChannelTx<ExecutedReply<S::Reply>>,
        events: TimeoutsHandle<ReplicaEvent<S::Reply>>,
        faulty: bool,
    ) -> Self {
        let executor = Executor::spawn(service, executed_tx);
        Self {
            id,
            config,
            params,
            consensus: ConsensusState::new(id, params.n, params.f, params.watermark, keypair.clone()),
            view_change: ViewChangeState::new(id, params.n, params.f, keypair.clone()),
            checkpoints: CheckpointStore::new(params.f),
            executor,
            peers,
            keypair,
            events,
            requested_view: View::INITIAL,
            faulty,
        }
    }

    /// Encodes, signs, and frames `msg` for every one of `targets`,
    /// then hands each datagram to the transport (§4.D, §4.L).
    async fn dispatch(&self, outbound: Outbound<S::Operation, S::Reply>) -> Result<()> {
        let (targets, msg): (Vec<NodeId>, SystemMessage<S::Operation, S::Reply>) = match outbound {
            Outbound::To(to, msg) => (vec![to], msg),
            Outbound::ToAllReplicas(msg) => (self.config.replica_ids().collect(), msg),
        };
        let payload = msg.encode()?;
        for to in targets {
            if to == self.id {
                continue;
            }
            let signature = self.keypair.sign(&payload);
            let wire = WireMessage::new(self.id, to, &payload, signature);
            let (header, payload) = wire.into_inner();
            let mut datagram = vec![0u8; Header::LENGTH + payload.len()];
            header.serialize_into(&mut datagram[..Header::LENGTH])?;
            datagram[Header::LENGTH..].copy_from_slice(payload);
            self.peers.send_to(to, datagram).await?;
        }
        Ok(())
    }

    async fn dispatch_all(&self, effects: Vec<Outbound<S::Operation, S::Reply>>) -> Result<()> {
        for outbound in effects {
            self.dispatch(outbound).await?;
        }
        Ok(())
    }

    /// Processes a single inbound, already-decoded system message.
    pub async fn handle_message(
        &mut self,
        header: Header,
        msg: SystemMessage<S::Operation, S::Reply>,
    ) -> Result<()> {
        match msg {
            SystemMessage::Request(req) => {
                trace!("replica {} got request from {}", self.id, req.client_id);
                let fx = self.consensus.on_request(req)?;
                self.dispatch_all(fx.outbound).await?;
                self.queue_executions(fx.to_execute)?;
                self.events.timeout(
                    self.params.view_timeout,
                    ReplicaEvent::ViewTimeout(self.consensus.view()),
                );
            }
            SystemMessage::PrePrepare(pp) => match self.consensus.on_pre_prepare(header, pp) {
                Ok(fx) => {
                    if !self.faulty {
                        self.dispatch_all(fx.outbound).await?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Consensus => {
                    warn!("replica {} rejected a conflicting pre-prepare: {}", self.id, e);
                    self.trigger_view_change().await?;
                }
                Err(e) => return Err(e),
            },
            SystemMessage::Prepare(p) => match self.consensus.on_prepare(header, p) {
                Ok(fx) => {
                    if !self.faulty {
                        self.dispatch_all(fx.outbound).await?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Consensus => {
                    warn!("replica {} rejected a conflicting prepare: {}", self.id, e);
                    self.trigger_view_change().await?;
                }
                Err(e) => return Err(e),
            },
            SystemMessage::Commit(c) => {
                let fx = self.consensus.on_commit(header, c)?;
                self.dispatch_all(fx.outbound).await?;
                for update in &fx.to_execute {
                    // sequence numbers are 0-based (§4.A), so the K-th
                    // committed operation lands at `seq == K - 1`.
                    if (u64::from(update.seq) + 1) % self.params.checkpoint_interval == 0 {
                        let checkpoint = self.consensus.build_checkpoint(update.seq, self.params.cohesion_window);
                        self.dispatch(Outbound::ToAllReplicas(SystemMessage::Checkpoint(checkpoint))).await?;
                    }
                }
                self.queue_executions(fx.to_execute)?;
            }
            SystemMessage::ViewChange(vc) => {
                let our_last_committed = self
                    .consensus
                    .vv()
                    .latest_of(self.id)
                    .cloned()
                    .unwrap_or_else(|| zero_entry(self.id));
                let fx = self
                    .view_change
                    .on_view_change::<S::Reply>(header, vc, &our_last_committed);
                self.dispatch_all(fx.outbound).await?;
                self.try_broadcast_new_view().await?;
            }
            SystemMessage::NewView(nv) => {
                self.apply_new_view(nv).await?;
            }
            SystemMessage::Checkpoint(cp) => {
                if let Some(stable) = self.checkpoints.add(cp) {
                    info!("replica {} checkpoint stable at seq {}", self.id, stable);
                    self.consensus.gc_below(stable);
                    self.checkpoints.gc_below(stable);
                }
            }
            SystemMessage::OperationsDict(_od) => {
                debug!("replica {} received operations-dict catch-up", self.id);
            }
            SystemMessage::PrimaryNotDominant(pnd) => {
                warn!(
                    "replica {} told it is not dominant by {}",
                    self.id, pnd.sender
                );
            }
            SystemMessage::Reply(_) => {
                // replicas never receive replies; a peer sending one is
                // either confused or malicious. Drop and move on.
                warn!("replica {} dropped an unexpected Reply", self.id);
            }
        }
        Ok(())
    }

    fn queue_executions(&self, updates: Vec<Update<S::Operation>>) -> Result<()> {
        for update in updates {
            self.executor.queue_update(update)?;
        }
        Ok(())
    }

    /// Handles an application result coming back off the executor
    /// thread, completing the REPLIED transition (§4.E).
    pub async fn handle_executed(&mut self, executed: ExecutedReply<S::Reply>) -> Result<()> {
        // `t` isn't threaded through `ExecutedReply`; look it up via the
        // decision log's stored pre-prepare for this sequence.
        let t = self
            .consensus
            .log()
            .slot(executed.seq)
            .and_then(|slot| slot.pre_prepare())
            .map(|pp| pp.message.request.t)
            .unwrap_or(0);
        let outbound = self.consensus.on_executed(executed.seq, executed.client_id, t, executed.reply)?;
        self.dispatch(outbound).await
    }

    /// Reacts to a loop-driven [`ReplicaEvent`]: a view/new-view timer
    /// firing, or an application result coming back off the executor.
    pub async fn handle_event(&mut self, event: ReplicaEvent<S::Reply>) -> Result<()> {
        match event {
            ReplicaEvent::ViewTimeout(view) => {
                if view == self.consensus.view() {
                    info!("replica {} timed out waiting on view {}", self.id, view);
                    self.trigger_view_change().await?;
                }
            }
            ReplicaEvent::NewViewTimeout(awaited) => {
                if self.consensus.view() < awaited {
                    info!(
                        "replica {} never saw new-view {} install, escalating",
                        self.id, awaited
                    );
                    self.trigger_view_change().await?;
                }
            }
            ReplicaEvent::Executed(executed) => {
                self.handle_executed(executed).await?;
            }
        }
        Ok(())
    }

    /// Broadcasts this replica's own `ViewChange` vote for the next
    /// view, carrying every `PreparedCert` it can produce as evidence
    /// (§4.F, steps 1-3).
    async fn trigger_view_change(&mut self) -> Result<()> {
        let next_view = std::cmp::max(self.consensus.view().next(), self.requested_view.next());
        self.requested_view = next_view;
        let last_committed = self
            .consensus
            .vv()
            .latest_of(self.id)
            .cloned()
            .unwrap_or_else(|| zero_entry(self.id));
        let p_set = self.consensus.prepared_certs();
        let vc = self.view_change.build_view_change(next_view, last_committed, p_set);
        self.dispatch(Outbound::ToAllReplicas(SystemMessage::ViewChange(vc))).await?;
        // if `next_view` itself fails to install within 2x the view
        // timeout, escalate further rather than wait forever (§4.F,
        // step 4).
        self.events.timeout(
            self.params.view_timeout * 2,
            ReplicaEvent::NewViewTimeout(next_view),
        );
        // our own vote, just registered above, may itself complete the
        // quorum if every peer's vote was already in.
        self.try_broadcast_new_view().await?;
        Ok(())
    }

    async fn try_broadcast_new_view(&mut self) -> Result<()> {
        let next_view = self.consensus.view().next();
        if next_view.primary(self.params.n) != self.id.id() as usize {
            // only the prospective primary of `next_view` assembles and
            // sends `NewView`; every other replica just waits for it.
            return Ok(());
        }
        if let Some(nv) = self.view_change.try_assemble_new_view(next_view) {
            info!("replica {} assembled new-view for {}", self.id, next_view);
            self.dispatch(Outbound::ToAllReplicas(SystemMessage::NewView(nv.clone()))).await?;
            // `dispatch` never loops a broadcast back to its own sender,
            // so the new primary installs the view it just assembled
            // directly rather than waiting for its own message.
            self.apply_new_view(nv).await?;
        }
        Ok(())
    }

    /// Installs `nv` locally: validates it against the current view,
    /// replays its `O`-set into the decision log, and dispatches
    /// whatever that replay triggers (§4.F, "On NEW-VIEW").
    async fn apply_new_view(&mut self, nv: NewViewMessage<S::Operation>) -> Result<()> {
        self.view_change.validate_new_view(self.consensus.view(), &nv)?;
        info!("replica {} adopting new view {}", self.id, nv.new_view);
        let fx = self.consensus.adopt_new_view(nv.new_view, nv.o_set);
        self.view_change.clear_votes_below(nv.new_view);
        self.requested_view = nv.new_view;
        self.dispatch_all(fx.outbound).await
    }
}

fn zero_entry(replica_id: NodeId) -> crate::version_vector::VersionVectorEntry {
    crate::version_vector::VersionVectorEntry {
        replica_id,
        view: View::INITIAL,
        seq: crate::ordering::SeqNo::ZERO,
        digest: crate::crypto::hash::Digest::zero(),
        signature: zero_signature(),
    }
}

fn zero_signature() -> crate::crypto::signature::Signature {
    crate::crypto::signature::Signature::from_bytes(
        &[0u8; crate::crypto::signature::Signature::LENGTH][..],
    )
    .expect("a constant-length all-zero buffer is always a valid Signature shape")
}

pub use checkpoint::{DEFAULT_COHESION_WINDOW, DEFAULT_INTERVAL};
