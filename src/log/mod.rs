//! Per-replica message stores: the pre-prepare/prepare/commit tables
//! keyed by `(view, seq)`, the per-sequence consensus slot state
//! machine, and the view-change vote store — the bookkeeping underneath
//! the replica state machine of §4.E.

use crate::collections::HashMap;
use crate::communication::message::{
    CommitMessage, PrePrepareMessage, PrepareMessage, StoredMessage, ViewChangeMessage,
};
use crate::crypto::hash::Digest;
use crate::ordering::{SeqNo, View};

/// The state of a single `(view, seq)` slot, per §4.E.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SlotState {
    Empty,
    PrePrepared,
    Prepared,
    Committed,
    Replied,
}

/// A single sequence number's consensus bookkeeping within one view.
pub struct ConsensusSlot<O> {
    state: SlotState,
    pre_prepare: Option<StoredMessage<PrePrepareMessage<O>>>,
    prepares: Vec<StoredMessage<PrepareMessage>>,
    commits: Vec<StoredMessage<CommitMessage>>,
}

impl<O> Default for ConsensusSlot<O> {
    fn default() -> Self {
        Self {
            state: SlotState::Empty,
            pre_prepare: None,
            prepares: Vec::new(),
            commits: Vec::new(),
        }
    }
}

impl<O> ConsensusSlot<O> {
    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn pre_prepare(&self) -> Option<&StoredMessage<PrePrepareMessage<O>>> {
        self.pre_prepare.as_ref()
    }

    pub fn prepares(&self) -> &[StoredMessage<PrepareMessage>] {
        &self.prepares
    }

    pub fn commits(&self) -> &[StoredMessage<CommitMessage>] {
        &self.commits
    }

    /// Records the slot's pre-prepare, rejecting a conflicting one for
    /// the same `(view, seq)` (§4.E "MUST NOT pre-prepare two different
    /// requests").
    pub fn set_pre_prepare(&mut self, msg: StoredMessage<PrePrepareMessage<O>>) -> bool {
        if let Some(existing) = &self.pre_prepare {
            return existing.message.digest == msg.message.digest;
        }
        self.pre_prepare = Some(msg);
        if self.state == SlotState::Empty {
            self.state = SlotState::PrePrepared;
        }
        true
    }

    /// Records a matching prepare from a distinct sender; returns
    /// `false` if `from` has already prepared a *different* digest at
    /// this slot (local fatal assertion per §4.E).
    pub fn add_prepare(&mut self, msg: StoredMessage<PrepareMessage>) -> bool {
        let from = msg.header.from();
        if let Some(conflicting) = self
            .prepares
            .iter()
            .find(|p| p.header.from() == from && p.message.digest != msg.message.digest)
        {
            let _ = conflicting;
            return false;
        }
        if !self.prepares.iter().any(|p| p.header.from() == from) {
            self.prepares.push(msg);
        }
        true
    }

    /// Records a matching commit from a distinct sender.
    pub fn add_commit(&mut self, msg: StoredMessage<CommitMessage>) {
        let from = msg.header.from();
        if !self.commits.iter().any(|c| c.header.from() == from) {
            self.commits.push(msg);
        }
    }

    /// Counts prepares matching `digest`, excluding the slot owner's own
    /// (the pre-prepare sender implicitly agrees and is not a distinct
    /// preparer).
    pub fn matching_prepares(&self, digest: Digest) -> usize {
        self.prepares.iter().filter(|p| p.message.digest == digest).count()
    }

    /// Counts commits matching `(digest, hcd)`.
    pub fn matching_commits(&self, digest: Digest, hcd: Digest) -> usize {
        self.commits
            .iter()
            .filter(|c| c.message.digest == digest && c.message.hcd == hcd)
            .count()
    }

    pub fn advance_to(&mut self, state: SlotState) {
        self.state = state;
    }

    /// Builds the `PreparedCert` evidence for a view change, if this
    /// slot reached `PREPARED` or later.
    pub fn prepared_cert(&self) -> Option<crate::communication::message::PreparedCert<O>>
    where
        O: Clone,
    {
        let pre_prepare = self.pre_prepare.clone()?;
        if self.state == SlotState::Empty || self.state == SlotState::PrePrepared {
            return None;
        }
        Some(crate::communication::message::PreparedCert {
            pre_prepare,
            prepares: self.prepares.clone(),
        })
    }
}

impl<O: Clone> Clone for ConsensusSlot<O> {
    fn clone(&self) -> Self {
        Self {
            state: self.state,
            pre_prepare: self.pre_prepare.clone(),
            prepares: self.prepares.clone(),
            commits: self.commits.clone(),
        }
    }
}

/// A watermark-bounded, view-scoped table of consensus slots (§4.E,
/// invariant 6 "Watermark bound"). A fresh `DecisionLog` is created for
/// every view; slots for sequences already committed in a previous view
/// live only in the `HashChainDigest`/`ReplyCache`, not here.
pub struct DecisionLog<O> {
    view: View,
    low: SeqNo,
    watermark: u64,
    slots: HashMap<SeqNo, ConsensusSlot<O>>,
}

impl<O> DecisionLog<O> {
    /// Creates a log for `view`, windowed around `low` with the given
    /// watermark `W` (§4.E, default 128).
    pub fn new(view: View, low: SeqNo, watermark: u64) -> Self {
        Self { view, low, watermark, slots: crate::collections::hash_map() }
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// Returns whether `seq` falls inside `[low - W, low + W]`.
    pub fn in_window(&self, seq: SeqNo) -> bool {
        let seq = u64::from(seq);
        let low = u64::from(self.low);
        let floor = low.saturating_sub(self.watermark);
        let ceil = low + self.watermark;
        (floor..=ceil).contains(&seq)
    }

    /// Advances the low watermark, e.g. once a contiguous prefix has
    /// committed or a checkpoint stabilizes.
    pub fn advance_low(&mut self, new_low: SeqNo) {
        if new_low > self.low {
            self.low = new_low;
        }
    }

    /// Returns the slot for `seq`, creating an empty one if needed.
    pub fn slot_mut(&mut self, seq: SeqNo) -> &mut ConsensusSlot<O> {
        self.slots.entry(seq).or_insert_with(ConsensusSlot::default)
    }

    pub fn slot(&self, seq: SeqNo) -> Option<&ConsensusSlot<O>> {
        self.slots.get(&seq)
    }

    /// Drops every slot below `floor`, as part of checkpoint GC (§4.G).
    pub fn gc_below(&mut self, floor: SeqNo) {
        self.slots.retain(|&seq, _| seq >= floor);
    }

    /// Iterates every tracked slot, used to gather `PreparedCert`
    /// evidence when assembling a `ViewChange` (§4.F, steps 1-3).
    pub fn slots(&self) -> impl Iterator<Item = (SeqNo, &ConsensusSlot<O>)> {
        self.slots.iter().map(|(&seq, slot)| (seq, slot))
    }
}

/// Per-`new_view` store of incoming `ViewChange` votes, consulted by
/// the prospective primary while assembling a `NewView` (§4.F).
pub struct ViewChangeStore<O> {
    votes: HashMap<View, Vec<StoredMessage<ViewChangeMessage<O>>>>,
}

impl<O> Default for ViewChangeStore<O> {
    fn default() -> Self {
        Self { votes: crate::collections::hash_map() }
    }
}

impl<O> ViewChangeStore<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a `ViewChange`, ignoring a second vote from the same
    /// sender for the same `new_view`.
    pub fn add(&mut self, new_view: View, msg: StoredMessage<ViewChangeMessage<O>>) {
        let votes = self.votes.entry(new_view).or_insert_with(Vec::new);
        let from = msg.header.from();
        if !votes.iter().any(|v| v.header.from() == from) {
            votes.push(msg);
        }
    }

    pub fn votes_for(&self, new_view: View) -> &[StoredMessage<ViewChangeMessage<O>>] {
        self.votes.get(&new_view).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn clear_below(&mut self, floor: View) {
        self.votes.retain(|&v, _| v >= floor);
    }
}
