//! Stable-point marking and garbage collection (§4.G).
//!
//! Every `K` committed sequences a replica broadcasts a `Checkpoint`;
//! once `2f+1` matching checkpoints are held for the same `(seq,
//! vv_snapshot digest)`, the checkpoint is stable and every store
//! bounded by sequence number — the hash chain, the decision log, the
//! reply cache — is truncated below it.

use crate::collections::HashMap;
use crate::communication::message::{CheckpointMessage, ReplyMessage};
use crate::communication::NodeId;
use crate::crypto::hash::Digest;
use crate::ordering::SeqNo;
use crate::version_vector::VersionVectorEntry;

/// The checkpoint interval `K` (default from §4.G).
pub const DEFAULT_INTERVAL: u64 = 100;
/// The checkpoint cohesion window `I` (default from §4.G).
pub const DEFAULT_COHESION_WINDOW: u64 = 128;

fn digest_of_vv_snapshot(vv_snapshot: &[VersionVectorEntry]) -> Digest {
    let mut ctx = Digest::context();
    for entry in vv_snapshot {
        ctx.update(&entry.replica_id.id().to_le_bytes());
        ctx.update(&u64::from(entry.view).to_le_bytes());
        ctx.update(&u64::from(entry.seq).to_le_bytes());
        ctx.update(entry.digest.as_ref());
    }
    ctx.finish()
}

/// Builds the `E` set for a checkpoint at `seq`: signed entries for
/// every principal whose latest known `seq <= n - 2I` (the corrected
/// condition; see `SPEC_FULL.md` §9 on the source's `vv.is_empty()` bug).
pub fn build_e_set(
    vv: &crate::version_vector::VersionVector,
    principals: impl Iterator<Item = NodeId>,
    n: SeqNo,
    cohesion_window: u64,
) -> Vec<VersionVectorEntry> {
    let floor = u64::from(n).saturating_sub(2 * cohesion_window);
    principals
        .filter_map(|p| vv.latest_of(p))
        .filter(|entry| u64::from(entry.seq) <= floor)
        .cloned()
        .collect()
}

/// Builds the outgoing `Checkpoint` message for this replica at `seq`.
pub fn build_checkpoint<P: Clone>(
    replica_id: NodeId,
    seq: SeqNo,
    rcache_snapshot: crate::collections::HashMap<NodeId, (u64, ReplyMessage<P>)>,
    vv_snapshot: Vec<VersionVectorEntry>,
    e_set: Vec<VersionVectorEntry>,
) -> CheckpointMessage<P> {
    CheckpointMessage {
        replica_id,
        seq,
        rcache_snapshot: rcache_snapshot.into_iter().map(|(k, (t, r))| (k, t, r)).collect(),
        vv_snapshot,
        e_set,
    }
}

/// Collects incoming `Checkpoint`s and detects stability.
pub struct CheckpointStore<P> {
    f: usize,
    /// keyed by (seq, digest-of-vv_snapshot) -> distinct signers seen.
    votes: HashMap<(SeqNo, Digest), HashMap<NodeId, CheckpointMessage<P>>>,
    stable_floor: SeqNo,
}

impl<P: Clone> CheckpointStore<P> {
    pub fn new(f: usize) -> Self {
        Self { f, votes: crate::collections::hash_map(), stable_floor: SeqNo::ZERO }
    }

    /// The highest sequence number known to be checkpoint-stable.
    pub fn stable_floor(&self) -> SeqNo {
        self.stable_floor
    }

    /// Records an incoming `Checkpoint`; returns `Some(seq)` the first
    /// time this causes `(seq, vv digest)` to reach a `2f+1` quorum.
    pub fn add(&mut self, msg: CheckpointMessage<P>) -> Option<SeqNo> {
        let key = (msg.seq, digest_of_vv_snapshot(&msg.vv_snapshot));
        let signer = msg.replica_id;
        let slot = self.votes.entry(key).or_insert_with(crate::collections::hash_map);
        let was_stable_already = slot.len() >= 2 * self.f + 1;
        slot.insert(signer, msg);

        if !was_stable_already && slot.len() >= 2 * self.f + 1 && key.0 > self.stable_floor {
            self.stable_floor = key.0;
            return Some(key.0);
        }
        None
    }

    /// Drops vote bookkeeping for checkpoints below `floor`, once they
    /// can no longer matter.
    pub fn gc_below(&mut self, floor: SeqNo) {
        self.votes.retain(|&(seq, _), _| seq >= floor);
    }
}
