//! Per-principal version vectors: the fork-detection primitive.
//!
//! A `VersionVector` tracks, for every principal (replica or client) in
//! the system, the ordered sequence of signed entries it has asserted
//! about the authenticated history. Two correct clients that ever see
//! different [`VersionVector::current_system_state`] values for the
//! same sequence number have witnessed a fork.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::communication::NodeId;
use crate::crypto::hash::Digest;
use crate::crypto::signature::Signature;
use crate::ordering::{SeqNo, View};

/// A single principal's signed assertion about the authenticated
/// history at a given `(view, seq)`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct VersionVectorEntry {
    pub replica_id: NodeId,
    pub view: View,
    pub seq: SeqNo,
    pub digest: Digest,
    pub signature: Signature,
}

impl VersionVectorEntry {
    /// Returns the `(view, seq)` pair entries are ordered by.
    pub fn order_key(&self) -> (View, SeqNo) {
        (self.view, self.seq)
    }
}

/// The canonical byte sequence a `VersionVectorEntry` signs over:
/// `replica_id ‖ view ‖ seq ‖ digest`. Shared by every module that
/// produces or verifies a signed entry, so signatures stay consistent
/// across the consensus, view-change, and checkpoint engines.
pub fn entry_signing_bytes(replica_id: NodeId, view: View, seq: SeqNo, digest: Digest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 8 + 8 + Digest::LENGTH);
    buf.extend_from_slice(&replica_id.id().to_le_bytes());
    buf.extend_from_slice(&u64::from(view).to_le_bytes());
    buf.extend_from_slice(&u64::from(seq).to_le_bytes());
    buf.extend_from_slice(digest.as_ref());
    buf
}

/// Maps every principal to its ordered sequence of [`VersionVectorEntry`]
/// assertions.
///
/// Entries for a given principal are kept non-decreasing in
/// `(view, seq)`; [`VersionVector::update`] silently ignores an entry
/// that would regress a principal's latest known state, since a correct
/// principal never un-asserts progress.
#[derive(Default)]
pub struct VersionVector {
    entries: crate::collections::HashMap<NodeId, Vec<VersionVectorEntry>>,
}

impl VersionVector {
    /// Creates an empty version vector.
    pub fn new() -> Self {
        Self { entries: crate::collections::hash_map() }
    }

    /// Records `entry` as the latest assertion from `entry.replica_id`,
    /// unless it would regress that principal's known `(view, seq)`.
    pub fn update(&mut self, entry: VersionVectorEntry) {
        let principal = entry.replica_id;
        let slot = self.entries.entry(principal).or_insert_with(Vec::new);
        if let Some(latest) = slot.last() {
            if entry.order_key() <= latest.order_key() {
                return;
            }
        }
        slot.push(entry);
    }

    /// Returns every entry ever recorded for `principal`, oldest first.
    pub fn entries_of(&self, principal: NodeId) -> &[VersionVectorEntry] {
        self.entries
            .get(&principal)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns the latest known entry for `principal`, if any.
    pub fn latest_of(&self, principal: NodeId) -> Option<&VersionVectorEntry> {
        self.entries.get(&principal).and_then(|v| v.last())
    }

    /// Iterates over every principal this vector has ever recorded an
    /// entry for.
    pub fn principals(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    /// Returns every principal's latest entry, suitable for a
    /// checkpoint's `vv_snapshot` (§4.G).
    pub fn latest_entries(&self) -> Vec<VersionVectorEntry> {
        self.entries.values().filter_map(|v| v.last()).cloned().collect()
    }

    /// The fork-detection primitive: returns the `(seq, digest)` that
    /// appears as the latest entry of at least `2f+1` distinct
    /// principals, ties broken by lowest `replica_id`; `None` if no
    /// such quorum exists.
    pub fn current_system_state(&self, f: usize) -> Option<VersionVectorEntry> {
        let quorum = 2 * f + 1;

        // group latest entries by (seq, digest), keeping the
        // lowest-replica_id representative for tie-breaking.
        let mut groups: crate::collections::HashMap<(SeqNo, Digest), Vec<&VersionVectorEntry>> =
            crate::collections::hash_map();

        for entries in self.entries.values() {
            if let Some(latest) = entries.last() {
                groups
                    .entry((latest.seq, latest.digest))
                    .or_insert_with(Vec::new)
                    .push(latest);
            }
        }

        groups
            .into_values()
            .filter(|members| members.len() >= quorum)
            .filter_map(|members| members.into_iter().min_by_key(|e| e.replica_id))
            .min_by_key(|e| e.replica_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signature::{KeyPair, Signature};

    fn sign_anything() -> Signature {
        // only used to fill out the entry's signature field; correctness
        // of signatures is exercised in `crypto::signature`.
        let seed = [7u8; 32];
        let kp = KeyPair::from_bytes(&seed).unwrap();
        kp.sign(b"vv-entry")
    }

    fn entry(replica: u32, view: u64, seq: u64, digest: Digest) -> VersionVectorEntry {
        VersionVectorEntry {
            replica_id: NodeId(replica),
            view: View::from(view),
            seq: SeqNo::from(seq),
            digest,
            signature: sign_anything(),
        }
    }

    #[test]
    fn update_ignores_regression() {
        let mut vv = VersionVector::new();
        let d = Digest::from_data(b"x");
        vv.update(entry(0, 0, 5, d));
        vv.update(entry(0, 0, 3, d));
        assert_eq!(vv.latest_of(NodeId(0)).unwrap().seq, SeqNo::from(5));
    }

    #[test]
    fn current_system_state_needs_quorum() {
        let mut vv = VersionVector::new();
        let d = Digest::from_data(b"x");
        vv.update(entry(0, 0, 1, d));
        vv.update(entry(1, 0, 1, d));
        // f = 1 => quorum of 3; only two entries recorded so far.
        assert!(vv.current_system_state(1).is_none());
        vv.update(entry(2, 0, 1, d));
        let css = vv.current_system_state(1).unwrap();
        assert_eq!(css.seq, SeqNo::from(1));
        assert_eq!(css.digest, d);
    }

    #[test]
    fn current_system_state_breaks_ties_by_lowest_replica_id() {
        let mut vv = VersionVector::new();
        let d1 = Digest::from_data(b"x");
        let d2 = Digest::from_data(b"y");
        // two disjoint quorums at the same seq, different digests: no
        // single (seq, digest) pair reaches 2f+1, so no fork is
        // (falsely) reported as a system state here.
        vv.update(entry(0, 0, 1, d1));
        vv.update(entry(1, 0, 1, d1));
        vv.update(entry(2, 0, 1, d2));
        assert!(vv.current_system_state(1).is_none());
    }
}
