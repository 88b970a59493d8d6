//! The hash-chain digest: the sole authenticated fingerprint of a
//! replica's committed history.
//!
//! Each block commits to its sequence number, its request's encoded
//! bytes, and the previous block's digest, closing the reordering
//! attack the source implementation's `data ‖ prev` preimage left open
//! (see `SPEC_FULL.md` §9).

use crate::crypto::hash::Digest;
use crate::error::*;
use crate::ordering::SeqNo;

/// A single link in the hash chain.
#[derive(Debug, Clone)]
pub struct HashChainBlock {
    pub seq: SeqNo,
    pub data: Vec<u8>,
    pub prev: Digest,
    pub h: Digest,
}

impl HashChainBlock {
    fn compute(seq: SeqNo, data: &[u8], prev: Digest) -> Digest {
        Digest::context()
            .update(&u64::from(seq).to_le_bytes())
            .update(data)
            .update(prev.as_ref())
            .finish()
    }
}

/// An append-only, contiguous sequence of [`HashChainBlock`]s.
///
/// Blocks are addressed by their absolute sequence number; truncation
/// (driven by the checkpoint engine, §4.G) only ever drops a contiguous
/// prefix, so `digest_at` remains `O(1)` via an offset into `blocks`.
#[derive(Default)]
pub struct HashChainDigest {
    /// Absolute sequence number of `blocks[0]`, advanced by truncation.
    base: SeqNo,
    blocks: Vec<HashChainBlock>,
}

impl HashChainDigest {
    /// Creates an empty hash chain, as held by a freshly booted replica.
    pub fn new() -> Self {
        Self { base: SeqNo::ZERO, blocks: Vec::new() }
    }

    /// Appends a new block for `seq`, hashing `data` together with the
    /// previous block's digest. `seq` must equal `len()`, i.e. blocks
    /// are appended strictly in sequence order.
    pub fn append(&mut self, seq: SeqNo, data: Vec<u8>) -> Result<Digest> {
        let expected = self.base.next_n(self.blocks.len());
        if seq != expected {
            return Err(format!(
                "hash chain sequence gap: expected {}, got {}",
                expected, seq,
            ))
            .wrapped(ErrorKind::HashChain);
        }
        let prev = self.blocks.last().map(|b| b.h).unwrap_or(Digest::zero());
        let h = HashChainBlock::compute(seq, &data, prev);
        self.blocks.push(HashChainBlock { seq, data, prev, h });
        Ok(h)
    }

    /// Returns the digest of the most recently appended block.
    pub fn last(&self) -> Option<Digest> {
        self.blocks.last().map(|b| b.h)
    }

    /// Returns the number of blocks ever committed, including truncated
    /// ones (i.e. this is the next expected sequence number).
    pub fn len(&self) -> usize {
        self.base.next_n(self.blocks.len()).index_from(SeqNo::ZERO).unwrap()
    }

    /// Returns whether the chain holds no live blocks (note: truncation
    /// does not make this `true` again; it only applies to a fresh chain).
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.base == SeqNo::ZERO
    }

    /// Returns the digest committed at `seq`, if still retained.
    pub fn digest_at(&self, seq: SeqNo) -> Option<Digest> {
        let idx = seq.index_from(self.base)?;
        self.blocks.get(idx).map(|b| b.h)
    }

    /// Drops every block with `seq < floor`, retaining `floor` itself.
    /// A no-op if `floor` is at or below the current base.
    pub fn truncate_below(&mut self, floor: SeqNo) {
        let drop_count = match floor.index_from(self.base) {
            Some(n) => n.min(self.blocks.len()),
            None => return,
        };
        self.blocks.drain(..drop_count);
        self.base = self.base.next_n(drop_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_requires_contiguous_sequence() {
        let mut hcd = HashChainDigest::new();
        hcd.append(SeqNo::ZERO, b"a".to_vec()).unwrap();
        let err = hcd.append(SeqNo::from(5), b"b".to_vec()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HashChain);
    }

    #[test]
    fn chained_digest_depends_on_seq_and_prev() {
        let mut a = HashChainDigest::new();
        a.append(SeqNo::ZERO, b"x".to_vec()).unwrap();
        let h1 = a.append(SeqNo::from(1), b"y".to_vec()).unwrap();

        // same data at a different sequence number must hash differently
        let mut b = HashChainDigest::new();
        b.append(SeqNo::from(1), b"x".to_vec()).unwrap_err();
        let _ = b; // constructing b's genesis at seq 1 is itself a gap

        let mut c = HashChainDigest::new();
        c.append(SeqNo::ZERO, b"x".to_vec()).unwrap();
        c.append(SeqNo::from(1), b"z".to_vec()).unwrap();
        assert_ne!(h1, c.last().unwrap());
    }

    #[test]
    fn truncate_below_drops_prefix_but_keeps_floor() {
        let mut hcd = HashChainDigest::new();
        for i in 0..5u64 {
            hcd.append(SeqNo::from(i), vec![i as u8]).unwrap();
        }
        hcd.truncate_below(SeqNo::from(3));
        assert!(hcd.digest_at(SeqNo::from(2)).is_none());
        assert!(hcd.digest_at(SeqNo::from(3)).is_some());
        assert_eq!(hcd.len(), 5);
    }
}
