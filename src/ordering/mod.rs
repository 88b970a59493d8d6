//! Sequence and view numbering used across the consensus sub-protocols.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// A trait for types that carry a consensus sequence number.
pub trait Orderable {
    /// Returns the sequence number of this value.
    fn sequence_number(&self) -> SeqNo;
}

/// The sequence number attributed to a client request once a primary
/// orders it, i.e. the `n` in `(view, seq)`.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Default)]
pub struct SeqNo(pub(crate) u64);

impl SeqNo {
    /// The first sequence number ever attributed to a request.
    pub const ZERO: SeqNo = SeqNo(0);

    /// Returns the following sequence number.
    #[inline]
    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    /// Returns the sequence number `n` slots ahead of `self`.
    #[inline]
    pub fn next_n(self, n: usize) -> SeqNo {
        SeqNo(self.0 + n as u64)
    }

    /// Returns the number of slots between `self` and `other`, or `None`
    /// if `other` is ahead of `self`.
    #[inline]
    pub fn index_from(self, other: SeqNo) -> Option<usize> {
        self.0.checked_sub(other.0).map(|d| d as usize)
    }
}

impl From<u64> for SeqNo {
    #[inline]
    fn from(n: u64) -> SeqNo {
        SeqNo(n)
    }
}

impl From<SeqNo> for u64 {
    #[inline]
    fn from(n: SeqNo) -> u64 {
        n.0
    }
}

impl std::fmt::Display for SeqNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The view number, identifying the replica currently acting as primary.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Default)]
pub struct View(pub(crate) u64);

impl View {
    /// The initial view of a freshly bootstrapped system.
    pub const INITIAL: View = View(0);

    /// Returns the following view.
    #[inline]
    pub fn next(self) -> View {
        View(self.0 + 1)
    }

    /// Computes the primary of this view, given `n` replicas.
    #[inline]
    pub fn primary(self, n: usize) -> usize {
        (self.0 % n as u64) as usize
    }
}

impl From<u64> for View {
    #[inline]
    fn from(v: u64) -> View {
        View(v)
    }
}

impl From<View> for u64 {
    #[inline]
    fn from(v: View) -> u64 {
        v.0
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_next_is_monotone() {
        let a = SeqNo::ZERO;
        let b = a.next();
        assert!(b > a);
    }

    #[test]
    fn view_primary_wraps_around_n() {
        let v = View::from(5);
        assert_eq!(v.primary(4), 1);
    }
}
