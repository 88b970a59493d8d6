//! `blake3`-backed digests, used as the sole authenticated fingerprint of
//! protocol history (see [`crate::hash_chain`]).

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::error::*;

/// A fixed-size, content-addressed digest.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    /// The length, in bytes, of a digest.
    pub const LENGTH: usize = 32;

    /// The all-zero digest, used as the `prev` field of the genesis
    /// hash-chain block.
    pub const fn zero() -> Self {
        Digest([0; Self::LENGTH])
    }

    /// Builds a `Digest` from a byte slice of the correct length.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH {
            return Err("Digest has an invalid length").wrapped(ErrorKind::CryptoHash);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw_bytes);
        Ok(Digest(inner))
    }

    /// Computes the digest of an arbitrary byte buffer.
    pub fn from_data(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Digest(*hash.as_bytes())
    }

    /// An incremental digest context, for hashing data piecewise.
    pub fn context() -> Context {
        Context(blake3::Hasher::new())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

/// An incremental hashing context, used to fold several buffers into a
/// single digest without an intermediate allocation.
pub struct Context(blake3::Hasher);

impl Context {
    /// Feeds more data into the hash.
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    /// Finalizes the context, producing a `Digest`.
    pub fn finish(&self) -> Digest {
        Digest(*self.0.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_data_same_digest() {
        let a = Digest::from_data(b"hello");
        let b = Digest::from_data(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn different_data_different_digest() {
        let a = Digest::from_data(b"hello");
        let b = Digest::from_data(b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn context_matches_one_shot() {
        let mut ctx = Digest::context();
        ctx.update(b"hel").update(b"lo");
        assert_eq!(ctx.finish(), Digest::from_data(b"hello"));
    }
}
