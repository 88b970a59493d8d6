//! Cryptographic primitives used by the consensus engine: content-addressed
//! digests for the hash chain, and detached signatures for every message
//! placed on the wire.

pub mod hash;
pub mod signature;
