//! `ring`-backed ed25519 signatures over encoded message payloads.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use ring::signature::{Ed25519KeyPair, KeyPair as _, UnparsedPublicKey, ED25519};

use crate::error::*;

/// A detached ed25519 signature.
#[derive(Copy, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Signature([u8; Signature::LENGTH]);

impl Signature {
    /// The length, in bytes, of a signature.
    pub const LENGTH: usize = 64;

    /// Builds a `Signature` from a byte slice of the correct length.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH {
            return Err("Signature has an invalid length").wrapped(ErrorKind::CryptoSignature);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw_bytes);
        Ok(Signature(inner))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for Signature {}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(..)")
    }
}

/// A node's ed25519 public key, used to verify signatures it produced.
#[derive(Clone)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    /// Verifies that `signature` is a valid ed25519 signature of `msg`
    /// under this public key.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<()> {
        let key = UnparsedPublicKey::new(&ED25519, &self.0);
        key.verify(msg, signature.as_ref())
            .simple(ErrorKind::CryptoSignature)
    }
}

impl From<&KeyPair> for PublicKey {
    fn from(kp: &KeyPair) -> Self {
        PublicKey(kp.0.public_key().as_ref().to_vec())
    }
}

/// A node's secret + public ed25519 key pair.
pub struct KeyPair(Ed25519KeyPair);

impl KeyPair {
    /// Builds a `KeyPair` from a 32-byte ed25519 seed.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        let kp = Ed25519KeyPair::from_seed_unchecked(raw_bytes)
            .simple(ErrorKind::CryptoSignature)?;
        Ok(KeyPair(kp))
    }

    /// Returns this key pair's public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(self)
    }

    /// Signs `msg`, producing a detached `Signature`.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        let sig = self.0.sign(msg);
        // ed25519 signatures are always `Signature::LENGTH` bytes long
        Signature::from_bytes(sig.as_ref()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::{OsRng, RngCore};

    fn random_keypair() -> KeyPair {
        let mut seed = [0; 32];
        OsRng.fill_bytes(&mut seed[..]);
        KeyPair::from_bytes(&seed[..]).unwrap()
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let kp = random_keypair();
        let pk = kp.public_key();
        let sig = kp.sign(b"some message");
        assert!(pk.verify(b"some message", &sig).is_ok());
    }

    #[test]
    fn verify_fails_on_tampered_message() {
        let kp = random_keypair();
        let pk = kp.public_key();
        let sig = kp.sign(b"some message");
        assert!(pk.verify(b"some other message", &sig).is_err());
    }
}
