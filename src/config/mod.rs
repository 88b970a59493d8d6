//! CLI flag + environment variable configuration wiring (§4.K).
//!
//! Nothing in the protocol engine reads the environment directly; the
//! two binaries call into this module once at startup and thread the
//! resulting values down as plain parameters.

use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::communication::NodeId;
use crate::crypto::signature::KeyPair;
use crate::error::*;

pub const DEFAULT_VIEW_TIMEOUT_MS: u64 = 5_000;
/// The decision log watermark `W` (§9 Open Question: not present in the
/// source, introduced as a required, configurable parameter).
pub const DEFAULT_WATERMARK: u64 = 128;

/// Parses a `id@host:port,id@host:port,…` list into an address map, the
/// format taken by `--peers`/`--clients`/`--replicas`.
pub fn parse_node_list(raw: &str) -> Result<BTreeMap<NodeId, SocketAddr>> {
    let mut out = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, addr) = entry
            .split_once('@')
            .ok_or_else(|| format!("malformed node entry {:?}, expected id@host:port", entry))
            .wrapped(ErrorKind::Configuration)?;
        let id: u32 = id.parse().wrapped(ErrorKind::Configuration)?;
        let addr: SocketAddr = addr.parse().wrapped(ErrorKind::Configuration)?;
        out.insert(NodeId(id), addr);
    }
    Ok(out)
}

/// Loads this node's ed25519 key pair from the raw 32-byte seed at the
/// path named by `BFT_KEYSTORE`.
///
/// Provisioning and distributing that seed (and peers' public keys) is
/// out of scope here; this only reads whatever material is already on
/// disk.
pub fn load_keypair() -> Result<KeyPair> {
    let path = env::var("BFT_KEYSTORE")
        .map_err(|_| "BFT_KEYSTORE is not set")
        .wrapped(ErrorKind::Configuration)?;
    let bytes = std::fs::read(&path).wrapped(ErrorKind::Configuration)?;
    KeyPair::from_bytes(&bytes)
}

fn env_override_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(v) => v.parse().wrapped(ErrorKind::Configuration),
        Err(_) => Ok(default),
    }
}

/// Resolves `BFT_CHECKPOINT_INTERVAL`, falling back to the protocol default.
pub fn checkpoint_interval() -> Result<u64> {
    env_override_u64("BFT_CHECKPOINT_INTERVAL", crate::checkpoint::DEFAULT_INTERVAL)
}

/// Resolves `BFT_WATERMARK`, falling back to the protocol default.
pub fn watermark() -> Result<u64> {
    env_override_u64("BFT_WATERMARK", DEFAULT_WATERMARK)
}

/// Resolves `BFT_VIEW_TIMEOUT` (milliseconds), falling back to the default.
pub fn view_timeout() -> Result<Duration> {
    Ok(Duration::from_millis(env_override_u64(
        "BFT_VIEW_TIMEOUT",
        DEFAULT_VIEW_TIMEOUT_MS,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_node_list() {
        let parsed = parse_node_list("0@127.0.0.1:9000,1@127.0.0.1:9001").unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains_key(&NodeId(0)));
        assert!(parsed.contains_key(&NodeId(1)));
    }

    #[test]
    fn rejects_an_entry_without_an_id() {
        assert!(parse_node_list("127.0.0.1:9000").is_err());
    }
}
