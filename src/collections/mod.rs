//! Collection type aliases used across the crate.
//!
//! The hashing algorithm backing `HashMap`/`HashSet` is chosen at compile
//! time via Cargo features, mirroring upstream's approach of letting
//! deployments trade DoS-resistance for raw speed.

use std::collections::hash_map::RandomState;

#[cfg(feature = "collections_randomstate_twox_hash")]
type RandState = std::hash::BuildHasherDefault<twox_hash::XxHash64>;

#[cfg(feature = "collections_randomstate_std")]
type RandState = RandomState;

#[cfg(not(any(
    feature = "collections_randomstate_twox_hash",
    feature = "collections_randomstate_std",
)))]
type RandState = RandomState;

/// A `HashMap` using this crate's configured hashing algorithm.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandState>;

/// A `HashSet` using this crate's configured hashing algorithm.
pub type HashSet<K> = std::collections::HashSet<K, RandState>;

/// An insertion-ordered map, used where FIFO iteration over pending
/// client requests matters (see [`crate::log`]).
pub type OrderedMap<K, V> = linked_hash_map::LinkedHashMap<K, V, RandState>;

/// Returns a new, empty `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    Default::default()
}

/// Returns a new, empty `HashMap` with the given initial capacity.
pub fn hash_map_capacity<K, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, Default::default())
}

/// Returns a new, empty `HashSet`.
pub fn hash_set<K>() -> HashSet<K> {
    Default::default()
}

/// Returns a new, empty `OrderedMap`.
pub fn ordered_map<K: std::hash::Hash + Eq, V>() -> OrderedMap<K, V> {
    OrderedMap::default()
}
