//! Tiny process-wide bookkeeping, kept deliberately minimal.
//!
//! The only mutable global state in this crate is the one-shot flag
//! guarding async-runtime/socket bring-up (see [`crate::init`]); every
//! other piece of state is owned by a `Replica` or `Client` instance,
//! configured explicitly rather than assigned from a hidden counter.

use std::sync::atomic::{AtomicBool, Ordering};

/// A one-shot, idempotent boolean flag.
pub struct Flag(AtomicBool);

impl Flag {
    /// Creates a new, unset `Flag`.
    pub const fn new() -> Self {
        Flag(AtomicBool::new(false))
    }

    /// Returns whether the flag is currently set.
    pub fn test(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sets the flag.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Unsets the flag.
    pub fn unset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}
