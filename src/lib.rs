//! A BFT2F-family Byzantine fault-tolerant replicated state machine.
//!
//! `f`-bounded malicious replicas cannot violate agreement on the
//! sequence of committed client operations; even a fully compromised
//! primary only admits *fork* consistency, with divergent histories
//! detectable via the version vectors carried in every reply.

pub mod async_runtime;
pub mod checkpoint;
pub mod collections;
pub mod communication;
pub mod config;
pub mod consensus;
pub mod core;
pub mod demo;
pub mod crypto;
pub mod error;
pub mod executable;
pub mod globals;
pub mod hash_chain;
pub mod log;
pub mod ordering;
pub mod reply_cache;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod timeouts;
pub mod version_vector;
pub mod view_change;

use error::*;
use globals::Flag;

static INITIALIZED: Flag = Flag::new();

/// Configures the one-time bring-up of process-wide resources.
pub struct InitConfig {
    /// Number of worker threads used by the async runtime.
    pub async_threads: usize,
}

/// A handle to the global data initialized by [`init`]; dropping it
/// tears the global data back down.
pub struct InitGuard;

/// Initializes the async runtime. Idempotent: a second call while the
/// first `InitGuard` is alive is a no-op, returning `None`.
pub fn init(c: InitConfig) -> Result<Option<InitGuard>> {
    if INITIALIZED.test() {
        return Ok(None);
    }
    async_runtime::init(c.async_threads)?;
    INITIALIZED.set();
    Ok(Some(InitGuard))
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        let _ = teardown();
    }
}

fn teardown() -> Result<()> {
    INITIALIZED.unset();
    async_runtime::drop()?;
    Ok(())
}
