//! Async runtime bootstrap, mirroring the teacher crate's pluggable
//! `bft::async_runtime` module (only the `tokio` backend is carried here).

use std::future::Future;
use std::sync::OnceLock;

use crate::error::*;

static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

/// A spawned asynchronous task's join handle.
pub type JoinHandle<T> = tokio::task::JoinHandle<T>;

/// Initializes the global async runtime with `num_threads` worker threads.
pub fn init(num_threads: usize) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_threads)
        .thread_name("bft2f-worker")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()
        .simple(ErrorKind::Error)?;
    // ok() is fine here: `init()` is idempotent at the call site via
    // `globals::Flag`, so a second call racing in is harmless.
    let _ = RUNTIME.set(rt);
    Ok(())
}

/// Tears down the global async runtime.
///
/// A no-op: `tokio::runtime::Runtime` shuts down its worker threads when
/// dropped, and we never drop the process-wide static.
pub fn drop() -> Result<()> {
    Ok(())
}

/// Spawns a new asynchronous task onto the global runtime.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    runtime().spawn(future)
}

/// Blocks the current thread, running `future` to completion on the
/// global runtime.
pub fn block_on<F: Future>(future: F) -> F::Output {
    runtime().block_on(future)
}

fn runtime() -> &'static tokio::runtime::Runtime {
    RUNTIME
        .get()
        .expect("async runtime not initialized; call bft2f::init() first")
}
