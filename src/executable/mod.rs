//! User application execution, off the protocol's critical path.
//!
//! `execute` is assumed deterministic, total, and fast (§5), but the
//! engine must still tolerate a slow application: this module mirrors
//! the teacher crate's `Executor`/`ExecutorHandle` split, running the
//! application on a dedicated OS thread and posting results back as
//! events rather than blocking the replica's single-threaded state
//! machine.

use std::sync::mpsc;
use std::thread;

use crate::communication::channel::ChannelTx;
use crate::communication::NodeId;
use crate::crypto::hash::Digest;
use crate::error::*;
use crate::ordering::SeqNo;

/// A user-defined application state machine.
///
/// `update` is applied strictly in `seq` order (§5 "Ordering
/// guarantees"); the executor thread enforces this by draining requests
/// off a single queue.
pub trait Service: Send + 'static {
    type Operation: Send + 'static;
    type Reply: Send + 'static;

    /// Returns the application's initial state.
    fn initial_state(&mut self) -> Self::Reply
    where
        Self: Sized;

    /// Applies `op`, producing the reply to be sent back to the client.
    fn update(&mut self, seq: SeqNo, op: Self::Operation) -> Self::Reply;
}

/// One committed request awaiting execution.
pub struct Update<O> {
    pub seq: SeqNo,
    pub client_id: NodeId,
    pub digest: Digest,
    pub op: O,
}

/// An executed request's reply, on its way back to the protocol loop.
#[derive(Clone)]
pub struct ExecutedReply<P> {
    pub seq: SeqNo,
    pub client_id: NodeId,
    pub digest: Digest,
    pub reply: P,
}

enum ExecutionRequest<O> {
    Update(Update<O>),
}

/// A handle used by the protocol loop to queue committed requests for
/// execution, without blocking on the application itself.
pub struct ExecutorHandle<S: Service> {
    tx: mpsc::Sender<ExecutionRequest<S::Operation>>,
}

impl<S: Service> Clone for ExecutorHandle<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<S: Service> ExecutorHandle<S> {
    /// Queues `update` for execution; results are posted back on the
    /// channel given to [`Executor::spawn`], in the order they were
    /// queued.
    pub fn queue_update(&self, update: Update<S::Operation>) -> Result<()> {
        self.tx
            .send(ExecutionRequest::Update(update))
            .simple(ErrorKind::Executable)
    }
}

/// Owns the application instance; runs on a dedicated OS thread.
pub struct Executor;

impl Executor {
    /// Spawns the executor thread, returning a handle the protocol loop
    /// uses to queue committed requests. Results are posted onto
    /// `reply_tx` in strict execution order.
    pub fn spawn<S>(mut service: S, reply_tx: ChannelTx<ExecutedReply<S::Reply>>) -> ExecutorHandle<S>
    where
        S: Service,
    {
        let (tx, rx) = mpsc::channel::<ExecutionRequest<S::Operation>>();

        thread::Builder::new()
            .name("bft2f-executor".into())
            .spawn(move || {
                while let Ok(ExecutionRequest::Update(update)) = rx.recv() {
                    let reply = service.update(update.seq, update.op);
                    let executed = ExecutedReply {
                        seq: update.seq,
                        client_id: update.client_id,
                        digest: update.digest,
                        reply,
                    };
                    // the protocol loop may have shut down already; a
                    // dropped receiver is not a fatal condition for the
                    // executor thread.
                    let _ = reply_tx.send(executed);
                }
            })
            .expect("failed to spawn executor thread");

        ExecutorHandle { tx }
    }
}
