//! Internal message channels, connecting socket receive tasks to the
//! single-threaded protocol loop (§5 "Suspension points").
//!
//! A thin wrapper over `futures::channel::mpsc`, mirroring the teacher
//! crate's own `channel` module: the protocol engine never touches a
//! raw `mpsc::UnboundedSender`/`Receiver` pair directly, so the
//! underlying channel implementation stays swappable behind the
//! `channel_futures_mpsc` feature.

use futures::channel::mpsc;
use futures::stream::StreamExt;

use crate::error::*;

/// The sending half of an internal message channel.
#[derive(Clone)]
pub struct ChannelTx<T> {
    inner: mpsc::UnboundedSender<T>,
}

/// The receiving half of an internal message channel.
pub struct ChannelRx<T> {
    inner: mpsc::UnboundedReceiver<T>,
}

/// Creates a new, unbounded channel.
///
/// Unbounded by design: backpressure for inbound protocol messages is
/// handled at the log-store level (§5 "Backpressure"), not at the
/// channel, since dropping the *oldest* unprepared message is a
/// protocol-level decision the channel itself cannot make.
pub fn new_channel<T>() -> (ChannelTx<T>, ChannelRx<T>) {
    let (tx, rx) = mpsc::unbounded();
    (ChannelTx { inner: tx }, ChannelRx { inner: rx })
}

impl<T> ChannelTx<T> {
    /// Sends `message`, failing only if every receiver has been dropped.
    pub fn send(&self, message: T) -> Result<()> {
        self.inner
            .unbounded_send(message)
            .map_err(|_| "channel receiver has been dropped")
            .simple(ErrorKind::Communication)
    }
}

impl<T> ChannelRx<T> {
    /// Awaits the next message, or `None` once every sender has been dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.next().await
    }
}
