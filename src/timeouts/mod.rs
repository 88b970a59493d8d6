//! A generic timer facility: arm a one-shot timer that, upon expiry,
//! posts an application-chosen event back onto a channel.
//!
//! Used for the per-request view timer, the new-view escalation timer,
//! and the client's resend timer (§5 "Suspension points").

use std::time::Duration;

use futures::channel::mpsc::UnboundedSender;
use futures_timer::Delay;

use crate::async_runtime as rt;

/// A handle used to arm timers that post events of type `E` back to
/// whichever channel was registered at construction.
#[derive(Clone)]
pub struct TimeoutsHandle<E> {
    tx: UnboundedSender<E>,
}

impl<E> TimeoutsHandle<E>
where
    E: Send + Clone + 'static,
{
    /// Creates a new `TimeoutsHandle` posting events to `tx`.
    pub fn new(tx: UnboundedSender<E>) -> Self {
        Self { tx }
    }

    /// Arms a one-shot timer that posts `event` onto the channel after
    /// `duration` elapses.
    ///
    /// Dropping every clone of the returned value has no effect on the
    /// timer: there is no cancellation handle by design, since every
    /// consumer of this crate re-validates a timeout's relevance (e.g.
    /// "is this still the pending sequence number?") before acting on
    /// it, rather than relying on cancellation races.
    pub fn timeout(&self, duration: Duration, event: E) {
        let mut tx = self.tx.clone();
        rt::spawn(async move {
            Delay::new(duration).await;
            // the receiving end may have been dropped (e.g. replica
            // shutdown); that's not an error condition for a timer.
            let _ = tx.unbounded_send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use futures::StreamExt;

    #[test]
    fn timer_fires_and_delivers_event() {
        crate::async_runtime::init(1).unwrap();
        rt::block_on(async {
            let (tx, mut rx) = mpsc::unbounded();
            let handle = TimeoutsHandle::new(tx);
            handle.timeout(Duration::from_millis(10), 42u32);
            let got = rx.next().await;
            assert_eq!(got, Some(42));
        });
    }
}
