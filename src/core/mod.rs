//! Top-level wiring: the `Replica` and `Client` state machines that
//! assemble the core components (consensus, view-change, checkpoint,
//! executable) into runnable participants.

pub mod client;
pub mod server;
