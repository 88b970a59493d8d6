//! A minimal demonstration [`Service`], echoing back whatever operation
//! string a client submitted. Exists so the `replica`/`client` binaries
//! have something concrete to execute; real deployments supply their
//! own `Service` impl.

use crate::executable::Service;
use crate::ordering::SeqNo;

/// Echoes back every operation it is asked to execute.
pub struct EchoService;

impl Service for EchoService {
    type Operation = String;
    type Reply = String;

    fn initial_state(&mut self) -> Self::Reply {
        String::new()
    }

    fn update(&mut self, _seq: SeqNo, op: Self::Operation) -> Self::Reply {
        op
    }
}
