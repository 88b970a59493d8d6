//! The client's request/reply quorum engine (§4.H): multicasts a
//! request to every replica, matches `2f+1` identical replies, and
//! checks the result against its own fork-detection state.

use std::sync::Arc;

use crate::communication::message::{ReplyMessage, ReplyResult, RequestMessage};
use crate::communication::NodeId;
use crate::crypto::signature::KeyPair;
use crate::version_vector::{VersionVector, VersionVectorEntry};

/// The disposition of a request once its incoming replies are weighed
/// against the `2f+1` / `f+1` thresholds of §4.H.
pub enum RequestStatus<P> {
    /// Still waiting on more matching replies.
    Pending,
    /// At least `f+1` but fewer than `2f+1` replies match: treat the
    /// result as tentative and keep waiting/retry, per §4.H.
    Tentative,
    /// `2f+1` matching replies: the request is complete.
    Complete(P),
    /// `2f+1` matching replies, all reporting a suspected fork.
    ForkSuspected,
}

struct OutstandingRequest {
    replied: crate::collections::HashSet<NodeId>,
    by_signature: crate::collections::HashMap<Vec<u8>, Vec<NodeId>>,
}

/// One client's quorum-tracking state machine.
pub struct Client<O, P> {
    id: NodeId,
    n: usize,
    f: usize,
    #[allow(dead_code)]
    keypair: Arc<KeyPair>,
    vv: VersionVector,
    next_t: u64,
    outstanding: Option<(u64, OutstandingRequest)>,
    _marker: std::marker::PhantomData<(O, P)>,
}

impl<O: Clone, P: Clone> Client<O, P> {
    pub fn new(id: NodeId, n: usize, f: usize, keypair: Arc<KeyPair>) -> Self {
        Self {
            id,
            n,
            f,
            keypair,
            vv: VersionVector::new(),
            next_t: 1,
            outstanding: None,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn vv(&self) -> &VersionVector {
        &self.vv
    }

    /// Builds a new request for `op`, to be multicast to every replica;
    /// arming a resend timer is the caller's responsibility (§4.H
    /// "make_request").
    pub fn make_request(&mut self, op: O) -> (RequestMessage<O>, Vec<NodeId>) {
        let t = self.next_t;
        self.next_t += 1;
        let known_state = self.vv.current_system_state(self.f);
        let req = RequestMessage { client_id: self.id, t, op, known_state };
        self.outstanding = Some((
            t,
            OutstandingRequest {
                replied: crate::collections::hash_set(),
                by_signature: crate::collections::hash_map(),
            },
        ));
        let targets = (0..self.n as u32).map(NodeId).collect();
        (req, targets)
    }

    /// Feeds an inbound `Reply` into the quorum tracker for the
    /// currently outstanding request, returning its updated status.
    pub fn on_reply(&mut self, reply: ReplyMessage<P>) -> RequestStatus<P> {
        let outstanding = match &mut self.outstanding {
            Some((t, pending)) if *t == reply.t => pending,
            _ => return RequestStatus::Pending,
        };

        let sender = reply.entry.replica_id;
        if outstanding.replied.contains(&sender) {
            return RequestStatus::Pending;
        }
        outstanding.replied.insert(sender);

        // a reply "matches" another iff everything but `entry.replica`
        // is equal (§4.H); use the encoding of every other field as the
        // matching key, recording distinct signers per key.
        let key = matching_key(&reply);
        let signers = outstanding.by_signature.entry(key).or_insert_with(Vec::new);
        if !signers.contains(&sender) {
            signers.push(sender);
        }
        let matched = signers.len();
        let signers = signers.clone();

        if matched >= 2 * self.f + 1 {
            for signer in signers {
                self.vv.update(entry_for_signer(signer, &reply));
            }
            return match reply.result {
                ReplyResult::ForkSuspected => RequestStatus::ForkSuspected,
                ReplyResult::Ok(ref payload) => {
                    if let Some(css) = self.vv.current_system_state(self.f) {
                        if css.digest != reply.entry.digest {
                            return RequestStatus::ForkSuspected;
                        }
                    }
                    RequestStatus::Complete(payload.clone())
                }
            };
        }
        if matched >= self.f + 1 {
            return RequestStatus::Tentative;
        }
        RequestStatus::Pending
    }

    /// The timestamp of the request currently awaited, if any.
    pub fn outstanding_t(&self) -> Option<u64> {
        self.outstanding.as_ref().map(|(t, _)| *t)
    }
}

fn matching_key<P>(reply: &ReplyMessage<P>) -> Vec<u8> {
    let tag: u8 = match &reply.result {
        ReplyResult::ForkSuspected => 0,
        ReplyResult::Ok(_) => 1,
    };
    let mut bytes = vec![tag];
    bytes.extend_from_slice(&reply.t.to_le_bytes());
    bytes.extend_from_slice(&u64::from(reply.entry.seq).to_le_bytes());
    bytes.extend_from_slice(reply.entry.digest.as_ref());
    bytes
}

fn entry_for_signer<P>(signer: NodeId, reply: &ReplyMessage<P>) -> VersionVectorEntry {
    VersionVectorEntry {
        replica_id: signer,
        view: reply.entry.view,
        seq: reply.entry.seq,
        digest: reply.entry.digest,
        signature: reply.entry.signature,
    }
}
