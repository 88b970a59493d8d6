//! The tagged message union traded between replicas and clients, and
//! the canonical binary wire encoding that carries it (§4.D).
//!
//! This replaces the source implementation's comma-separated text
//! format, which was ambiguous whenever a field's own contents
//! contained the separator. Every payload here is `tag (u8) ‖ length
//! (u32) ‖ payload`, with field-level encoding delegated to `bincode`;
//! a fixed-size [`Header`] carrying routing metadata and a detached
//! signature precedes every payload on the wire, exactly as in the
//! teacher crate's `WireMessage`/`Header` split.

use std::mem::MaybeUninit;

#[cfg(feature = "serialize_serde")]
use serde::de::DeserializeOwned;
#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::communication::NodeId;
use crate::crypto::hash::Digest;
use crate::crypto::signature::Signature;
use crate::error::*;
use crate::ordering::{SeqNo, View};
use crate::version_vector::VersionVectorEntry;

/// A header that precedes every message in transit on the wire.
///
/// A fixed `Header::LENGTH` bytes are read before the payload; this
/// mirrors the teacher crate's `Header`, serialized with a raw,
/// architecture-independent `repr(C)` layout rather than through serde,
/// so that header parsing never depends on the payload's own encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct Header {
    pub(crate) version: u32,
    pub(crate) from: u32,
    pub(crate) to: u32,
    pub(crate) length: u64,
    pub(crate) signature: [u8; Signature::LENGTH],
}

impl Header {
    /// The size, in bytes, of a serialized `Header`.
    pub const LENGTH: usize = std::mem::size_of::<Self>();

    unsafe fn serialize_into_unchecked(self, buf: &mut [u8]) {
        #[cfg(target_endian = "big")]
        let this = Header {
            version: self.version.to_le(),
            from: self.from.to_le(),
            to: self.to.to_le(),
            length: self.length.to_le(),
            ..self
        };
        #[cfg(not(target_endian = "big"))]
        let this = self;
        let hdr: [u8; Self::LENGTH] = std::mem::transmute(this);
        buf[..Self::LENGTH].copy_from_slice(&hdr[..]);
    }

    /// Serializes this `Header` into a buffer of at least `Header::LENGTH` bytes.
    pub fn serialize_into(self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::LENGTH {
            return Err("buffer too short to serialize a Header into")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(unsafe { self.serialize_into_unchecked(buf) })
    }

    unsafe fn deserialize_from_unchecked(buf: &[u8]) -> Self {
        let mut hdr: MaybeUninit<[u8; Self::LENGTH]> = MaybeUninit::uninit();
        (*hdr.as_mut_ptr()).copy_from_slice(&buf[..Self::LENGTH]);
        let hdr: [u8; Self::LENGTH] = hdr.assume_init();
        let this: Header = std::mem::transmute(hdr);
        #[cfg(target_endian = "big")]
        let this = Header {
            version: this.version.to_be(),
            from: this.from.to_be(),
            to: this.to.to_be(),
            length: this.length.to_be(),
            ..this
        };
        this
    }

    /// Deserializes a `Header` out of a buffer of at least `Header::LENGTH` bytes.
    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err("buffer too short to deserialize a Header from")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(unsafe { Self::deserialize_from_unchecked(buf) })
    }

    /// Builds a `Header` for a message synthesized locally (never
    /// actually received over the wire), e.g. a pre-prepare replayed out
    /// of a `NewView`'s `O`-set. Carries no real signature.
    pub fn synthetic(from: NodeId) -> Header {
        Header {
            version: WireMessage::CURRENT_VERSION,
            from: from.into(),
            to: from.into(),
            length: 0,
            signature: [0u8; Signature::LENGTH],
        }
    }

    pub fn from(&self) -> NodeId {
        NodeId(self.from)
    }

    pub fn to(&self) -> NodeId {
        NodeId(self.to)
    }

    pub fn payload_length(&self) -> u64 {
        self.length
    }

    pub fn signature(&self) -> Signature {
        // infallible: `self.signature` is always `Signature::LENGTH` bytes.
        Signature::from_bytes(&self.signature[..]).unwrap()
    }
}

/// A message ready to be sent over the wire: a `Header` plus the
/// canonically-encoded payload it describes.
#[derive(Debug)]
pub struct WireMessage<'a> {
    header: Header,
    payload: &'a [u8],
}

impl<'a> WireMessage<'a> {
    /// The current wire protocol version.
    pub const CURRENT_VERSION: u32 = 1;

    /// Builds a new `WireMessage` out of an already-encoded `payload`
    /// and a signature over it.
    pub fn new(from: NodeId, to: NodeId, payload: &'a [u8], sig: Signature) -> Self {
        let mut signature = [0u8; Signature::LENGTH];
        signature.copy_from_slice(sig.as_ref());
        let header = Header {
            version: Self::CURRENT_VERSION,
            from: from.into(),
            to: to.into(),
            length: payload.len() as u64,
            signature,
        };
        Self { header, payload }
    }

    pub fn into_inner(self) -> (Header, &'a [u8]) {
        (self.header, self.payload)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Checks everything that can be checked about a `WireMessage`
    /// without the sender's public key: protocol version and declared
    /// length. Signature verification happens separately, once the
    /// sender's `NodeId` resolves to a known `PublicKey` (§4.L).
    pub fn is_well_formed(&self) -> bool {
        self.header.version == Self::CURRENT_VERSION
            && self.header.length as usize == self.payload.len()
    }
}

/// A `(Header, Message)` pair, as retained in the log stores once a
/// message has been accepted (§4.E): the header's signature is what is
/// re-exported during a view change's `P`-set / `O`-set evidence.
#[derive(Debug, Clone)]
pub struct StoredMessage<M> {
    pub header: Header,
    pub message: M,
}

impl<M> StoredMessage<M> {
    pub fn new(header: Header, message: M) -> Self {
        Self { header, message }
    }
}

/// A client's request to have `op` executed against the replicated
/// state.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct RequestMessage<O> {
    pub client_id: NodeId,
    /// Strictly increasing per client; identifies retransmissions.
    pub t: u64,
    pub op: O,
    /// The client's last known `current_system_state`, used by the
    /// receiving replica to detect that the client is on a diverged
    /// fork (§4.E "On REQUEST").
    pub known_state: Option<VersionVectorEntry>,
}

/// Primary-issued proposal ordering `request` at `(view, seq)`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct PrePrepareMessage<O> {
    pub view: View,
    pub seq: SeqNo,
    pub digest: Digest,
    pub request: RequestMessage<O>,
}

/// A backup's vote to prepare `(view, seq, digest)`.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct PrepareMessage {
    pub view: View,
    pub seq: SeqNo,
    pub digest: Digest,
}

/// A replica's vote to commit `(view, seq, digest)`, carrying its own
/// post-append hash-chain digest for that sequence number.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct CommitMessage {
    pub view: View,
    pub seq: SeqNo,
    pub digest: Digest,
    pub hcd: Digest,
}

/// The outcome of a client's request, or a refusal due to a suspected
/// fork (§4.E, *StaleClientKnownState*).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum ReplyResult<P> {
    Ok(P),
    ForkSuspected,
}

/// A replica's signed reply to a client request.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ReplyMessage<P> {
    pub client_id: NodeId,
    pub t: u64,
    pub result: ReplyResult<P>,
    pub entry: VersionVectorEntry,
}

/// One sequence number's worth of view-change evidence: a pre-prepare
/// plus `2f` matching prepares, proving the digest at that sequence was
/// prepared in the old view.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct PreparedCert<O> {
    pub pre_prepare: StoredMessage<PrePrepareMessage<O>>,
    pub prepares: Vec<StoredMessage<PrepareMessage>>,
}

impl<O> PreparedCert<O> {
    pub fn seq(&self) -> SeqNo {
        self.pre_prepare.message.seq
    }

    pub fn digest(&self) -> Digest {
        self.pre_prepare.message.digest
    }
}

/// Broadcast by a replica that has timed out waiting on `new_view`,
/// carrying every prepared certificate beyond its last committed state.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ViewChangeMessage<O> {
    pub new_view: View,
    pub replica_id: NodeId,
    pub last_committed: VersionVectorEntry,
    pub p_set: Vec<PreparedCert<O>>,
}

/// A single slot of the `O`-set re-issued in a `NewView`: either a
/// proven pre-prepare for `seq`, or a no-op if no `ViewChange` in `V`
/// proved a digest for it.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct OSetEntry<O> {
    pub seq: SeqNo,
    pub pre_prepare: Option<PrePrepareMessage<O>>,
}

/// Broadcast by the prospective primary of `new_view`, once `2f+1`
/// non-conflicting `ViewChange`s have been collected.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct NewViewMessage<O> {
    pub new_view: View,
    pub v_set: Vec<StoredMessage<ViewChangeMessage<O>>>,
    pub o_set: Vec<OSetEntry<O>>,
}

/// A quorum of `2f+1` matching `Commit`s, proving a sequence number was
/// committed; the unit of evidence exchanged by `OperationsDict`.
pub type CommitCertificate = Vec<StoredMessage<CommitMessage>>;

/// Checkpoint snapshot broadcast every `K` committed sequences (§4.G).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct CheckpointMessage<P> {
    pub replica_id: NodeId,
    pub seq: SeqNo,
    pub rcache_snapshot: Vec<(NodeId, u64, ReplyMessage<P>)>,
    pub vv_snapshot: Vec<VersionVectorEntry>,
    /// Entries for principals whose latest known `seq <= n - 2I`.
    pub e_set: Vec<VersionVectorEntry>,
}

/// Answers a dominance-check: the quorum evidence for every sequence
/// number the requester is missing.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct OperationsDictMessage {
    pub entries: Vec<(SeqNo, CommitCertificate)>,
}

/// Sent to a `ViewChange` initiator whose `last_committed` trails the
/// receiver's own, so the initiator can request the missing commits
/// rather than regress the system (§4.F "Dominance check").
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct PrimaryNotDominantMessage {
    pub sender: NodeId,
    pub sender_last_committed: VersionVectorEntry,
}

/// The single tagged union of every message exchanged by the system
/// (§4.D). `O` is the client operation type; `P` is the application's
/// reply payload type.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum SystemMessage<O, P> {
    Request(RequestMessage<O>),
    PrePrepare(PrePrepareMessage<O>),
    Prepare(PrepareMessage),
    Commit(CommitMessage),
    Reply(ReplyMessage<P>),
    ViewChange(ViewChangeMessage<O>),
    NewView(NewViewMessage<O>),
    Checkpoint(CheckpointMessage<P>),
    OperationsDict(OperationsDictMessage),
    PrimaryNotDominant(PrimaryNotDominantMessage),
}

const TAG_REQUEST: u8 = 0;
const TAG_PRE_PREPARE: u8 = 1;
const TAG_PREPARE: u8 = 2;
const TAG_COMMIT: u8 = 3;
const TAG_REPLY: u8 = 4;
const TAG_VIEW_CHANGE: u8 = 5;
const TAG_NEW_VIEW: u8 = 6;
const TAG_CHECKPOINT: u8 = 7;
const TAG_OPERATIONS_DICT: u8 = 8;
const TAG_PRIMARY_NOT_DOMINANT: u8 = 9;

#[cfg(feature = "serialize_serde")]
impl<O, P> SystemMessage<O, P>
where
    O: Serialize + DeserializeOwned,
    P: Serialize + DeserializeOwned,
{
    /// Encodes this message into the canonical `tag ‖ length ‖ payload`
    /// binary format. The `tag` is explicit rather than relying on an
    /// enum's implicit discriminant, so the framing is stable even if
    /// variants are reordered.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (tag, body) = match self {
            SystemMessage::Request(m) => (TAG_REQUEST, bincode_ser(m)?),
            SystemMessage::PrePrepare(m) => (TAG_PRE_PREPARE, bincode_ser(m)?),
            SystemMessage::Prepare(m) => (TAG_PREPARE, bincode_ser(m)?),
            SystemMessage::Commit(m) => (TAG_COMMIT, bincode_ser(m)?),
            SystemMessage::Reply(m) => (TAG_REPLY, bincode_ser(m)?),
            SystemMessage::ViewChange(m) => (TAG_VIEW_CHANGE, bincode_ser(m)?),
            SystemMessage::NewView(m) => (TAG_NEW_VIEW, bincode_ser(m)?),
            SystemMessage::Checkpoint(m) => (TAG_CHECKPOINT, bincode_ser(m)?),
            SystemMessage::OperationsDict(m) => (TAG_OPERATIONS_DICT, bincode_ser(m)?),
            SystemMessage::PrimaryNotDominant(m) => (TAG_PRIMARY_NOT_DOMINANT, bincode_ser(m)?),
        };
        let mut out = Vec::with_capacity(1 + 4 + body.len());
        out.push(tag);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes a message previously produced by [`Self::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 5 {
            return Err("message payload too short for tag + length header")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        let tag = bytes[0];
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[1..5]);
        let len = u32::from_le_bytes(len_buf) as usize;
        let body = bytes.get(5..5 + len).ok_or("declared payload length overruns buffer")
            .wrapped(ErrorKind::CommunicationMessage)?;
        Ok(match tag {
            TAG_REQUEST => SystemMessage::Request(bincode_de(body)?),
            TAG_PRE_PREPARE => SystemMessage::PrePrepare(bincode_de(body)?),
            TAG_PREPARE => SystemMessage::Prepare(bincode_de(body)?),
            TAG_COMMIT => SystemMessage::Commit(bincode_de(body)?),
            TAG_REPLY => SystemMessage::Reply(bincode_de(body)?),
            TAG_VIEW_CHANGE => SystemMessage::ViewChange(bincode_de(body)?),
            TAG_NEW_VIEW => SystemMessage::NewView(bincode_de(body)?),
            TAG_CHECKPOINT => SystemMessage::Checkpoint(bincode_de(body)?),
            TAG_OPERATIONS_DICT => SystemMessage::OperationsDict(bincode_de(body)?),
            TAG_PRIMARY_NOT_DOMINANT => SystemMessage::PrimaryNotDominant(bincode_de(body)?),
            other => {
                return Err(format!("unknown message tag {}", other))
                    .wrapped(ErrorKind::CommunicationMessage)
            }
        })
    }
}

#[cfg(feature = "serialize_serde")]
fn bincode_ser<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).wrapped(ErrorKind::CommunicationMessage)
}

#[cfg(feature = "serialize_serde")]
fn bincode_de<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).wrapped(ErrorKind::CommunicationMessage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_through_raw_bytes() {
        let signature = Signature::from_bytes(&[0; Signature::LENGTH][..]).unwrap();
        let (header, _) = WireMessage::new(NodeId(0), NodeId(3), b"payload", signature).into_inner();
        let mut buf = [0u8; Header::LENGTH];
        header.serialize_into(&mut buf[..]).unwrap();
        let roundtripped = Header::deserialize_from(&buf[..]).unwrap();
        assert_eq!(header, roundtripped);
    }

    #[test]
    fn wire_message_is_well_formed_iff_length_matches() {
        let signature = Signature::from_bytes(&[0; Signature::LENGTH][..]).unwrap();
        let msg = WireMessage::new(NodeId(0), NodeId(1), b"hello", signature);
        assert!(msg.is_well_formed());
    }

    #[cfg(feature = "serialize_serde")]
    #[test]
    fn system_message_roundtrips_through_encode_decode() {
        let prepare = SystemMessage::<String, String>::Prepare(PrepareMessage {
            view: View::from(0),
            seq: SeqNo::from(1),
            digest: Digest::from_data(b"x"),
        });
        let bytes = prepare.encode().unwrap();
        let decoded: SystemMessage<String, String> = SystemMessage::decode(&bytes).unwrap();
        match decoded {
            SystemMessage::Prepare(m) => {
                assert_eq!(m.seq, SeqNo::from(1));
                assert_eq!(m.digest, Digest::from_data(b"x"));
            }
            _ => panic!("wrong variant decoded"),
        }
    }
}
