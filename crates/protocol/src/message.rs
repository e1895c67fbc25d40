//! Signed wire messages exchanged during bootstrap, registration
//! and rounds.
use ed25519_dalek::VerifyingKey;

use crate::{
    digest, encoding, verify, Digest, Keypair, PeerId, Result,
    RoundId,
};

/// Kinds of session messages.
///
/// The set is closed; the tag values are fixed by the wire format.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub enum MessageKind {
    /// The proposer starts a bootstrap.
    #[default]
    Init,
    /// A server's response to an Init.
    Enlist,
    /// The proposer's redistribution of the collected Enlist set.
    EnlistSet,
    /// A server's agreement on the derived round id.
    Agree,
    /// A server's response to a client queue request.
    Queued,
    /// A client queue request or registration.
    Register,
    /// Server to server exchange of observed registrations.
    List,
    /// Cross-signature over the canonical client roster.
    VerifyList,
    /// Server signal to its clients that the round begins.
    Start,
    /// Round teardown.
    Stop,
    /// Opaque round payload.
    SessionData,
}

/// A signed, tagged wire message.
///
/// The signature covers the payload bytes exactly as serialized;
/// state machine messages are signed with the sender's long-term
/// key, session data with the sender's ephemeral round key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message kind tag.
    pub kind: MessageKind,
    /// Serialized payload.
    pub payload: Vec<u8>,
    /// Signature over the payload.
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Verify the signature over the payload.
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        verify(key, &self.payload, &self.signature)
    }

    /// Parse the typed payload for this envelope's kind.
    pub async fn open(&self) -> Result<SessionMessage> {
        Ok(match self.kind {
            MessageKind::Init => {
                SessionMessage::Init(encoding::decode(&self.payload).await?)
            }
            MessageKind::Enlist => SessionMessage::Enlist(
                encoding::decode(&self.payload).await?,
            ),
            MessageKind::EnlistSet => SessionMessage::EnlistSet(
                encoding::decode(&self.payload).await?,
            ),
            MessageKind::Agree => SessionMessage::Agree(
                encoding::decode(&self.payload).await?,
            ),
            MessageKind::Queued => SessionMessage::Queued(
                encoding::decode(&self.payload).await?,
            ),
            MessageKind::Register => SessionMessage::Register(
                encoding::decode(&self.payload).await?,
            ),
            MessageKind::List => {
                SessionMessage::List(encoding::decode(&self.payload).await?)
            }
            MessageKind::VerifyList => SessionMessage::VerifyList(
                encoding::decode(&self.payload).await?,
            ),
            MessageKind::Start => SessionMessage::Start(
                encoding::decode(&self.payload).await?,
            ),
            MessageKind::Stop => {
                SessionMessage::Stop(encoding::decode(&self.payload).await?)
            }
            MessageKind::SessionData => SessionMessage::SessionData(
                encoding::decode(&self.payload).await?,
            ),
        })
    }

    /// Encode this envelope into its wire form.
    pub async fn to_bytes(&self) -> Result<Vec<u8>> {
        encoding::encode(self).await
    }

    /// Decode an envelope from its wire form.
    pub async fn from_bytes(buffer: impl AsRef<[u8]>) -> Result<Self> {
        encoding::decode(buffer).await
    }
}

/// Typed payloads of the session message taxonomy.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    /// Bootstrap proposal.
    Init(Init),
    /// Enlistment under an Init.
    Enlist(Enlist),
    /// Redistributed Enlist set.
    EnlistSet(EnlistSet),
    /// Round id agreement.
    Agree(Agree),
    /// Queue response.
    Queued(Queued),
    /// Queue request or registration.
    Register(Register),
    /// Observed registrations.
    List(List),
    /// Roster cross-signature.
    VerifyList(VerifyList),
    /// Round start signal.
    Start(Start),
    /// Round teardown.
    Stop(Stop),
    /// Opaque round payload.
    SessionData(SessionData),
}

impl SessionMessage {
    /// Message kind for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Init(_) => MessageKind::Init,
            Self::Enlist(_) => MessageKind::Enlist,
            Self::EnlistSet(_) => MessageKind::EnlistSet,
            Self::Agree(_) => MessageKind::Agree,
            Self::Queued(_) => MessageKind::Queued,
            Self::Register(_) => MessageKind::Register,
            Self::List(_) => MessageKind::List,
            Self::VerifyList(_) => MessageKind::VerifyList,
            Self::Start(_) => MessageKind::Start,
            Self::Stop(_) => MessageKind::Stop,
            Self::SessionData(_) => MessageKind::SessionData,
        }
    }

    /// Serialize the payload and sign it into an envelope.
    pub async fn seal(&self, keypair: &Keypair) -> Result<Envelope> {
        let payload = match self {
            Self::Init(m) => encoding::encode(m).await?,
            Self::Enlist(m) => encoding::encode(m).await?,
            Self::EnlistSet(m) => encoding::encode(m).await?,
            Self::Agree(m) => encoding::encode(m).await?,
            Self::Queued(m) => encoding::encode(m).await?,
            Self::Register(m) => encoding::encode(m).await?,
            Self::List(m) => encoding::encode(m).await?,
            Self::VerifyList(m) => encoding::encode(m).await?,
            Self::Start(m) => encoding::encode(m).await?,
            Self::Stop(m) => encoding::encode(m).await?,
            Self::SessionData(m) => encoding::encode(m).await?,
        };
        let signature = keypair.sign(&payload);
        Ok(Envelope {
            kind: self.kind(),
            payload,
            signature,
        })
    }
}

/// Proposal to begin resynchronization for a new round.
///
/// Authored by the proposer, the lowest server id in canonical
/// order, after every server connection is established or a round
/// has completed.
#[derive(Debug, Default, Clone)]
pub struct Init {
    /// Sender's overlay id.
    pub peer_id: PeerId,
    /// Nonce ensuring uniqueness of the Init.
    pub nonce: Vec<u8>,
    /// Milliseconds since the epoch, to order Init messages.
    pub timestamp: u64,
    /// Digest of the group roster.
    pub group_digest: Digest,
}

/// Enlistment of a server under an Init.
///
/// Carries the ephemeral key used to sign round messages. The Init
/// envelope is embedded so an Enlist arriving before the Init it is
/// based on remains self-contained.
#[derive(Debug, Default, Clone)]
pub struct Enlist {
    /// Sender's overlay id.
    pub peer_id: PeerId,
    /// The Init envelope this enlistment responds to.
    pub init: Envelope,
    /// Ephemeral verifying key for the upcoming round.
    pub ephemeral_key: Vec<u8>,
    /// Additional public round material.
    pub optional: Vec<u8>,
}

/// The proposer's synchronization barrier: the complete ordered
/// set of Enlist envelopes.
#[derive(Debug, Default, Clone)]
pub struct EnlistSet {
    /// Enlist envelopes in canonical server order.
    pub enlists: Vec<Envelope>,
}

/// A server's agreement on the round id derived from the Enlist
/// set.
#[derive(Debug, Default, Clone)]
pub struct Agree {
    /// Sender's overlay id.
    pub peer_id: PeerId,
    /// The derived round id.
    pub round_id: RoundId,
    /// Ephemeral verifying key for the upcoming round.
    pub ephemeral_key: Vec<u8>,
    /// Additional public round material.
    pub optional: Vec<u8>,
}

/// Response to a client queue request: the accumulated Agree
/// envelopes plus the client's nonce.
#[derive(Debug, Default, Clone)]
pub struct Queued {
    /// Agree envelopes in canonical server order.
    pub agrees: Vec<Envelope>,
    /// Nonce echoed from the queue request.
    pub nonce: Vec<u8>,
}

/// A client queue request or round registration.
///
/// A zero round id marks a queue request; its optional field then
/// carries the client nonce a Queued must echo. A Register carrying
/// the current round id is an actual registration.
#[derive(Debug, Default, Clone)]
pub struct Register {
    /// Sender's overlay id.
    pub peer_id: PeerId,
    /// Round id, or zero for a queue request.
    pub round_id: RoundId,
    /// Ephemeral verifying key for the upcoming round.
    pub ephemeral_key: Vec<u8>,
    /// Additional public round material, or the queue nonce.
    pub optional: Vec<u8>,
}

/// The registrations one server observed during its window.
///
/// The payload bytes of this message are the canonical roster
/// serialization that roster digests are computed over.
#[derive(Debug, Default, Clone)]
pub struct List {
    /// Register envelopes ordered by client id.
    pub registers: Vec<Envelope>,
}

/// Attestation of the canonical client roster.
///
/// The payload is the roster digest; the envelope signature over it
/// is the cross-signature collected into the Start message.
#[derive(Debug, Default, Clone)]
pub struct VerifyList {
    /// Digest of the canonical roster bytes.
    pub roster_digest: Digest,
}

/// Signal to clients that the round begins.
#[derive(Debug, Default, Clone)]
pub struct Start {
    /// The canonical client roster.
    pub registers: Vec<Envelope>,
    /// One roster signature per server, in canonical server order.
    pub signatures: Vec<Vec<u8>>,
}

/// Round teardown.
#[derive(Debug, Default, Clone)]
pub struct Stop {
    /// Sender's overlay id.
    pub peer_id: PeerId,
    /// The round being stopped.
    pub round_id: RoundId,
    /// Stop now rather than at the end of the current exchange.
    pub immediate: bool,
    /// Why the round is stopping.
    pub reason: String,
}

/// Opaque round payload.
#[derive(Debug, Default, Clone)]
pub struct SessionData {
    /// Round packet bytes.
    pub packet: Vec<u8>,
}

/// Compute the digest of the canonical roster serialization for a
/// set of Register envelopes.
///
/// The serialization is identical to the payload of a List
/// message carrying the same ordered content.
pub async fn roster_digest(registers: &[Envelope]) -> Result<Digest> {
    Ok(digest(encoding::encode_envelope_list(registers).await?))
}

/// Derive a round id from the ordered Enlist envelopes.
///
/// The digest of the concatenated envelope bytes in canonical
/// server order; every server computes the identical value.
pub async fn derive_round_id(enlists: &[Envelope]) -> Result<RoundId> {
    let mut data = Vec::new();
    for envelope in enlists {
        data.extend_from_slice(&envelope.to_bytes().await?);
    }
    Ok(RoundId::new(digest(&data)))
}
