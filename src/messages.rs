//! # Control Messages
//!
//! Serializable control message types exchanged by the mesh manager, plus the
//! bounded bincode helpers used at the wire boundary. Full message payloads
//! travel in the PubSub base's envelopes; everything here is mesh signaling.
//!
//! ## Message IDs
//!
//! Messages are identified by an opaque 32-byte `MessageId` assigned by the
//! PubSub base. Where ids end up in long-lived per-peer state (IDONTWANT
//! sets) they are stored as `SaltedId`: a keyed hash under a per-node secret,
//! so a remote cannot predict our seen-set membership.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::peer::PeerId;

/// Content-derived message identifier assigned by the PubSub base.
pub type MessageId = [u8; 32];

/// A message id hashed under the local node secret.
pub type SaltedId = [u8; 32];

/// Maximum serialized size of a control message.
/// SECURITY: Bounds deserialization buffers against memory exhaustion.
pub const MAX_CONTROL_SIZE: u64 = 256 * 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_CONTROL_SIZE)
        .with_fixint_encoding()
}

/// Serialize a control message for the wire.
pub fn serialize_control(msg: &ControlMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(msg)
}

/// Deserialize a control message with size bounds enforced.
pub fn deserialize_control(bytes: &[u8]) -> Result<ControlMessage, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Deserialize any bounded payload (used for embedded signed records).
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Peer reference attached to a PRUNE for peer exchange.
///
/// `signed_record` carries an encoded [`crate::records::SignedPeerRecord`];
/// empty bytes mean no record is available for that peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub signed_record: Vec<u8>,
}

impl PeerInfo {
    pub fn bare(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            signed_record: Vec::new(),
        }
    }
}

/// Mesh-management control messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Request to join the sender's mesh for a topic.
    Graft { topic: String },
    /// Eviction from the mesh, with a re-graft backoff and an optional
    /// peer-exchange list the evicted peer may use to find alternates.
    Prune {
        topic: String,
        peers: Vec<PeerInfo>,
        backoff_secs: u64,
    },
    /// Lazy advertisement of recently seen message ids for a topic.
    IHave {
        topic: String,
        message_ids: Vec<MessageId>,
    },
    /// Request for previously advertised messages.
    IWant { message_ids: Vec<MessageId> },
    /// Ask the peer not to forward these messages to us.
    IDontWant { message_ids: Vec<MessageId> },
    /// Advance announcement of an in-flight large message (v1.4).
    #[cfg(feature = "preamble")]
    Preamble {
        message_id: MessageId,
        topic: String,
        message_length: u64,
    },
    /// The sender is currently receiving this message from elsewhere (v1.4).
    #[cfg(feature = "preamble")]
    ImReceiving {
        message_id: MessageId,
        message_length: u64,
    },
}

impl ControlMessage {
    /// Topic the message applies to, when it names one.
    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Graft { topic } => Some(topic),
            Self::Prune { topic, .. } => Some(topic),
            Self::IHave { topic, .. } => Some(topic),
            Self::IWant { .. } | Self::IDontWant { .. } => None,
            #[cfg(feature = "preamble")]
            Self::Preamble { topic, .. } => Some(topic),
            #[cfg(feature = "preamble")]
            Self::ImReceiving { .. } => None,
        }
    }

    /// Whether the message steers mesh membership and should be sent with
    /// priority over lazy gossip.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Graft { .. } | Self::Prune { .. })
    }
}
