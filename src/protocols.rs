//! # Collaborator Interfaces
//!
//! Traits abstracting the surrounding node: the transport that carries
//! control messages, the PubSub base's duplicate index, and the peerstore
//! book of signed address records.
//!
//! ## Design
//!
//! Traits are defined here separately from implementations to:
//! - Let the mesh manager depend only on narrow interfaces, not the node
//! - Keep the transport, envelope and scoring layers replaceable in tests
//! - Avoid circular dependencies between modules
//!
//! | Concern | Trait | Provided by |
//! |---------|-------|-------------|
//! | Control message delivery | [`MeshRpc`] | transport / RPC layer |
//! | Duplicate suppression | [`SeenIndex`] | PubSub base |
//! | Signed address records | [`RecordBook`] | peerstore |

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::{ControlMessage, MessageId, SaltedId};
use crate::peer::PeerId;
use crate::records::SignedPeerRecord;

/// Outbound control-message delivery.
///
/// Failures are logged by the caller and never roll back membership state;
/// the next heartbeat reconciles.
#[async_trait]
pub trait MeshRpc: Send + Sync {
    /// Send a control message to a peer. `high_priority` marks membership
    /// signaling (GRAFT/PRUNE) that should not queue behind bulk gossip.
    async fn send_control(&self, to: &PeerId, msg: ControlMessage, high_priority: bool)
        -> Result<()>;
}

/// The PubSub base's duplicate index, queried under salted ids.
pub trait SeenIndex: Send + Sync {
    /// Hash a message id under the local node secret.
    fn salt(&self, id: &MessageId) -> SaltedId;

    /// Whether the salted id is in the seen window.
    fn has_seen(&self, salted: &SaltedId) -> bool;
}

/// Lookup of signed address records for peer exchange.
pub trait RecordBook: Send + Sync {
    fn lookup(&self, peer: &PeerId) -> Option<SignedPeerRecord>;
}

/// A [`RecordBook`] with no records; PRUNEs then carry bare peer ids.
pub struct EmptyRecordBook;

impl RecordBook for EmptyRecordBook {
    fn lookup(&self, _peer: &PeerId) -> Option<SignedPeerRecord> {
        None
    }
}

/// Keyed-hash salting over a caller-maintained seen set.
///
/// The node secret is drawn at startup, so the mapping from message id to
/// salted id differs per node and cannot be predicted remotely.
pub struct NodeSalt {
    key: [u8; 32],
    seen: std::sync::RwLock<std::collections::HashSet<SaltedId>>,
}

impl NodeSalt {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            seen: std::sync::RwLock::new(std::collections::HashSet::new()),
        }
    }

    /// Generate with a random node secret.
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut key);
        Self::new(key)
    }

    /// Record a message id as seen.
    pub fn observe(&self, id: &MessageId) {
        let salted = blake3::keyed_hash(&self.key, id);
        self.seen
            .write()
            .expect("seen set lock poisoned")
            .insert(*salted.as_bytes());
    }
}

impl SeenIndex for NodeSalt {
    fn salt(&self, id: &MessageId) -> SaltedId {
        *blake3::keyed_hash(&self.key, id).as_bytes()
    }

    fn has_seen(&self, salted: &SaltedId) -> bool {
        self.seen
            .read()
            .expect("seen set lock poisoned")
            .contains(salted)
    }
}
