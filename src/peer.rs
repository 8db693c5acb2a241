//! # Per-Peer State
//!
//! Identifiers, negotiated protocol variants and the mutable state the mesh
//! manager keeps for every connected peer: gossip budgets, the IHAVE history
//! ring used to validate IWANT requests, and the salted IDONTWANT sets.
//!
//! Peer state is created when the transport reports a connection and dropped
//! on disconnect. Topic tables reference peers by [`PeerId`] only; every
//! access to the mutable state goes through the [`PeerStore`], which simply
//! answers "unknown" after a disconnect.

use std::collections::{HashMap, HashSet, VecDeque};
#[cfg(feature = "preamble")]
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::MeshConfig;
use crate::messages::{MessageId, SaltedId};

/// Opaque peer identifier (32 bytes, typically an Ed25519 public key).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex form for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Negotiated protocol variant for a peer.
///
/// The manager only sends control messages a peer's variant understands:
/// IDONTWANT requires v1.2, preamble/IMRECEIVING require v1.4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Codec {
    V10,
    V11,
    V12,
    V14,
}

impl Codec {
    pub fn supports_idontwant(&self) -> bool {
        *self >= Codec::V12
    }

    pub fn supports_preamble(&self) -> bool {
        *self >= Codec::V14
    }
}

/// Mutable per-peer state owned by the [`PeerStore`].
#[derive(Debug)]
pub struct PeerState {
    /// Externally computed score; fed by the scoring subsystem.
    pub score: f64,
    /// Whether we initiated the underlying connection.
    pub outbound: bool,
    /// Negotiated protocol variant.
    pub codec: Codec,
    /// IHAVE ids this peer may still advertise to us before the next refill.
    pub ihave_budget: i32,
    /// Ids we may still request from this peer before the next refill.
    pub iwant_budget: i32,
    /// Keepalive pings this peer may still spend before the next refill.
    pub ping_budget: i32,
    /// Preamble announcements this peer may still send before the next refill.
    pub preamble_budget: i32,
    /// Violation accumulator, read by the scoring subsystem.
    pub behaviour_penalty: f64,
    /// Ids we announced to this peer, one set per heartbeat generation.
    /// Front is the current generation; length <= history_length.
    sent_ihaves: VecDeque<HashSet<MessageId>>,
    /// Salted ids this peer asked us not to send, one set per generation.
    idontwants: VecDeque<HashSet<SaltedId>>,
    /// Large messages this peer told us it is about to transmit.
    #[cfg(feature = "preamble")]
    pub he_is_sendings: HashMap<MessageId, Instant>,
    /// Messages this peer told us it is currently receiving from elsewhere,
    /// with the declared length. Bounded by `MAX_HE_IS_RECEIVING`.
    #[cfg(feature = "preamble")]
    pub he_is_receivings: HashMap<MessageId, u64>,
    /// Smoothed download-rate estimate for this peer.
    #[cfg(feature = "preamble")]
    pub download: crate::preamble::BandwidthEstimate,
}

impl PeerState {
    pub fn new(outbound: bool, codec: Codec, config: &MeshConfig) -> Self {
        let mut state = Self {
            score: 0.0,
            outbound,
            codec,
            ihave_budget: config.ihave_peer_budget,
            iwant_budget: config.iwant_peer_budget,
            ping_budget: config.pings_peer_budget,
            preamble_budget: config.preamble_peer_budget,
            behaviour_penalty: 0.0,
            sent_ihaves: VecDeque::new(),
            idontwants: VecDeque::new(),
            #[cfg(feature = "preamble")]
            he_is_sendings: HashMap::new(),
            #[cfg(feature = "preamble")]
            he_is_receivings: HashMap::new(),
            #[cfg(feature = "preamble")]
            download: crate::preamble::BandwidthEstimate::default(),
        };
        state.rotate_history(config.history_length);
        state
    }

    /// Refill all budgets to their configured constants.
    pub fn refill_budgets(&mut self, config: &MeshConfig) {
        self.ihave_budget = config.ihave_peer_budget;
        self.iwant_budget = config.iwant_peer_budget;
        self.ping_budget = config.pings_peer_budget;
        self.preamble_budget = config.preamble_peer_budget;
    }

    /// Open a fresh history generation, dropping the oldest beyond
    /// `history_length`. Called once per heartbeat.
    pub fn rotate_history(&mut self, history_length: usize) {
        self.sent_ihaves.push_front(HashSet::new());
        while self.sent_ihaves.len() > history_length {
            self.sent_ihaves.pop_back();
        }
        self.idontwants.push_front(HashSet::new());
        while self.idontwants.len() > history_length {
            self.idontwants.pop_back();
        }
    }

    /// Record ids announced to this peer into the current generation.
    pub fn record_sent_ihaves(&mut self, ids: &[MessageId]) {
        if let Some(current) = self.sent_ihaves.front_mut() {
            current.extend(ids.iter().copied());
        }
    }

    /// Whether an IWANT for `id` is legitimate. True at most once per id:
    /// the announcement is consumed so a replayed request fails.
    pub fn can_ask_iwant(&mut self, id: &MessageId) -> bool {
        for generation in self.sent_ihaves.iter_mut() {
            if generation.remove(id) {
                return true;
            }
        }
        false
    }

    /// Record a salted id the peer declined. Returns false once the current
    /// generation is full; callers drop the remainder of the message.
    pub fn add_idontwant(&mut self, salted: SaltedId, max_count: usize) -> bool {
        match self.idontwants.front_mut() {
            Some(current) if current.len() < max_count => {
                current.insert(salted);
                true
            }
            _ => false,
        }
    }

    /// Whether the peer declined this salted id in any live generation.
    pub fn declined(&self, salted: &SaltedId) -> bool {
        self.idontwants.iter().any(|set| set.contains(salted))
    }

    /// Spend one ping from the budget, if any remains.
    pub fn consume_ping_budget(&mut self) -> bool {
        if self.ping_budget > 0 {
            self.ping_budget -= 1;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn sent_ihave_generations(&self) -> usize {
        self.sent_ihaves.len()
    }

    #[cfg(test)]
    pub(crate) fn idontwant_generations(&self) -> usize {
        self.idontwants.len()
    }
}

/// Store of all connected peers, keyed by [`PeerId`].
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<PeerId, PeerState>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly connected peer. An existing entry is replaced: the
    /// transport reports one connection per peer at a time.
    pub fn insert(&mut self, peer: PeerId, state: PeerState) {
        self.peers.insert(peer, state);
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerState> {
        self.peers.remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerState> {
        self.peers.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerState> {
        self.peers.get_mut(peer)
    }

    /// Score of a connected peer; `None` when unknown (disconnected).
    pub fn score(&self, peer: &PeerId) -> Option<f64> {
        self.peers.get(peer).map(|p| p.score)
    }

    pub fn set_score(&mut self, peer: &PeerId, score: f64) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.score = score;
        }
    }

    pub fn add_behaviour_penalty(&mut self, peer: &PeerId, penalty: f64) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.behaviour_penalty += penalty;
        }
    }

    pub fn behaviour_penalty(&self, peer: &PeerId) -> f64 {
        self.peers.get(peer).map(|p| p.behaviour_penalty).unwrap_or(0.0)
    }

    pub fn for_each_mut(&mut self, mut f: impl FnMut(&PeerId, &mut PeerState)) {
        for (peer, state) in self.peers.iter_mut() {
            f(peer, state);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
