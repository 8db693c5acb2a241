//! # Per-Topic Peer Sets
//!
//! Three roles per topic: `subscribers` (every peer known to subscribe),
//! `mesh` (bounded forwarding set, with graft times), and `fanout`
//! (transient forwarding set for topics we publish without subscribing).
//!
//! Mesh and fanout are kept disjoint: grafting removes the peer from fanout,
//! and fanout selection never considers mesh members. Sets hold peer ids
//! only; the mutable peer state lives in the peer store.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::peer::PeerId;

/// Peer sets for a single topic.
#[derive(Debug, Default)]
pub struct TopicPeers {
    /// All peers known to subscribe to the topic.
    pub subscribers: HashSet<PeerId>,
    /// Forwarding mesh, peer -> graft time.
    mesh: HashMap<PeerId, Instant>,
    /// Transient forwarding set for publishes without a subscription.
    fanout: HashSet<PeerId>,
    /// Last local publish on this topic while unsubscribed.
    fanout_last_pub: Option<Instant>,
}

impl TopicPeers {
    pub fn in_mesh(&self, peer: &PeerId) -> bool {
        self.mesh.contains_key(peer)
    }

    pub fn mesh_len(&self) -> usize {
        self.mesh.len()
    }

    pub fn mesh_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.mesh.keys()
    }

    pub fn graft_time(&self, peer: &PeerId) -> Option<Instant> {
        self.mesh.get(peer).copied()
    }

    /// Add a peer to the mesh, recording the graft time and evicting it from
    /// fanout so the sets stay disjoint.
    pub fn graft(&mut self, peer: PeerId, now: Instant) {
        self.fanout.remove(&peer);
        self.mesh.entry(peer).or_insert(now);
    }

    /// Remove a peer from the mesh. Returns true if it was a member.
    pub fn prune(&mut self, peer: &PeerId) -> bool {
        self.mesh.remove(peer).is_some()
    }

    pub fn in_fanout(&self, peer: &PeerId) -> bool {
        self.fanout.contains(peer)
    }

    pub fn fanout_len(&self) -> usize {
        self.fanout.len()
    }

    pub fn fanout_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.fanout.iter()
    }

    /// Add a peer to fanout unless it is already in the mesh.
    pub fn fanout_add(&mut self, peer: PeerId) {
        if !self.mesh.contains_key(&peer) {
            self.fanout.insert(peer);
        }
    }

    pub fn fanout_remove(&mut self, peer: &PeerId) -> bool {
        self.fanout.remove(peer)
    }

    /// Record a local publish on an unsubscribed topic.
    pub fn touch_fanout(&mut self, now: Instant) {
        self.fanout_last_pub = Some(now);
    }

    /// Whether the fanout entry has outlived `ttl` without a publish.
    pub fn fanout_expired(&self, now: Instant, ttl: Duration) -> bool {
        match self.fanout_last_pub {
            Some(last) => now.duration_since(last) > ttl,
            None => true,
        }
    }

    /// Whether the topic carries any fanout role (members or a live TTL).
    pub fn fanout_active(&self) -> bool {
        !self.fanout.is_empty() || self.fanout_last_pub.is_some()
    }

    /// Drop the whole fanout role for this topic.
    pub fn clear_fanout(&mut self) {
        self.fanout.clear();
        self.fanout_last_pub = None;
    }

    /// Remove a peer from every role. Called on disconnect and unsubscribe.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.subscribers.remove(peer);
        self.mesh.remove(peer);
        self.fanout.remove(peer);
    }

    /// True when no role references any peer and no fanout state is live.
    pub fn is_idle(&self) -> bool {
        self.subscribers.is_empty()
            && self.mesh.is_empty()
            && self.fanout.is_empty()
            && self.fanout_last_pub.is_none()
    }
}
