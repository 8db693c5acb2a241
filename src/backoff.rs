//! # GRAFT Backoff Table
//!
//! Per-`(topic, peer)` record of the earliest moment a GRAFT to that peer is
//! allowed again. Entries are installed when we prune a peer, when a peer
//! prunes us, and when we reject a GRAFT; they never shorten.
//!
//! Comparisons take a `slack` argument to absorb clock skew and reordering:
//! a peer is backing off iff `expiry - slack > now`. The GRAFT handler passes
//! twice the configured slack so a remote grafting right at the boundary is
//! not punished for a few seconds of drift.

use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use tracing::trace;

use crate::config::MAX_BACKOFF_ENTRIES;
use crate::peer::PeerId;

type BackoffKey = (String, PeerId);

/// Bounded table of GRAFT backoffs.
///
/// SECURITY: LRU-bounded by `MAX_BACKOFF_ENTRIES` so a flood of PRUNEs across
/// fabricated topics cannot grow the table without limit.
pub struct BackoffTable {
    entries: LruCache<BackoffKey, Instant>,
}

impl Default for BackoffTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffTable {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_BACKOFF_ENTRIES).expect("MAX_BACKOFF_ENTRIES must be non-zero");
        Self {
            entries: LruCache::new(cap),
        }
    }

    /// Install a backoff until `until`, keeping any later existing expiry.
    pub fn set(&mut self, topic: &str, peer: &PeerId, until: Instant) {
        let key = (topic.to_string(), *peer);
        let expiry = match self.entries.get(&key) {
            Some(existing) => (*existing).max(until),
            None => until,
        };
        self.entries.put(key, expiry);
        trace!(peer = %peer, topic = %topic, "backoff installed");
    }

    /// Whether a GRAFT towards `peer` for `topic` is still disallowed.
    pub fn is_backing_off(
        &mut self,
        topic: &str,
        peer: &PeerId,
        now: Instant,
        slack: std::time::Duration,
    ) -> bool {
        let key = (topic.to_string(), *peer);
        match self.entries.get(&key) {
            Some(expiry) => expiry.checked_sub(slack).map(|e| e > now).unwrap_or(false),
            None => false,
        }
    }

    /// Drop entries for `topic` whose expiry has passed. Called once per
    /// topic every heartbeat.
    pub fn age_expired(&mut self, topic: &str, now: Instant) {
        let expired: Vec<BackoffKey> = self
            .entries
            .iter()
            .filter(|((t, _), expiry)| t == topic && **expiry <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
