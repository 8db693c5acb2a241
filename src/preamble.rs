//! # Preamble / Bandwidth Extension (GossipSub v1.4)
//!
//! Tracks in-flight large-message receptions announced by PREAMBLE, so that
//! redundant IWANTs elsewhere can be suppressed while the payload is still
//! arriving. Two moment-keyed expiry stores:
//!
//! | Store | Meaning |
//! |-------|---------|
//! | ongoing receives | a mesh peer announced it is transmitting to us |
//! | ongoing IWANT receives | we asked for the message and are waiting |
//!
//! Expiry is derived from the declared length and a smoothed per-peer
//! download-rate estimate. An expired ongoing receive penalizes the sender
//! and, in pull mode, retries via IWANT from an alternate sender; an expired
//! IWANT wait is terminal and is surfaced to the caller as an event.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::messages::MessageId;
use crate::peer::PeerId;

/// Floor for any transmission-time estimate.
pub const MIN_RECEIVE_TIME: Duration = Duration::from_millis(200);

/// Estimate used when no usable download rate is known.
pub const FALLBACK_RECEIVE_TIME: Duration = Duration::from_secs(5);

/// Initial download-rate guess for a fresh peer (1 Mbit/s).
pub const INITIAL_DOWNLOAD_RATE: f64 = 125_000.0;

/// Smoothing factor of the download-rate estimate.
const BANDWIDTH_ALPHA: f64 = 0.25;

/// Conservative wall-clock estimate for receiving `bytes` at `bytes_per_sec`.
///
/// Doubles the nominal transfer time to absorb jitter and framing overhead,
/// and falls back to a fixed pessimistic value when the rate is unknown.
pub fn receive_time(bytes: u64, bytes_per_sec: f64) -> Duration {
    if bytes_per_sec <= 0.0 {
        return FALLBACK_RECEIVE_TIME;
    }
    let millis = (bytes as f64 / bytes_per_sec) * 1000.0 * 2.0;
    Duration::from_millis(millis as u64).max(MIN_RECEIVE_TIME)
}

/// Exponentially smoothed bytes-per-second download estimate for one peer.
#[derive(Clone, Copy, Debug)]
pub struct BandwidthEstimate {
    bytes_per_sec: f64,
}

impl Default for BandwidthEstimate {
    fn default() -> Self {
        Self {
            bytes_per_sec: INITIAL_DOWNLOAD_RATE,
        }
    }
}

impl BandwidthEstimate {
    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_per_sec
    }

    /// Fold a completed transfer into the estimate.
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || bytes == 0 {
            return;
        }
        let sample = bytes as f64 / secs;
        self.bytes_per_sec = BANDWIDTH_ALPHA * sample + (1.0 - BANDWIDTH_ALPHA) * self.bytes_per_sec;
    }
}

/// Median of a set of download rates; 0.0 for an empty set.
pub fn median_download_rate(rates: &mut [f64]) -> f64 {
    if rates.is_empty() {
        return 0.0;
    }
    rates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = rates.len() / 2;
    if rates.len() % 2 == 0 {
        (rates[mid - 1] + rates[mid]) / 2.0
    } else {
        rates[mid]
    }
}

/// One tracked in-flight reception.
#[derive(Clone, Debug)]
pub struct OngoingReceive {
    pub message_id: MessageId,
    pub topic: String,
    pub message_length: u64,
    pub sender: PeerId,
    pub starts_at: Instant,
    pub expires_at: Instant,
    /// Alternate peers believed to hold the message, for pull-mode retries.
    pub candidates: Vec<PeerId>,
}

/// Upper bound on remembered alternate senders per tracked message.
/// SECURITY: Bounds the candidate list against IHAVE floods.
const MAX_ALTERNATE_SENDERS: usize = 16;

/// The two expiry stores of the preamble subsystem.
#[derive(Debug, Default)]
pub struct PreambleTracker {
    receives: HashMap<MessageId, OngoingReceive>,
    iwant_receives: HashMap<MessageId, OngoingReceive>,
}

impl PreambleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether either store tracks this id.
    pub fn tracks(&self, id: &MessageId) -> bool {
        self.receives.contains_key(id) || self.iwant_receives.contains_key(id)
    }

    pub fn tracks_receive(&self, id: &MessageId) -> bool {
        self.receives.contains_key(id)
    }

    /// Declared length of a tracked reception, if any.
    pub fn tracked_length(&self, id: &MessageId) -> Option<u64> {
        self.receives
            .get(id)
            .or_else(|| self.iwant_receives.get(id))
            .map(|entry| entry.message_length)
    }

    pub fn insert_receive(&mut self, entry: OngoingReceive) {
        self.receives.insert(entry.message_id, entry);
    }

    pub fn insert_iwant(&mut self, entry: OngoingReceive) {
        self.iwant_receives.insert(entry.message_id, entry);
    }

    /// Remember `peer` as a possible alternate source for a tracked message.
    pub fn add_candidate(&mut self, id: &MessageId, peer: PeerId) {
        let entry = match self.receives.get_mut(id) {
            Some(entry) => entry,
            None => match self.iwant_receives.get_mut(id) {
                Some(entry) => entry,
                None => return,
            },
        };
        if entry.sender != peer
            && !entry.candidates.contains(&peer)
            && entry.candidates.len() < MAX_ALTERNATE_SENDERS
        {
            entry.candidates.push(peer);
        }
    }

    /// Forget a message in both stores (it arrived, or was declined).
    pub fn remove(&mut self, id: &MessageId) -> Option<OngoingReceive> {
        let receive = self.receives.remove(id);
        let iwant = self.iwant_receives.remove(id);
        receive.or(iwant)
    }

    /// Take every ongoing receive whose deadline has passed.
    pub fn drain_expired_receives(&mut self, now: Instant) -> Vec<OngoingReceive> {
        let expired: Vec<MessageId> = self
            .receives
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.receives.remove(&id))
            .collect()
    }

    /// Take every IWANT wait whose deadline has passed. Terminal.
    pub fn drain_expired_iwants(&mut self, now: Instant) -> Vec<OngoingReceive> {
        let expired: Vec<MessageId> = self
            .iwant_receives
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.iwant_receives.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.receives.len() + self.iwant_receives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receives.is_empty() && self.iwant_receives.is_empty()
    }
}
