//! # Mesh Manager Configuration
//!
//! Tunable parameters and protocol constants for the mesh manager.
//!
//! The defaults follow the GossipSub v1.1 reference parameters: a target mesh
//! degree of `D = 6` bounded by `[d_low, d_high]`, an outbound-connection
//! floor `d_out` for eclipse resistance, and a score-protected core `d_score`
//! that is never pruned during rebalancing.

use std::collections::HashSet;
use std::time::Duration;

use crate::peer::PeerId;

// ============================================================================
// Mesh Degree Parameters (GossipSub v1.1)
// ============================================================================

/// D - Target number of peers in the mesh per topic.
pub const DEFAULT_D: usize = 6;

/// D_lo - Minimum mesh size before the heartbeat grafts more peers.
pub const DEFAULT_D_LOW: usize = 5;

/// D_hi - Maximum mesh size before the heartbeat prunes excess peers.
pub const DEFAULT_D_HIGH: usize = 12;

/// D_out - Minimum outbound peers in the mesh.
/// SECURITY: Prevents eclipse attacks by requiring connections we initiated.
pub const DEFAULT_D_OUT: usize = 2;

/// D_score - Number of highest-scoring mesh peers protected from pruning.
pub const DEFAULT_D_SCORE: usize = 4;

/// D_lazy - Minimum number of non-mesh peers to gossip IHAVE to per heartbeat.
pub const DEFAULT_D_LAZY: usize = 6;

/// Fraction of eligible non-mesh peers that receive gossip each heartbeat.
/// The effective gossip target is `max(d_lazy, gossip_factor * candidates)`.
pub const DEFAULT_GOSSIP_FACTOR: f64 = 0.25;

// ============================================================================
// Timing
// ============================================================================

/// Interval between heartbeat rounds (mesh maintenance, gossip emission).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default backoff installed when a peer is pruned from the mesh.
pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

/// Upper clamp for remotely-requested backoff durations.
/// SECURITY: A malicious PRUNE cannot lock us out of a topic for more
/// than a day.
pub const MAX_PRUNE_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Slack applied to backoff comparisons to absorb clock skew and message
/// reordering between peers.
pub const BACKOFF_SLACK: Duration = Duration::from_secs(2);

/// Time-to-live for fanout topics without a local publish.
pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);

// ============================================================================
// History and Gossip Windows
// ============================================================================

/// Number of heartbeat generations kept in the message cache and in the
/// per-peer IHAVE / IDONTWANT history rings.
pub const DEFAULT_HISTORY_LENGTH: usize = 5;

/// Number of most recent generations advertised in IHAVE gossip.
pub const DEFAULT_HISTORY_GOSSIP: usize = 3;

/// Maximum message ids advertised in a single IHAVE.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 5000;

/// Maximum salted ids recorded per peer per generation from IDONTWANT.
pub const DEFAULT_IDONTWANT_MAX_COUNT: usize = 1000;

// ============================================================================
// Per-Peer Budgets (refilled each heartbeat)
// ============================================================================

/// IHAVE message ids a peer may advertise to us between refills.
pub const DEFAULT_IHAVE_PEER_BUDGET: i32 = 10;

/// Message ids we may request from a single peer between refills.
pub const DEFAULT_IWANT_PEER_BUDGET: i32 = 25;

/// Keepalive pings a peer may spend between refills.
pub const DEFAULT_PINGS_PEER_BUDGET: i32 = 100;

/// Preamble announcements a peer may send between refills.
pub const DEFAULT_PREAMBLE_PEER_BUDGET: i32 = 5;

// ============================================================================
// Scoring Thresholds (computed externally, consumed here)
// ============================================================================

/// Score below which we neither publish to nor graft a peer.
pub const DEFAULT_PUBLISH_THRESHOLD: f64 = -50.0;

/// Score below which we exchange no gossip (IHAVE/IWANT) with a peer.
pub const DEFAULT_GOSSIP_THRESHOLD: f64 = -25.0;

/// If the median mesh score falls below this, high-scoring non-mesh peers
/// are opportunistically grafted to improve mesh quality.
pub const DEFAULT_OPPORTUNISTIC_GRAFT_THRESHOLD: f64 = 1.0;

/// Number of peers opportunistically grafted per heartbeat.
pub const DEFAULT_MAX_OPPORTUNISTIC_GRAFT_PEERS: usize = 2;

// ============================================================================
// Abuse Limits
// ============================================================================

/// Invalid (never announced or replayed) IWANT ids tolerated per RPC before
/// the whole response is aborted.
pub const MAX_IWANT_INVALID_REQUESTS: usize = 20;

/// Maximum entries in the backoff table.
/// SECURITY: Bounds memory usage from PRUNE backoff tracking.
pub const MAX_BACKOFF_ENTRIES: usize = 10_000;

/// Maximum topics tracked on behalf of remote subscriptions.
/// SECURITY: Prevents topic-table exhaustion from hostile subscribe floods.
pub const MAX_TRACKED_TOPICS: usize = 4096;

/// Maximum topic name length.
pub const MAX_TOPIC_LENGTH: usize = 256;

// ============================================================================
// Preamble Extension (GossipSub v1.4)
// ============================================================================

/// Maximum concurrently tracked IMRECEIVING entries per peer.
#[cfg(feature = "preamble")]
pub const MAX_HE_IS_RECEIVING: usize = 50;

/// Interval of the preamble expiration sweep.
#[cfg(feature = "preamble")]
pub const DEFAULT_PREAMBLE_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);

#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

/// Reasons a [`MeshConfig`] fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Mesh degree bounds must satisfy `d_low <= d <= d_high`.
    DegreeBounds,
    /// The outbound floor must fit below the minimum mesh size.
    OutboundFloor,
    /// The gossip window cannot exceed the history length.
    GossipWindow,
    /// Intervals must be non-zero.
    ZeroInterval,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DegreeBounds => write!(f, "mesh degree bounds must satisfy d_low <= d <= d_high"),
            Self::OutboundFloor => write!(f, "outbound floor d_out must not exceed d_low"),
            Self::GossipWindow => write!(f, "gossip window must not exceed history length"),
            Self::ZeroInterval => write!(f, "heartbeat intervals must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Mesh manager configuration.
///
/// All parameters of the maintenance loop and the control handlers. Scoring
/// itself is computed outside the manager; only the thresholds that gate
/// grafting, gossip and publishing live here.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// D - Target mesh degree per topic.
    pub d: usize,
    /// D_lo - Grafting low watermark.
    pub d_low: usize,
    /// D_hi - Pruning high watermark.
    pub d_high: usize,
    /// D_out - Minimum outbound peers kept in the mesh.
    pub d_out: usize,
    /// D_score - Highest-scoring peers never pruned during rebalance.
    pub d_score: usize,
    /// D_lazy - Minimum gossip recipients per heartbeat.
    pub d_lazy: usize,
    /// Fraction of eligible peers that receive gossip.
    pub gossip_factor: f64,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Backoff installed on peers we prune.
    pub prune_backoff: Duration,
    /// Fanout entries expire this long after the last local publish.
    pub fanout_ttl: Duration,
    /// Generations kept in the message cache and history rings.
    pub history_length: usize,
    /// Most recent generations advertised via IHAVE.
    pub history_gossip: usize,
    /// Score below which grafts and publishes are withheld.
    pub publish_threshold: f64,
    /// Score below which gossip is withheld.
    pub gossip_threshold: f64,
    /// Median mesh score triggering opportunistic grafting.
    pub opportunistic_graft_threshold: f64,
    /// Peers opportunistically grafted per heartbeat.
    pub max_opportunistic_graft_peers: usize,
    /// Attach peer-exchange lists to PRUNEs we send.
    pub enable_px: bool,
    /// Fixed peerings: never grafted, never pruned into, never gossiped at.
    pub direct_peers: HashSet<PeerId>,
    /// Maximum ids per outgoing IHAVE.
    pub max_ihave_length: usize,
    /// Maximum salted ids recorded per IDONTWANT generation.
    pub idontwant_max_count: usize,
    /// Per-heartbeat IHAVE budget granted to each peer.
    pub ihave_peer_budget: i32,
    /// Per-heartbeat cap on ids requested from one peer.
    pub iwant_peer_budget: i32,
    /// Per-heartbeat ping budget granted to each peer.
    pub pings_peer_budget: i32,
    /// Per-heartbeat preamble budget granted to each peer.
    pub preamble_peer_budget: i32,
    /// Slack for backoff comparisons (clock skew, reordering).
    pub backoff_slack: Duration,
    /// Interval of the preamble expiration sweep.
    #[cfg(feature = "preamble")]
    pub preamble_heartbeat_interval: Duration,
    /// Retry expired preamble receptions by IWANT from an alternate sender.
    #[cfg(feature = "preamble")]
    pub preamble_pull: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            d: DEFAULT_D,
            d_low: DEFAULT_D_LOW,
            d_high: DEFAULT_D_HIGH,
            d_out: DEFAULT_D_OUT,
            d_score: DEFAULT_D_SCORE,
            d_lazy: DEFAULT_D_LAZY,
            gossip_factor: DEFAULT_GOSSIP_FACTOR,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            fanout_ttl: DEFAULT_FANOUT_TTL,
            history_length: DEFAULT_HISTORY_LENGTH,
            history_gossip: DEFAULT_HISTORY_GOSSIP,
            publish_threshold: DEFAULT_PUBLISH_THRESHOLD,
            gossip_threshold: DEFAULT_GOSSIP_THRESHOLD,
            opportunistic_graft_threshold: DEFAULT_OPPORTUNISTIC_GRAFT_THRESHOLD,
            max_opportunistic_graft_peers: DEFAULT_MAX_OPPORTUNISTIC_GRAFT_PEERS,
            enable_px: false,
            direct_peers: HashSet::new(),
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            idontwant_max_count: DEFAULT_IDONTWANT_MAX_COUNT,
            ihave_peer_budget: DEFAULT_IHAVE_PEER_BUDGET,
            iwant_peer_budget: DEFAULT_IWANT_PEER_BUDGET,
            pings_peer_budget: DEFAULT_PINGS_PEER_BUDGET,
            preamble_peer_budget: DEFAULT_PREAMBLE_PEER_BUDGET,
            backoff_slack: BACKOFF_SLACK,
            #[cfg(feature = "preamble")]
            preamble_heartbeat_interval: DEFAULT_PREAMBLE_HEARTBEAT_INTERVAL,
            #[cfg(feature = "preamble")]
            preamble_pull: true,
        }
    }
}

impl MeshConfig {
    /// Check internal consistency of the parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.d_low <= self.d && self.d <= self.d_high) {
            return Err(ConfigError::DegreeBounds);
        }
        if self.d_out > self.d_low {
            return Err(ConfigError::OutboundFloor);
        }
        if self.history_gossip > self.history_length || self.history_length == 0 {
            return Err(ConfigError::GossipWindow);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        #[cfg(feature = "preamble")]
        if self.preamble_heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.d_low <= config.d);
        assert!(config.d <= config.d_high);
        assert!(config.d_out <= config.d_low);
        assert!(config.history_gossip <= config.history_length);
        assert!(config.gossip_factor > 0.0 && config.gossip_factor <= 1.0);
    }

    #[test]
    fn degree_bounds_rejected() {
        let config = MeshConfig {
            d_low: 8,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::DegreeBounds));
    }

    #[test]
    fn outbound_floor_rejected() {
        let config = MeshConfig {
            d_out: 6,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::OutboundFloor));
    }

    #[test]
    fn gossip_window_rejected() {
        let config = MeshConfig {
            history_gossip: 9,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::GossipWindow));
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("blocks"));
        assert!(is_valid_topic("shard 7"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)));
        assert!(!is_valid_topic("bad\ntopic"));
    }

    #[test]
    fn config_error_display() {
        let err: anyhow::Error = ConfigError::OutboundFloor.into();
        assert!(err.to_string().contains("d_out"));
    }
}
