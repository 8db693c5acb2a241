//! # Mesh Manager
//!
//! The heart of the crate: chooses which peers form the forwarding mesh of
//! each topic, maintains the mesh under churn and adversarial behavior, and
//! drives the lazy gossip that complements mesh delivery.
//!
//! ## Architecture
//!
//! Actor pattern: [`MeshManager`] is a cheaply clonable handle whose methods
//! post commands over an async channel; a private [`MeshActor`] task owns all
//! mutable state and serializes commands with the periodic heartbeat (and the
//! preamble expiration sweep when the `preamble` feature is enabled) through
//! `tokio::select!`. Nothing outside the actor task touches the tables, so a
//! handler observes consistent state between any two await points.
//!
//! ## Ordering
//!
//! Within one rebalance, table mutations complete before any GRAFT/PRUNE is
//! handed to the transport, so a remote observing our control traffic sees
//! membership consistent with it. Failed sends never roll membership back;
//! the next heartbeat reconciles.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::backoff::BackoffTable;
use crate::config::{is_valid_topic, MeshConfig, MAX_IWANT_INVALID_REQUESTS, MAX_TRACKED_TOPICS};
use crate::mcache::{CachedMessage, MessageCache};
use crate::messages::{ControlMessage, MessageId, PeerInfo, SaltedId};
use crate::peer::{Codec, PeerId, PeerState, PeerStore};
use crate::protocols::{MeshRpc, RecordBook, SeenIndex};
use crate::records::SignedPeerRecord;
use crate::topics::TopicPeers;

#[cfg(feature = "preamble")]
use crate::config::MAX_HE_IS_RECEIVING;
#[cfg(feature = "preamble")]
use crate::preamble::{median_download_rate, receive_time, OngoingReceive, PreambleTracker};

/// Penalty charged for each detected protocol violation.
const BEHAVIOUR_PENALTY_STEP: f64 = 0.1;

// ============================================================================
// Events and Telemetry
// ============================================================================

/// Events surfaced to the embedding node.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// Validated peer-exchange information from a PRUNE we received.
    PeerExchange {
        topic: String,
        /// Every peer id carried by the PRUNE, record or not.
        peers: Vec<PeerId>,
        /// The subset that arrived with a valid signed record.
        records: Vec<SignedPeerRecord>,
    },
    /// An awaited message never arrived; no further in-core recovery.
    RetrievalFailed {
        topic: String,
        message_id: MessageId,
    },
    /// End of a heartbeat round. Useful as a synchronization point.
    Heartbeat,
}

/// Write-only counters, snapshot on demand.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySnapshot {
    pub received_iwants_correct: u64,
    pub received_iwants_unknown: u64,
    pub received_iwants_notsent: u64,
    pub received_iwants_skipped: u64,
    pub ihave_budget_exhausted: u64,
    pub gossip_ihaves_sent: u64,
    pub dhigh_prunes: u64,
    pub negative_score_prunes: u64,
    pub opportunistic_grafts: u64,
    pub backoff_violations: u64,
    pub direct_grafts_rejected: u64,
    pub low_peer_topics: u64,
    pub preamble_saved_iwants: u64,
    pub retrieval_failures: u64,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Subscribe(String, oneshot::Sender<anyhow::Result<()>>),
    Unsubscribe(String, oneshot::Sender<anyhow::Result<()>>),
    PeerConnected {
        peer: PeerId,
        outbound: bool,
        codec: Codec,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    PeerSubscribed {
        peer: PeerId,
        topic: String,
    },
    PeerUnsubscribed {
        peer: PeerId,
        topic: String,
    },
    SetScore {
        peer: PeerId,
        score: f64,
    },
    Control {
        from: PeerId,
        msgs: Vec<ControlMessage>,
        reply: oneshot::Sender<Vec<CachedMessage>>,
    },
    MessageReceived {
        topic: String,
        message_id: MessageId,
        data: Vec<u8>,
        from: Option<PeerId>,
    },
    Published {
        topic: String,
        message_id: MessageId,
        data: Vec<u8>,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    MeshPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    BehaviourPenalty {
        peer: PeerId,
        reply: oneshot::Sender<f64>,
    },
    PeerDeclined {
        peer: PeerId,
        salted: SaltedId,
        reply: oneshot::Sender<bool>,
    },
    ConsumePingBudget {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Telemetry {
        reply: oneshot::Sender<TelemetrySnapshot>,
    },
    #[cfg(feature = "preamble")]
    RecordDownload {
        peer: PeerId,
        bytes: u64,
        elapsed: Duration,
    },
    Quit,
}

// ============================================================================
// Mesh Manager Handle (public API - cheap to clone)
// ============================================================================

/// Handle to the mesh manager actor.
#[derive(Clone)]
pub struct MeshManager {
    cmd_tx: mpsc::Sender<Command>,
}

impl MeshManager {
    /// Spawn the manager actor.
    ///
    /// `network` delivers outbound control messages, `seen` is the PubSub
    /// base's duplicate index, and `records` resolves signed address records
    /// for peer exchange. Returns the handle and the event stream.
    pub fn spawn<N: MeshRpc + 'static>(
        network: Arc<N>,
        seen: Arc<dyn SeenIndex>,
        records: Arc<dyn RecordBook>,
        config: MeshConfig,
    ) -> anyhow::Result<(Self, mpsc::Receiver<MeshEvent>)> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let (event_tx, event_rx) = mpsc::channel(1024);

        let actor = MeshActor::new(network, seen, records, config, event_tx);
        tokio::spawn(actor.run(cmd_rx));

        Ok((Self { cmd_tx }, event_rx))
    }

    /// Join a topic. The mesh forms on the next heartbeat and via GRAFTs.
    pub async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(topic.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("mesh manager actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("mesh manager actor closed"))?
    }

    /// Leave a topic, pruning every mesh member.
    pub async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unsubscribe(topic.to_string(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("mesh manager actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("mesh manager actor closed"))?
    }

    /// Register a connected peer with its direction and negotiated variant.
    pub async fn peer_connected(&self, peer: PeerId, outbound: bool, codec: Codec) {
        let _ = self
            .cmd_tx
            .send(Command::PeerConnected {
                peer,
                outbound,
                codec,
            })
            .await;
    }

    /// Drop every trace of a disconnected peer.
    pub async fn peer_disconnected(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::PeerDisconnected { peer }).await;
    }

    /// Note a remote subscription.
    pub async fn peer_subscribed(&self, peer: PeerId, topic: &str) {
        let _ = self
            .cmd_tx
            .send(Command::PeerSubscribed {
                peer,
                topic: topic.to_string(),
            })
            .await;
    }

    /// Note a remote unsubscription.
    pub async fn peer_unsubscribed(&self, peer: PeerId, topic: &str) {
        let _ = self
            .cmd_tx
            .send(Command::PeerUnsubscribed {
                peer,
                topic: topic.to_string(),
            })
            .await;
    }

    /// Feed an externally computed score for a peer.
    pub async fn set_score(&self, peer: PeerId, score: f64) {
        let _ = self.cmd_tx.send(Command::SetScore { peer, score }).await;
    }

    /// Process inbound control messages from one peer (one RPC).
    ///
    /// Returns the cached messages satisfying any IWANTs in the RPC; the
    /// caller transmits them through the envelope layer.
    pub async fn handle_control(
        &self,
        from: PeerId,
        msgs: Vec<ControlMessage>,
    ) -> anyhow::Result<Vec<CachedMessage>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Control {
                from,
                msgs,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mesh manager actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("mesh manager actor closed"))
    }

    /// Record a received message into the gossip window.
    pub async fn message_received(
        &self,
        topic: &str,
        message_id: MessageId,
        data: Vec<u8>,
        from: Option<PeerId>,
    ) {
        let _ = self
            .cmd_tx
            .send(Command::MessageReceived {
                topic: topic.to_string(),
                message_id,
                data,
                from,
            })
            .await;
    }

    /// Record a local publish; returns the peers the caller should forward
    /// the full message to (mesh members, or the fanout set when the topic
    /// is not subscribed).
    pub async fn published(
        &self,
        topic: &str,
        message_id: MessageId,
        data: Vec<u8>,
    ) -> anyhow::Result<Vec<PeerId>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Published {
                topic: topic.to_string(),
                message_id,
                data,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mesh manager actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("mesh manager actor closed"))
    }

    /// Current mesh members of a topic.
    pub async fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::MeshPeers {
                topic: topic.to_string(),
                reply: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Accumulated behaviour penalty for a peer; read by scoring.
    pub async fn behaviour_penalty(&self, peer: PeerId) -> f64 {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::BehaviourPenalty { peer, reply: tx })
            .await
            .is_err()
        {
            return 0.0;
        }
        rx.await.unwrap_or(0.0)
    }

    /// Whether the peer declined this salted id via IDONTWANT. The
    /// forwarding layer checks this before pushing a full payload.
    pub async fn peer_declined(&self, peer: PeerId, salted: SaltedId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::PeerDeclined {
                peer,
                salted,
                reply: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Spend one unit of the peer's keepalive ping budget.
    pub async fn consume_ping_budget(&self, peer: PeerId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ConsumePingBudget { peer, reply: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Snapshot of the manager's counters.
    pub async fn telemetry(&self) -> TelemetrySnapshot {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Telemetry { reply: tx })
            .await
            .is_err()
        {
            return TelemetrySnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Fold a completed download into a peer's bandwidth estimate.
    #[cfg(feature = "preamble")]
    pub async fn record_download(&self, peer: PeerId, bytes: u64, elapsed: Duration) {
        let _ = self
            .cmd_tx
            .send(Command::RecordDownload {
                peer,
                bytes,
                elapsed,
            })
            .await;
    }

    /// Stop the actor.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Mesh Actor (owns state)
// ============================================================================

struct MeshActor<N: MeshRpc> {
    network: Arc<N>,
    seen: Arc<dyn SeenIndex>,
    records: Arc<dyn RecordBook>,
    config: MeshConfig,
    peers: PeerStore,
    topics: std::collections::HashMap<String, TopicPeers>,
    subscriptions: HashSet<String>,
    backoff: BackoffTable,
    mcache: MessageCache,
    events: mpsc::Sender<MeshEvent>,
    telemetry: TelemetrySnapshot,
    #[cfg(feature = "preamble")]
    preamble: PreambleTracker,
}

impl<N: MeshRpc + 'static> MeshActor<N> {
    fn new(
        network: Arc<N>,
        seen: Arc<dyn SeenIndex>,
        records: Arc<dyn RecordBook>,
        config: MeshConfig,
        events: mpsc::Sender<MeshEvent>,
    ) -> Self {
        let mcache = MessageCache::new(config.history_gossip, config.history_length);
        Self {
            network,
            seen,
            records,
            config,
            peers: PeerStore::new(),
            topics: std::collections::HashMap::new(),
            subscriptions: HashSet::new(),
            backoff: BackoffTable::new(),
            mcache,
            events,
            telemetry: TelemetrySnapshot::default(),
            #[cfg(feature = "preamble")]
            preamble: PreambleTracker::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        #[cfg(feature = "preamble")]
        let mut expiry = tokio::time::interval(self.config.preamble_heartbeat_interval);
        #[cfg(not(feature = "preamble"))]
        let mut expiry = tokio::time::interval(Duration::from_secs(3600));

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.dispatch(cmd).await {
                                debug!("mesh manager actor quitting");
                                break;
                            }
                        }
                        None => {
                            debug!("mesh manager handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.heartbeat(Instant::now()).await;
                }
                _ = expiry.tick() => {
                    #[cfg(feature = "preamble")]
                    self.preamble_expiry(Instant::now()).await;
                }
            }
        }
    }

    /// Returns true when the actor should stop.
    async fn dispatch(&mut self, cmd: Command) -> bool {
        let now = Instant::now();
        match cmd {
            Command::Subscribe(topic, reply) => {
                let _ = reply.send(self.subscribe(&topic));
            }
            Command::Unsubscribe(topic, reply) => {
                let _ = reply.send(self.unsubscribe(&topic, now).await);
            }
            Command::PeerConnected {
                peer,
                outbound,
                codec,
            } => {
                self.peers
                    .insert(peer, PeerState::new(outbound, codec, &self.config));
                trace!(peer = %peer, outbound, "peer connected");
            }
            Command::PeerDisconnected { peer } => {
                self.peer_disconnected(&peer);
            }
            Command::PeerSubscribed { peer, topic } => {
                self.peer_subscribed(peer, topic);
            }
            Command::PeerUnsubscribed { peer, topic } => {
                if let Some(tp) = self.topics.get_mut(&topic) {
                    tp.remove_peer(&peer);
                }
                self.drop_idle_topic(&topic);
            }
            Command::SetScore { peer, score } => {
                self.peers.set_score(&peer, score);
            }
            Command::Control { from, msgs, reply } => {
                let _ = reply.send(self.on_control(from, msgs, now).await);
            }
            Command::MessageReceived {
                topic,
                message_id,
                data,
                from,
            } => {
                self.on_message(topic, message_id, data, from);
            }
            Command::Published {
                topic,
                message_id,
                data,
                reply,
            } => {
                let _ = reply.send(self.on_published(&topic, message_id, data, now));
            }
            Command::MeshPeers { topic, reply } => {
                let peers = self
                    .topics
                    .get(&topic)
                    .map(|tp| tp.mesh_peers().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::BehaviourPenalty { peer, reply } => {
                let _ = reply.send(self.peers.behaviour_penalty(&peer));
            }
            Command::PeerDeclined {
                peer,
                salted,
                reply,
            } => {
                let declined = self
                    .peers
                    .get(&peer)
                    .map(|p| p.declined(&salted))
                    .unwrap_or(false);
                let _ = reply.send(declined);
            }
            Command::ConsumePingBudget { peer, reply } => {
                let granted = self
                    .peers
                    .get_mut(&peer)
                    .map(|p| p.consume_ping_budget())
                    .unwrap_or(false);
                let _ = reply.send(granted);
            }
            Command::Telemetry { reply } => {
                let _ = reply.send(self.telemetry.clone());
            }
            #[cfg(feature = "preamble")]
            Command::RecordDownload {
                peer,
                bytes,
                elapsed,
            } => {
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.download.record(bytes, elapsed);
                }
            }
            Command::Quit => return true,
        }
        false
    }

    // ========================================================================
    // Subscription lifecycle
    // ========================================================================

    fn subscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        if !is_valid_topic(topic) {
            anyhow::bail!("invalid topic name");
        }
        if !self.subscriptions.insert(topic.to_string()) {
            return Ok(());
        }
        let entry = self.topics.entry(topic.to_string()).or_default();
        // the fanout role dissolves once we subscribe; members become
        // ordinary graft candidates on the next heartbeat
        entry.clear_fanout();
        debug!(topic = %topic, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str, now: Instant) -> anyhow::Result<()> {
        if !self.subscriptions.remove(topic) {
            return Ok(());
        }
        let mesh: Vec<PeerId> = match self.topics.get_mut(topic) {
            Some(tp) => {
                let members: Vec<PeerId> = tp.mesh_peers().copied().collect();
                for peer in &members {
                    tp.prune(peer);
                }
                members
            }
            None => Vec::new(),
        };
        for peer in mesh {
            self.backoff
                .set(topic, &peer, now + self.config.prune_backoff);
            let msg = self.prune_message(topic, &peer, true);
            self.send(&peer, msg).await;
        }
        self.drop_idle_topic(topic);
        debug!(topic = %topic, "unsubscribed");
        Ok(())
    }

    fn peer_subscribed(&mut self, peer: PeerId, topic: String) {
        if !is_valid_topic(&topic) {
            return;
        }
        if !self.topics.contains_key(&topic) && self.topics.len() >= MAX_TRACKED_TOPICS {
            warn!(topic = %topic, "topic table full, ignoring remote subscription");
            return;
        }
        self.topics.entry(topic).or_default().subscribers.insert(peer);
    }

    fn peer_disconnected(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        let mut emptied: Vec<String> = Vec::new();
        for (topic, tp) in self.topics.iter_mut() {
            tp.remove_peer(peer);
            if tp.is_idle() {
                emptied.push(topic.clone());
            }
        }
        for topic in emptied {
            self.drop_idle_topic(&topic);
        }
        trace!(peer = %peer, "peer disconnected");
    }

    /// Remove a topic entry once nothing references it and we are not
    /// subscribed. Keeps the table from accumulating dead topics.
    fn drop_idle_topic(&mut self, topic: &str) {
        if self.subscriptions.contains(topic) {
            return;
        }
        if self
            .topics
            .get(topic)
            .map(|tp| tp.is_idle())
            .unwrap_or(false)
        {
            self.topics.remove(topic);
        }
    }

    // ========================================================================
    // Control handlers
    // ========================================================================

    async fn on_control(
        &mut self,
        from: PeerId,
        msgs: Vec<ControlMessage>,
        now: Instant,
    ) -> Vec<CachedMessage> {
        if !self.peers.contains(&from) {
            warn!(peer = %from, "control from unknown peer dropped");
            return Vec::new();
        }

        let mut replies: Vec<CachedMessage> = Vec::new();
        // IWANT validity and the IWANT list from IHAVEs are tracked per RPC
        let mut wanted: Vec<MessageId> = Vec::new();
        let mut invalid_iwants = 0usize;
        let mut iwant_aborted = false;

        for msg in msgs {
            match msg {
                ControlMessage::Graft { topic } => {
                    self.handle_graft(&from, &topic, now).await;
                }
                ControlMessage::Prune {
                    topic,
                    peers,
                    backoff_secs,
                } => {
                    self.handle_prune(&from, topic, peers, backoff_secs, now)
                        .await;
                }
                ControlMessage::IHave { topic, message_ids } => {
                    self.handle_ihave(&from, &topic, message_ids, &mut wanted);
                }
                ControlMessage::IWant { message_ids } => {
                    if iwant_aborted {
                        continue;
                    }
                    let aborted =
                        self.handle_iwant(&from, message_ids, &mut invalid_iwants, &mut replies);
                    iwant_aborted = aborted;
                }
                ControlMessage::IDontWant { message_ids } => {
                    self.handle_idontwant(&from, message_ids);
                }
                #[cfg(feature = "preamble")]
                ControlMessage::Preamble {
                    message_id,
                    topic,
                    message_length,
                } => {
                    self.handle_preamble(&from, message_id, topic, message_length, now)
                        .await;
                }
                #[cfg(feature = "preamble")]
                ControlMessage::ImReceiving {
                    message_id,
                    message_length,
                } => {
                    self.handle_imreceiving(&from, message_id, message_length);
                }
            }
        }

        if !wanted.is_empty() {
            // shuffled so a remote cannot bias which ids survive truncation
            wanted.shuffle(&mut rand::thread_rng());
            self.send(&from, ControlMessage::IWant {
                message_ids: wanted,
            })
            .await;
        }

        replies
    }

    async fn handle_graft(&mut self, from: &PeerId, topic: &str, now: Instant) {
        // direct peerings are fixed by configuration and may never be grafted
        if self.config.direct_peers.contains(from) {
            warn!(peer = %from, topic = %topic, "GRAFT from direct peer");
            self.peers
                .add_behaviour_penalty(from, BEHAVIOUR_PENALTY_STEP);
            self.backoff
                .set(topic, from, now + self.config.prune_backoff);
            self.telemetry.direct_grafts_rejected += 1;
            let msg = self.prune_message(topic, from, false);
            self.send(from, msg).await;
            return;
        }

        if self
            .topics
            .get(topic)
            .map(|tp| tp.in_mesh(from))
            .unwrap_or(false)
        {
            return;
        }

        // grafting during our backoff is a violation; double slack tolerates
        // honest clock skew right at the boundary
        let double_slack = self.config.backoff_slack * 2;
        if self.backoff.is_backing_off(topic, from, now, double_slack) {
            debug!(peer = %from, topic = %topic, "GRAFT during backoff");
            self.peers
                .add_behaviour_penalty(from, BEHAVIOUR_PENALTY_STEP);
            self.telemetry.backoff_violations += 1;
            self.backoff
                .set(topic, from, now + self.config.prune_backoff);
            let msg = self.prune_message(topic, from, false);
            self.send(from, msg).await;
            return;
        }

        let score = self.peers.score(from).unwrap_or(f64::NEG_INFINITY);
        if score < self.config.publish_threshold {
            return;
        }
        if !self.subscriptions.contains(topic) {
            return;
        }

        let outbound = self.peers.get(from).map(|p| p.outbound).unwrap_or(false);
        let (mesh_len, outbound_in_mesh) = self.mesh_counts(topic);
        if mesh_len < self.config.d_high || (outbound && outbound_in_mesh < self.config.d_out) {
            if let Some(tp) = self.topics.get_mut(topic) {
                // a graft may precede the subscribe notification
                tp.subscribers.insert(*from);
                tp.graft(*from, now);
            }
            debug!(peer = %from, topic = %topic, mesh = mesh_len + 1, "grafted peer");
        } else {
            self.backoff
                .set(topic, from, now + self.config.prune_backoff);
            let msg = self.prune_message(topic, from, true);
            self.send(from, msg).await;
        }
    }

    async fn handle_prune(
        &mut self,
        from: &PeerId,
        topic: String,
        peers: Vec<PeerInfo>,
        backoff_secs: u64,
        now: Instant,
    ) {
        let requested = if backoff_secs > 0 {
            Duration::from_secs(backoff_secs)
        } else {
            self.config.prune_backoff
        };
        let bounded =
            (requested + self.config.backoff_slack).min(crate::config::MAX_PRUNE_BACKOFF);
        self.backoff.set(&topic, from, now + bounded);

        if let Some(tp) = self.topics.get_mut(&topic) {
            if tp.prune(from) {
                debug!(peer = %from, topic = %topic, "pruned by peer");
            }
        }

        if peers.is_empty() {
            return;
        }
        let score = self.peers.score(from).unwrap_or(f64::NEG_INFINITY);
        if score <= self.config.gossip_threshold {
            trace!(peer = %from, "ignoring PX from low-score peer");
            return;
        }

        let mut ids: Vec<PeerId> = Vec::with_capacity(peers.len());
        let mut validated: Vec<SignedPeerRecord> = Vec::new();
        for info in &peers {
            match SignedPeerRecord::from_peer_info(info) {
                Ok(Some(record)) => {
                    ids.push(info.peer_id);
                    validated.push(record);
                }
                Ok(None) => ids.push(info.peer_id),
                Err(e) => {
                    debug!(peer = %from, error = %e, "discarding bad peer record in PX");
                    self.peers
                        .add_behaviour_penalty(from, BEHAVIOUR_PENALTY_STEP);
                }
            }
        }
        if ids.is_empty() {
            return;
        }
        let _ = self
            .events
            .send(MeshEvent::PeerExchange {
                topic,
                peers: ids,
                records: validated,
            })
            .await;
    }

    fn handle_ihave(
        &mut self,
        from: &PeerId,
        topic: &str,
        ids: Vec<MessageId>,
        wanted: &mut Vec<MessageId>,
    ) {
        let (score, mut ihave_budget, mut iwant_budget) = match self.peers.get(from) {
            Some(p) => (p.score, p.ihave_budget, p.iwant_budget),
            None => return,
        };
        if score < self.config.gossip_threshold {
            trace!(peer = %from, "IHAVE from low-score peer ignored");
            return;
        }
        if ihave_budget <= 0 {
            self.telemetry.ihave_budget_exhausted += 1;
            return;
        }
        if !self.subscriptions.contains(topic) {
            return;
        }

        for id in ids {
            // budget is checked before each candidate; exhaustion stops the
            // scan, it does not merely skip the current id
            if ihave_budget <= 0 {
                self.telemetry.ihave_budget_exhausted += 1;
                break;
            }
            if iwant_budget <= 0 {
                break;
            }
            let salted = self.seen.salt(&id);
            if self.seen.has_seen(&salted) {
                continue;
            }
            if wanted.contains(&id) {
                continue;
            }
            #[cfg(feature = "preamble")]
            if self.preamble.tracks(&id) {
                // already arriving; remember the advertiser as an alternate
                self.telemetry.preamble_saved_iwants += 1;
                self.preamble.add_candidate(&id, *from);
                continue;
            }
            wanted.push(id);
            ihave_budget -= 1;
            iwant_budget -= 1;
        }

        if let Some(p) = self.peers.get_mut(from) {
            p.ihave_budget = ihave_budget;
            p.iwant_budget = iwant_budget;
        }
    }

    /// Returns true when the response was aborted for excessive invalid ids.
    fn handle_iwant(
        &mut self,
        from: &PeerId,
        ids: Vec<MessageId>,
        invalid: &mut usize,
        replies: &mut Vec<CachedMessage>,
    ) -> bool {
        let score = self.peers.score(from).unwrap_or(f64::NEG_INFINITY);
        if score < self.config.gossip_threshold {
            trace!(peer = %from, "IWANT from low-score peer ignored");
            return false;
        }

        for id in ids {
            let legitimate = self
                .peers
                .get_mut(from)
                .map(|p| p.can_ask_iwant(&id))
                .unwrap_or(false);
            if !legitimate {
                self.telemetry.received_iwants_notsent += 1;
                *invalid += 1;
                if *invalid > MAX_IWANT_INVALID_REQUESTS {
                    self.telemetry.received_iwants_skipped += 1;
                    warn!(peer = %from, "excessive invalid IWANT ids, aborting response");
                    return true;
                }
                continue;
            }
            match self.mcache.get(&id) {
                Some(cached) => {
                    self.telemetry.received_iwants_correct += 1;
                    replies.push(cached.clone());
                }
                None => {
                    self.telemetry.received_iwants_unknown += 1;
                }
            }
        }
        false
    }

    fn handle_idontwant(&mut self, from: &PeerId, ids: Vec<MessageId>) {
        let max_count = self.config.idontwant_max_count;
        for id in ids {
            let salted = self.seen.salt(&id);
            let Some(peer) = self.peers.get_mut(from) else {
                return;
            };
            if !peer.add_idontwant(salted, max_count) {
                // generation full; the rest of the message is ignored
                break;
            }
            #[cfg(feature = "preamble")]
            {
                peer.he_is_receivings.remove(&id);
                self.preamble.add_candidate(&id, *from);
            }
        }
    }

    // ========================================================================
    // Preamble handlers (v1.4)
    // ========================================================================

    #[cfg(feature = "preamble")]
    async fn handle_preamble(
        &mut self,
        from: &PeerId,
        message_id: MessageId,
        topic: String,
        message_length: u64,
        now: Instant,
    ) {
        {
            let Some(peer) = self.peers.get_mut(from) else {
                return;
            };
            if !peer.codec.supports_preamble() {
                return;
            }
            if peer.preamble_budget <= 0 {
                trace!(peer = %from, "preamble budget exhausted");
                return;
            }
            peer.preamble_budget -= 1;
        }

        let salted = self.seen.salt(&message_id);
        if self.seen.has_seen(&salted) {
            return;
        }
        // TODO: a second preamble with a different length for a tracked id is
        // dropped here; decide whether a length conflict should penalize
        if self.preamble.tracks_receive(&message_id) {
            return;
        }

        let bps = {
            let Some(peer) = self.peers.get_mut(from) else {
                return;
            };
            if peer.he_is_sendings.contains_key(&message_id) {
                return;
            }
            peer.he_is_sendings.insert(message_id, now);
            peer.download.bytes_per_sec()
        };

        let expires_at = now + receive_time(message_length, bps);
        let in_mesh = self
            .topics
            .get(&topic)
            .map(|tp| tp.in_mesh(from))
            .unwrap_or(false);
        let entry = OngoingReceive {
            message_id,
            topic: topic.clone(),
            message_length,
            sender: *from,
            starts_at: now,
            expires_at,
            candidates: Vec::new(),
        };

        if !in_mesh {
            self.preamble.insert_iwant(entry);
            return;
        }
        self.preamble.insert_receive(entry);

        // announce to the v1.4 subset of the mesh, but only when the sender
        // is at least as fast as the median recipient
        let recipients: Vec<PeerId> = self
            .topics
            .get(&topic)
            .map(|tp| {
                tp.mesh_peers()
                    .copied()
                    .filter(|p| p != from)
                    .filter(|p| {
                        self.peers
                            .get(p)
                            .map(|s| s.codec.supports_preamble())
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut rates: Vec<f64> = recipients
            .iter()
            .filter_map(|p| self.peers.get(p))
            .map(|s| s.download.bytes_per_sec())
            .collect();
        let median = median_download_rate(&mut rates);
        if bps >= median {
            for peer in recipients {
                self.send(
                    &peer,
                    ControlMessage::ImReceiving {
                        message_id,
                        message_length,
                    },
                )
                .await;
            }
        }
    }

    #[cfg(feature = "preamble")]
    fn handle_imreceiving(&mut self, from: &PeerId, message_id: MessageId, message_length: u64) {
        if let Some(tracked) = self.preamble.tracked_length(&message_id) {
            if tracked != message_length {
                trace!(peer = %from, "IMRECEIVING length mismatch ignored");
                return;
            }
        }
        let Some(peer) = self.peers.get_mut(from) else {
            return;
        };
        if peer.he_is_receivings.len() >= MAX_HE_IS_RECEIVING
            && !peer.he_is_receivings.contains_key(&message_id)
        {
            return;
        }
        peer.he_is_receivings.insert(message_id, message_length);
    }

    #[cfg(feature = "preamble")]
    async fn preamble_expiry(&mut self, now: Instant) {
        let expired = self.preamble.drain_expired_receives(now);
        for entry in expired {
            debug!(
                peer = %entry.sender,
                message_id = %hex::encode(&entry.message_id[..8]),
                "announced reception expired"
            );
            self.peers
                .add_behaviour_penalty(&entry.sender, BEHAVIOUR_PENALTY_STEP);

            if !self.config.preamble_pull {
                continue;
            }
            let mut candidates: Vec<PeerId> = entry
                .candidates
                .iter()
                .copied()
                .filter(|p| *p != entry.sender)
                .filter(|p| {
                    self.peers
                        .get(p)
                        .map(|s| s.codec.supports_preamble() && s.iwant_budget > 0)
                        .unwrap_or(false)
                })
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            let Some(next) = candidates.first().copied() else {
                trace!(
                    message_id = %hex::encode(&entry.message_id[..8]),
                    "no alternate sender to pull from"
                );
                continue;
            };

            let bps = {
                let Some(state) = self.peers.get_mut(&next) else {
                    continue;
                };
                state.iwant_budget -= 1;
                state.download.bytes_per_sec()
            };
            let remaining: Vec<PeerId> = entry
                .candidates
                .iter()
                .copied()
                .filter(|p| *p != next)
                .collect();
            self.preamble.insert_iwant(OngoingReceive {
                message_id: entry.message_id,
                topic: entry.topic.clone(),
                message_length: entry.message_length,
                sender: next,
                starts_at: now,
                expires_at: now + receive_time(entry.message_length, bps),
                candidates: remaining,
            });
            self.send(
                &next,
                ControlMessage::IWant {
                    message_ids: vec![entry.message_id],
                },
            )
            .await;
        }

        let failed = self.preamble.drain_expired_iwants(now);
        for entry in failed {
            self.telemetry.retrieval_failures += 1;
            let _ = self
                .events
                .send(MeshEvent::RetrievalFailed {
                    topic: entry.topic,
                    message_id: entry.message_id,
                })
                .await;
        }
    }

    // ========================================================================
    // Message bookkeeping
    // ========================================================================

    fn on_message(
        &mut self,
        topic: String,
        message_id: MessageId,
        data: Vec<u8>,
        from: Option<PeerId>,
    ) {
        trace!(
            topic = %topic,
            message_id = %hex::encode(&message_id[..8]),
            from = ?from.map(|p| p.short()),
            "message recorded"
        );
        self.mcache.add(CachedMessage {
            topic,
            message_id,
            data,
        });
        #[cfg(feature = "preamble")]
        {
            self.preamble.remove(&message_id);
            if let Some(sender) = from {
                if let Some(state) = self.peers.get_mut(&sender) {
                    state.he_is_sendings.remove(&message_id);
                }
            }
        }
    }

    fn on_published(
        &mut self,
        topic: &str,
        message_id: MessageId,
        data: Vec<u8>,
        now: Instant,
    ) -> Vec<PeerId> {
        self.mcache.add(CachedMessage {
            topic: topic.to_string(),
            message_id,
            data,
        });

        if self.subscriptions.contains(topic) {
            return self
                .topics
                .get(topic)
                .map(|tp| tp.mesh_peers().copied().collect())
                .unwrap_or_default();
        }

        // publishing without a subscription goes through fanout
        if !self.topics.contains_key(topic) && self.topics.len() >= MAX_TRACKED_TOPICS {
            warn!(topic = %topic, "topic table full, publish has no forwarding set");
            return Vec::new();
        }
        self.topics
            .entry(topic.to_string())
            .or_default()
            .touch_fanout(now);
        self.replenish_fanout(topic);
        self.topics
            .get(topic)
            .map(|tp| tp.fanout_peers().copied().collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    async fn heartbeat(&mut self, now: Instant) {
        // fresh history generation and budget refill for every peer
        let config = &self.config;
        self.peers.for_each_mut(|_, state| {
            state.rotate_history(config.history_length);
            state.refill_budgets(config);
        });

        let topics: Vec<String> = self.subscriptions.iter().cloned().collect();
        for topic in &topics {
            self.backoff.age_expired(topic, now);

            // negative-score members leave the mesh before rebalancing
            let mut negatives: Vec<PeerId> = Vec::new();
            if let Some(tp) = self.topics.get(topic) {
                for peer in tp.mesh_peers() {
                    if self.peers.score(peer).unwrap_or(-1.0) < 0.0 {
                        negatives.push(*peer);
                    }
                }
            }
            for peer in negatives {
                if let Some(tp) = self.topics.get_mut(topic) {
                    tp.prune(&peer);
                }
                self.backoff
                    .set(topic, &peer, now + self.config.prune_backoff);
                self.telemetry.negative_score_prunes += 1;
                let msg = self.prune_message(topic, &peer, true);
                self.send(&peer, msg).await;
            }

            self.rebalance(topic, now).await;

            let (mesh_len, _) = self.mesh_counts(topic);
            if mesh_len < self.config.d_low {
                self.telemetry.low_peer_topics += 1;
            }
        }

        self.maintain_fanout(now);
        self.emit_gossip().await;
        self.mcache.shift();

        // droppable sync signal; a slow consumer must not stall the actor
        let _ = self.events.try_send(MeshEvent::Heartbeat);
    }

    /// Rebalance one topic's mesh towards `d`, honoring `d_out`, `d_score`
    /// and live backoffs.
    async fn rebalance(&mut self, topic: &str, now: Instant) {
        if !self.topics.contains_key(topic) {
            return;
        }
        let mut grafted: Vec<PeerId> = Vec::new();
        let mut pruned: Vec<PeerId> = Vec::new();

        // replenish towards D when under the low watermark
        let mesh_len = self
            .topics
            .get(topic)
            .map(|tp| tp.mesh_len())
            .unwrap_or(0);
        if mesh_len < self.config.d_low {
            let mut candidates = self.graft_candidates(topic, now, false, 0.0);
            candidates.shuffle(&mut rand::thread_rng());
            // stable sort: equal scores stay shuffled
            candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (peer, _) in candidates
                .into_iter()
                .take(self.config.d.saturating_sub(mesh_len))
            {
                self.graft_peer(topic, &peer, now);
                grafted.push(peer);
            }
        }

        // outbound quota, independent of the low watermark
        let (_, outbound_count) = self.mesh_counts(topic);
        if outbound_count < self.config.d_out {
            let mut candidates = self.graft_candidates(topic, now, true, 0.0);
            candidates.shuffle(&mut rand::thread_rng());
            candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (peer, _) in candidates
                .into_iter()
                .take(self.config.d_out - outbound_count)
            {
                self.graft_peer(topic, &peer, now);
                grafted.push(peer);
            }
        }

        // prune back to D once past the high watermark
        let (mesh_len, outbound_count) = self.mesh_counts(topic);
        if mesh_len > self.config.d_high {
            let mesh_members: Vec<PeerId> = self
                .topics
                .get(topic)
                .map(|tp| tp.mesh_peers().copied().collect())
                .unwrap_or_default();
            let mut candidates: Vec<(PeerId, f64, bool)> = mesh_members
                .iter()
                .filter(|p| !grafted.contains(p))
                .filter_map(|p| self.peers.get(p).map(|s| (*p, s.score, s.outbound)))
                .collect();

            if candidates.len() > self.config.d_score {
                candidates.shuffle(&mut rand::thread_rng());
                candidates
                    .sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                // the top d_score scorers are never pruned
                candidates.truncate(candidates.len() - self.config.d_score);

                let (inbound, mut outbound_c): (Vec<_>, Vec<_>) =
                    candidates.into_iter().partition(|(_, _, o)| !*o);
                // keep the outbound floor intact
                let max_outbound_prunes = outbound_count.saturating_sub(self.config.d_out);
                if outbound_c.len() > max_outbound_prunes {
                    outbound_c.shuffle(&mut rand::thread_rng());
                    outbound_c.truncate(max_outbound_prunes);
                }

                let mut prune_list: Vec<PeerId> = inbound
                    .into_iter()
                    .chain(outbound_c)
                    .map(|(p, _, _)| p)
                    .collect();
                let excess = mesh_len - self.config.d;
                if prune_list.len() > excess {
                    prune_list.shuffle(&mut rand::thread_rng());
                    prune_list.truncate(excess);
                }

                for peer in prune_list {
                    if let Some(tp) = self.topics.get_mut(topic) {
                        tp.prune(&peer);
                    }
                    self.backoff
                        .set(topic, &peer, now + self.config.prune_backoff);
                    self.telemetry.dhigh_prunes += 1;
                    pruned.push(peer);
                }
            }
        }

        // opportunistic grafting when the mesh median sinks
        let mut mesh_scores: Vec<f64> = self
            .topics
            .get(topic)
            .map(|tp| {
                tp.mesh_peers()
                    .filter_map(|p| self.peers.score(p))
                    .collect()
            })
            .unwrap_or_default();
        if mesh_scores.len() > 1 {
            mesh_scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            let median = mesh_scores[mesh_scores.len() / 2];
            if median < self.config.opportunistic_graft_threshold {
                let mut candidates = self.graft_candidates(topic, now, false, median);
                candidates.shuffle(&mut rand::thread_rng());
                for (peer, _) in candidates
                    .into_iter()
                    .take(self.config.max_opportunistic_graft_peers)
                {
                    self.graft_peer(topic, &peer, now);
                    self.telemetry.opportunistic_grafts += 1;
                    grafted.push(peer);
                }
            }
        }

        // tables settled; now tell the remotes
        for peer in &grafted {
            self.send(
                peer,
                ControlMessage::Graft {
                    topic: topic.to_string(),
                },
            )
            .await;
        }
        for peer in &pruned {
            let msg = self.prune_message(topic, peer, true);
            self.send(peer, msg).await;
        }
        if !grafted.is_empty() || !pruned.is_empty() {
            debug!(
                topic = %topic,
                grafted = grafted.len(),
                pruned = pruned.len(),
                "mesh rebalanced"
            );
        }
    }

    /// Connected, non-mesh, non-direct subscribers above `min_score` and not
    /// backing off, with their scores.
    fn graft_candidates(
        &mut self,
        topic: &str,
        now: Instant,
        outbound_only: bool,
        min_score: f64,
    ) -> Vec<(PeerId, f64)> {
        let subscribers: Vec<PeerId> = match self.topics.get(topic) {
            Some(tp) => tp
                .subscribers
                .iter()
                .copied()
                .filter(|p| !tp.in_mesh(p))
                .collect(),
            None => return Vec::new(),
        };

        let mut out = Vec::new();
        for peer in subscribers {
            if self.config.direct_peers.contains(&peer) {
                continue;
            }
            let (score, outbound) = match self.peers.get(&peer) {
                Some(state) => (state.score, state.outbound),
                None => continue,
            };
            if outbound_only && !outbound {
                continue;
            }
            if score < min_score {
                continue;
            }
            if self
                .backoff
                .is_backing_off(topic, &peer, now, Duration::ZERO)
            {
                continue;
            }
            out.push((peer, score));
        }
        out
    }

    fn graft_peer(&mut self, topic: &str, peer: &PeerId, now: Instant) {
        if let Some(tp) = self.topics.get_mut(topic) {
            tp.graft(*peer, now);
        }
    }

    fn mesh_counts(&self, topic: &str) -> (usize, usize) {
        match self.topics.get(topic) {
            Some(tp) => {
                let outbound = tp
                    .mesh_peers()
                    .filter(|p| self.peers.get(p).map(|s| s.outbound).unwrap_or(false))
                    .count();
                (tp.mesh_len(), outbound)
            }
            None => (0, 0),
        }
    }

    fn maintain_fanout(&mut self, now: Instant) {
        let fanout_topics: Vec<String> = self
            .topics
            .iter()
            .filter(|(topic, tp)| !self.subscriptions.contains(*topic) && tp.fanout_active())
            .map(|(topic, _)| topic.clone())
            .collect();

        for topic in fanout_topics {
            let expired = self
                .topics
                .get(&topic)
                .map(|tp| tp.fanout_expired(now, self.config.fanout_ttl))
                .unwrap_or(true);
            if expired {
                if let Some(tp) = self.topics.get_mut(&topic) {
                    tp.clear_fanout();
                }
                self.drop_idle_topic(&topic);
                debug!(topic = %topic, "fanout expired");
                continue;
            }

            // drop members that left the topic, disconnected or sank below
            // the publish threshold
            let mut stale: Vec<PeerId> = Vec::new();
            if let Some(tp) = self.topics.get(&topic) {
                for peer in tp.fanout_peers() {
                    let usable = tp.subscribers.contains(peer)
                        && self
                            .peers
                            .score(peer)
                            .map(|s| s >= self.config.publish_threshold)
                            .unwrap_or(false);
                    if !usable {
                        stale.push(*peer);
                    }
                }
            }
            if let Some(tp) = self.topics.get_mut(&topic) {
                for peer in &stale {
                    tp.fanout_remove(peer);
                }
            }

            self.replenish_fanout(&topic);
        }
    }

    fn replenish_fanout(&mut self, topic: &str) {
        let need = {
            let Some(tp) = self.topics.get(topic) else {
                return;
            };
            self.config.d.saturating_sub(tp.fanout_len())
        };
        if need == 0 {
            return;
        }

        let mut candidates: Vec<PeerId> = match self.topics.get(topic) {
            Some(tp) => tp
                .subscribers
                .iter()
                .copied()
                .filter(|p| !tp.in_fanout(p) && !tp.in_mesh(p))
                .filter(|p| !self.config.direct_peers.contains(p))
                .filter(|p| {
                    self.peers
                        .score(p)
                        .map(|s| s >= self.config.publish_threshold)
                        .unwrap_or(false)
                })
                .collect(),
            None => return,
        };
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(need);
        if let Some(tp) = self.topics.get_mut(topic) {
            for peer in candidates {
                tp.fanout_add(peer);
            }
        }
    }

    /// IHAVE gossip for every mesh and fanout topic.
    async fn emit_gossip(&mut self) {
        let mut gossip_topics: Vec<String> = self.subscriptions.iter().cloned().collect();
        for (topic, tp) in self.topics.iter() {
            if !self.subscriptions.contains(topic) && tp.fanout_len() > 0 {
                gossip_topics.push(topic.clone());
            }
        }

        for topic in gossip_topics {
            let mut ids = self.mcache.window(&topic);
            if ids.is_empty() {
                continue;
            }
            ids.shuffle(&mut rand::thread_rng());
            ids.truncate(self.config.max_ihave_length);

            let mut candidates: Vec<PeerId> = match self.topics.get(&topic) {
                Some(tp) => tp
                    .subscribers
                    .iter()
                    .copied()
                    .filter(|p| !tp.in_mesh(p) && !tp.in_fanout(p))
                    .filter(|p| !self.config.direct_peers.contains(p))
                    .filter(|p| {
                        self.peers
                            .score(p)
                            .map(|s| s >= self.config.gossip_threshold)
                            .unwrap_or(false)
                    })
                    .collect(),
                None => continue,
            };
            let target = std::cmp::max(
                self.config.d_lazy,
                (self.config.gossip_factor * candidates.len() as f64) as usize,
            );
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(target);

            for peer in candidates {
                // remembered so a matching IWANT validates later
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.record_sent_ihaves(&ids);
                }
                self.telemetry.gossip_ihaves_sent += 1;
                self.send(
                    &peer,
                    ControlMessage::IHave {
                        topic: topic.clone(),
                        message_ids: ids.clone(),
                    },
                )
                .await;
            }
        }
    }

    // ========================================================================
    // Outbound helpers
    // ========================================================================

    fn prune_message(&self, topic: &str, exclude: &PeerId, with_px: bool) -> ControlMessage {
        let peers = if with_px {
            self.peer_exchange_list(topic, exclude)
        } else {
            Vec::new()
        };
        ControlMessage::Prune {
            topic: topic.to_string(),
            peers,
            backoff_secs: self.config.prune_backoff.as_secs(),
        }
    }

    /// Non-negative-score subscribers of the topic, capped at `2 * d_high`,
    /// each with its signed record when the book has one.
    fn peer_exchange_list(&self, topic: &str, exclude: &PeerId) -> Vec<PeerInfo> {
        if !self.config.enable_px {
            return Vec::new();
        }
        let Some(tp) = self.topics.get(topic) else {
            return Vec::new();
        };
        let cap = 2 * self.config.d_high;
        let mut out = Vec::new();
        for peer in tp.subscribers.iter() {
            if out.len() >= cap {
                break;
            }
            if peer == exclude {
                continue;
            }
            match self.peers.score(peer) {
                Some(score) if score >= 0.0 => {}
                _ => continue,
            }
            let signed_record = self
                .records
                .lookup(peer)
                .map(|record| record.encode())
                .unwrap_or_default();
            out.push(PeerInfo {
                peer_id: *peer,
                signed_record,
            });
        }
        out
    }

    async fn send(&self, to: &PeerId, msg: ControlMessage) {
        let high_priority = msg.is_high_priority();
        if let Err(e) = self.network.send_control(to, msg, high_priority).await {
            // membership is never rolled back on send failure
            trace!(peer = %to, error = %e, "control send failed");
        }
    }
}
