//! # Meshsub - GossipSub Mesh Management
//!
//! Meshsub is the mesh-management core of a GossipSub node: it decides which
//! peers form the message-forwarding mesh of each topic, keeps those meshes
//! healthy under churn and adversarial behavior, and drives the lazy IHAVE
//! gossip that lets peers outside the mesh pull what they missed.
//!
//! ## Architecture
//!
//! The crate uses the **Actor Pattern** for safe concurrent state:
//! - [`MeshManager`] is a public handle, cheap to clone, that communicates
//!   with the actor over async channels
//! - The private actor owns all mutable state and processes commands
//!   sequentially, interleaved with the periodic heartbeat
//!
//! Everything outside mesh management is a collaborator behind a narrow
//! trait: the transport ([`MeshRpc`]), the PubSub base's duplicate index
//! ([`SeenIndex`]) and the signed-record book ([`RecordBook`]). Peer scores
//! are computed externally and fed in as scalars.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `mesh` | The actor: control handlers, rebalancing, heartbeat |
//! | `config` | Tunable parameters and protocol constants |
//! | `peer` | Peer ids, negotiated variants, budgets, history rings |
//! | `topics` | Per-topic subscriber/mesh/fanout sets |
//! | `backoff` | Per-(topic, peer) GRAFT backoff table |
//! | `mcache` | Generational message cache behind IHAVE/IWANT |
//! | `messages` | Control message types and bounded serialization |
//! | `records` | Signed peer records for peer exchange |
//! | `protocols` | Traits for the surrounding node |
//! | `preamble` | v1.4 large-message announcements (feature `preamble`) |
//!
//! ## Security Model
//!
//! - Per-peer budgets cap what a peer may ask of us between heartbeats
//! - IWANT requests validate against what we actually announced, once only
//! - Backoffs are honored with slack and never shorten
//! - All attacker-growable tables are bounded
//! - Peer-exchange records are signature-checked against the named peer

pub mod backoff;
pub mod config;
pub mod mcache;
pub mod mesh;
pub mod messages;
pub mod peer;
pub mod protocols;
pub mod records;
pub mod topics;

#[cfg(feature = "preamble")]
pub mod preamble;

pub use config::{ConfigError, MeshConfig};
pub use mcache::CachedMessage;
pub use mesh::{MeshEvent, MeshManager, TelemetrySnapshot};
pub use messages::{ControlMessage, MessageId, PeerInfo, SaltedId};
pub use peer::{Codec, PeerId};
pub use protocols::{EmptyRecordBook, MeshRpc, NodeSalt, RecordBook, SeenIndex};
pub use records::{RecordError, SignedPeerRecord};
