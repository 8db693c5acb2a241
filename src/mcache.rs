//! # Generational Message Cache
//!
//! Sliding window of recently seen messages, grouped into heartbeat
//! generations. The newest generation receives all additions; `shift()`
//! rotates the window once per heartbeat, dropping the oldest generation.
//!
//! IHAVE gossip advertises only the first `history_gossip` generations, so
//! an id stays advertisable for a few heartbeats but remains fetchable by
//! IWANT for the full `history_length` window.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::messages::MessageId;

/// Opaque cached message envelope, as handed over by the PubSub base.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedMessage {
    pub topic: String,
    pub message_id: MessageId,
    pub data: Vec<u8>,
}

struct CacheEntry {
    message_id: MessageId,
    topic: String,
}

/// Generational window of `message-id -> message` entries.
pub struct MessageCache {
    /// Front is the current generation.
    history: VecDeque<Vec<CacheEntry>>,
    messages: HashMap<MessageId, CachedMessage>,
    history_gossip: usize,
}

impl MessageCache {
    pub fn new(history_gossip: usize, history_length: usize) -> Self {
        let mut history = VecDeque::with_capacity(history_length);
        for _ in 0..history_length {
            history.push_back(Vec::new());
        }
        Self {
            history,
            messages: HashMap::new(),
            history_gossip,
        }
    }

    /// Record a message into the newest generation. A duplicate id is
    /// ignored; the first sighting wins.
    pub fn add(&mut self, message: CachedMessage) {
        if self.messages.contains_key(&message.message_id) {
            return;
        }
        if let Some(current) = self.history.front_mut() {
            current.push(CacheEntry {
                message_id: message.message_id,
                topic: message.topic.clone(),
            });
        }
        self.messages.insert(message.message_id, message);
    }

    /// Look up a message in any live generation.
    pub fn get(&self, id: &MessageId) -> Option<&CachedMessage> {
        self.messages.get(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    /// Ids of `topic` observable in the gossip window.
    pub fn window(&self, topic: &str) -> Vec<MessageId> {
        self.history
            .iter()
            .take(self.history_gossip)
            .flatten()
            .filter(|entry| entry.topic == topic)
            .map(|entry| entry.message_id)
            .collect()
    }

    /// Rotate the window: drop the oldest generation, open a fresh one.
    pub fn shift(&mut self) {
        if let Some(expired) = self.history.pop_back() {
            for entry in &expired {
                self.messages.remove(&entry.message_id);
            }
            if !expired.is_empty() {
                trace!(expired = expired.len(), "message cache generation dropped");
            }
        }
        self.history.push_front(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
