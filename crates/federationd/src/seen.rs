//! Bounded set of recently seen gossip envelopes
//!
//! Entries leave the set when the capacity is exceeded (oldest first) or
//! when they outlive the retention window. The envelopes are kept so that
//! anti-entropy can serve them to peers that missed them.

use federation_core::{GossipMessage, MessageHash};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Recently seen envelopes, in arrival order
pub struct SeenSet {
    capacity: usize,
    retention: Duration,
    entries: HashMap<MessageHash, GossipMessage>,
    order: VecDeque<(MessageHash, Instant)>,
}

impl SeenSet {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record an envelope. Returns false if its hash was already present.
    pub fn insert(&mut self, message: GossipMessage) -> bool {
        self.insert_at(message, Instant::now())
    }

    pub fn insert_at(&mut self, message: GossipMessage, now: Instant) -> bool {
        let hash = message.message_hash;
        if self.entries.contains_key(&hash) {
            return false;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some((oldest, _)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.entries.insert(hash, message);
        self.order.push_back((hash, now));
        true
    }

    pub fn contains(&self, hash: &MessageHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &MessageHash) -> Option<&GossipMessage> {
        self.entries.get(hash)
    }

    /// Up to `max` hashes, newest first
    pub fn recent(&self, max: usize) -> Vec<MessageHash> {
        self.order.iter().rev().take(max).map(|(hash, _)| *hash).collect()
    }

    /// Drop entries older than the retention window. Returns how many left.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some((hash, inserted)) = self.order.front() {
            if now.saturating_duration_since(*inserted) < self.retention {
                break;
            }
            self.entries.remove(hash);
            self.order.pop_front();
            expired += 1;
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
