//! Canonical block record and the recent-block dedup ring.
//!
//! Every source dialect is normalized into a [`Block`] before the rest
//! of the pipeline sees it. The ring remembers the last [`RING_CAP`]
//! `(height, hash)` pairs so a block observed from two sources (or on
//! two consecutive ticks) is processed exactly once.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

/// Fixed dedup window. The ring is recreated empty on boot and
/// whenever the classifier rule changes.
pub const RING_CAP: usize = 50;

/// A normalized block observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Decimal height, kept as a string to survive precision and
    /// format differences between source dialects.
    pub height: String,
    /// Hex hash, lowercased.
    pub hash: String,
    /// Whole-second UTC time reported by the source.
    pub time: DateTime<Utc>,
    /// Id of the adapter that produced this observation.
    pub source_id: String,
}

impl Block {
    /// Height as an integer, `None` when unparseable or zero.
    pub fn height_u64(&self) -> Option<u64> {
        self.height.parse::<u64>().ok().filter(|h| *h > 0)
    }

    /// A block is usable iff its height is a positive integer and the
    /// hash is non-empty after normalization.
    pub fn is_valid(&self) -> bool {
        self.height_u64().is_some() && !self.hash.trim().is_empty()
    }
}

/// Fixed-capacity, newest-first set of recently observed blocks.
pub struct DedupRing {
    cap: usize,
    /// Newest at the front.
    buf: VecDeque<Block>,
    seen: HashSet<(String, String)>,
}

impl DedupRing {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            buf: VecDeque::with_capacity(cap),
            seen: HashSet::with_capacity(cap),
        }
    }

    /// Insert the block if its `(height, hash)` pair has not been seen
    /// within the window. Returns true when the block is new. On
    /// overflow the oldest entry is evicted together with its key.
    pub fn add_if_new(&mut self, block: &Block) -> bool {
        let key = (block.height.clone(), block.hash.clone());
        if self.seen.contains(&key) {
            return false;
        }

        self.buf.push_front(block.clone());
        self.seen.insert(key);

        while self.buf.len() > self.cap {
            if let Some(oldest) = self.buf.pop_back() {
                self.seen.remove(&(oldest.height, oldest.hash));
            }
        }
        true
    }

    /// Newest-first snapshot for status consumers.
    pub fn list(&self) -> Vec<Block> {
        self.buf.iter().cloned().collect()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for DedupRing {
    fn default() -> Self {
        Self::new(RING_CAP)
    }
}
