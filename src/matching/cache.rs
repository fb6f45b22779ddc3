//! Bounded LRU cache of last-known template locations.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::frame::GrayBuffer;

/// Every Nth byte of the template participates in its content hash.
pub const HASH_SAMPLE_STRIDE: usize = 8;
pub const DEFAULT_CACHE_CAPACITY: usize = 32;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Cheap content hash of a (pre-processed) template buffer.
///
/// Samples every `HASH_SAMPLE_STRIDE`th byte into a rolling polynomial hash, seeded with the
/// dimensions. Collisions are tolerable: a cached location is always re-scored before use.
pub fn content_hash(buffer: &GrayBuffer) -> u64 {
    let seed = ((buffer.width() as u64) << 32) ^ buffer.height() as u64;
    buffer
        .data()
        .iter()
        .step_by(HASH_SAMPLE_STRIDE)
        .fold(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15), |h, &b| {
            h.wrapping_mul(31).wrapping_add(u64::from(b))
        })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub x: i64,
    pub y: i64,
    pub timestamp: Instant,
}

/// Template location cache owned by a single matcher.
#[derive(Debug)]
pub struct LocationCache {
    entries: HashMap<u64, CacheEntry>,
    /// Keys from least to most recently used.
    order: VecDeque<u64>,
    capacity: usize,
    ttl: Duration,
}

impl Default for LocationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

impl LocationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Fetch a live entry, marking it most recently used. Expired entries are dropped.
    pub fn get(&mut self, key: u64) -> Option<CacheEntry> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&mut self, key: u64, now: Instant) -> Option<CacheEntry> {
        let entry = *self.entries.get(&key)?;
        if now.saturating_duration_since(entry.timestamp) > self.ttl {
            self.remove(key);
            return None;
        }
        self.touch(key);
        Some(entry)
    }

    /// Record a location, evicting the least recently used entry past capacity.
    pub fn insert(&mut self, key: u64, x: i64, y: i64) {
        self.insert_at(key, x, y, Instant::now());
    }

    pub(crate) fn insert_at(&mut self, key: u64, x: i64, y: i64, now: Instant) {
        self.entries.insert(
            key,
            CacheEntry {
                x,
                y,
                timestamp: now,
            },
        );
        self.touch(key);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    pub fn remove(&mut self, key: u64) -> Option<CacheEntry> {
        self.order.retain(|k| *k != key);
        self.entries.remove(&key)
    }

    fn touch(&mut self, key: u64) {
        self.order.retain(|k| *k != key);
        self.order.push_back(key);
    }
}
