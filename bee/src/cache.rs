//! # Record Caches
//!
//! Two of these sit behind every tree: one maps a record seq to its key bytes
//! (the hot path of every binary search), the other maps a seq to the decoded
//! record so pointer tables are inflated at most once.
//!
//! ## Design Decisions
//!
//! - **Least-recently-inserted eviction.** Records never change once
//!   appended, so recency of *use* buys little over recency of *insertion*
//!   and the bookkeeping stays a plain queue.
//! - **Truncation-aware.** The log can shrink when it forks. `gc` prunes the
//!   entries past the new length, or drops everything when the rewind is
//!   large enough that pruning would cost more than refilling.
//! - **Interior locking.** Views of the same tree share the caches through an
//!   `Arc`, so the state lives behind a `parking_lot::Mutex` and the public
//!   API takes `&self`. Hit and miss counters are lock-free atomics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::CACHE_GC_THRESHOLD;

struct Inner<V> {
    entries: HashMap<u64, V>,
    /// Insertion order, oldest first.
    order: VecDeque<u64>,
    /// One past the highest seq ever stored since the last `gc`.
    length: u64,
}

/// Capped `seq -> V` map with truncation-aware garbage collection.
pub struct SeqCache<V> {
    capacity: usize,
    inner: Mutex<Inner<V>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<V: Clone> SeqCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                length: 0,
            }),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, seq: u64) -> Option<V> {
        let found = self.inner.lock().entries.get(&seq).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn set(&self, seq: u64, value: V) {
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.entries.get_mut(&seq) {
            *slot = value;
        } else {
            while inner.entries.len() >= self.capacity {
                match inner.order.pop_front() {
                    Some(oldest) => {
                        inner.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            inner.entries.insert(seq, value);
            inner.order.push_back(seq);
        }

        if seq >= inner.length {
            inner.length = seq + 1;
        }
    }

    /// Forget everything at or past `length`.
    pub fn gc(&self, length: u64) {
        let mut inner = self.inner.lock();

        if inner.length.saturating_sub(length) > CACHE_GC_THRESHOLD {
            debug!(from = inner.length, to = length, "cache rewind too large, clearing");
            inner.entries.clear();
            inner.order.clear();
        } else if inner.length > length {
            for seq in length..inner.length {
                inner.entries.remove(&seq);
            }
            inner.order.retain(|&seq| seq < length);
        }

        inner.length = length;
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.length = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_insertion_first() {
        let cache = SeqCache::new(3);
        cache.set(1, "a");
        cache.set(2, "b");
        cache.set(3, "c");

        // Touching an entry does not protect it.
        assert_eq!(cache.get(1), Some("a"));
        cache.set(4, "d");

        assert_eq!(cache.get(1), None);
        assert_eq!(cache.get(2), Some("b"));
        assert_eq!(cache.get(4), Some("d"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn overwriting_keeps_position() {
        let cache = SeqCache::new(2);
        cache.set(1, 10);
        cache.set(2, 20);
        cache.set(1, 11);
        cache.set(3, 30);

        assert_eq!(cache.get(1), None);
        assert_eq!(cache.get(2), Some(20));
    }

    #[test]
    fn small_rewind_prunes_the_tail() {
        let cache = SeqCache::new(1024);
        for seq in 0..100 {
            cache.set(seq, seq);
        }

        cache.gc(60);

        assert_eq!(cache.get(59), Some(59));
        assert_eq!(cache.get(60), None);
        assert_eq!(cache.get(99), None);
        assert_eq!(cache.len(), 60);
    }

    #[test]
    fn large_rewind_clears_everything() {
        let cache = SeqCache::new(1024);
        for seq in 0..300 {
            cache.set(seq, seq);
        }

        cache.gc(100);

        assert!(cache.is_empty());
        assert_eq!(cache.get(5), None);
    }

    #[test]
    fn rewind_at_threshold_still_prunes() {
        let cache = SeqCache::new(1024);
        for seq in 0..(CACHE_GC_THRESHOLD + 10) {
            cache.set(seq, seq);
        }

        cache.gc(10);

        assert_eq!(cache.get(9), Some(9));
        assert_eq!(cache.len(), 10);
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = SeqCache::new(8);
        cache.set(1, ());
        let _ = cache.get(1);
        let _ = cache.get(1);
        let _ = cache.get(2);
        assert_eq!(cache.stats(), (2, 1));
    }
}
