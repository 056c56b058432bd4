//! Score-weighted fragment cache.
//!
//! Maps 64-bit fragment fingerprints to a has-secret verdict so repeated
//! fragments (the repeated-base-image effect in layer corpora) skip the
//! detector entirely. The cache is fixed-capacity; when full, the entry with
//! the lowest usage score is evicted. Hits that confirm a secret raise the
//! score more than plain hits, keeping secret-bearing fragments resident.
//!
//! The ordering structure is a binary min-heap over scores with a position
//! index per fingerprint, giving O(log n) update-in-place when a held
//! entry's score changes.
//!
//! Each scanner owns one cache; no cross-thread sharing.

use crate::constants::{CACHE_BYTE_BUDGET, CACHE_ENTRY_COST};
use std::collections::HashMap;

#[derive(Debug)]
struct Slot {
    hash: u64,
    has_secret: bool,
    score: u32,
}

/// Fixed-capacity associative cache from fragment fingerprint to verdict.
#[derive(Debug)]
pub struct FragmentCache {
    capacity: usize,
    /// Min-heap by score. `index` tracks each fingerprint's heap position.
    heap: Vec<Slot>,
    index: HashMap<u64, usize>,
}

impl FragmentCache {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            heap: Vec::new(),
            index: HashMap::with_capacity(capacity / 2),
        }
    }

    /// Creates a cache sized from a byte budget and the per-entry cost
    /// estimate. The default budget admits roughly nine million entries.
    pub fn with_byte_budget(budget: u64) -> Self {
        Self::new((budget / CACHE_ENTRY_COST) as usize)
    }

    /// Creates a cache with the default byte budget.
    pub fn with_default_budget() -> Self {
        Self::with_byte_budget(CACHE_BYTE_BUDGET)
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Looks up a fingerprint. A hit bumps the score: +1, or +5 when the
    /// entry is secret-positive. Returns the verdict, or `None` on miss.
    pub fn get(&mut self, hash: u64) -> Option<bool> {
        let i = *self.index.get(&hash)?;
        let has_secret = self.heap[i].has_secret;
        self.heap[i].score += if has_secret { 5 } else { 1 };
        self.sift_down(i);
        Some(has_secret)
    }

    /// Records a verdict. For a resident entry, a negative-to-positive flag
    /// transition adds 5, any other update adds 1. A new entry evicts the
    /// lowest-scored resident first when at capacity and starts at score 1
    /// (6 when secret-positive).
    pub fn set(&mut self, hash: u64, has_secret: bool) {
        if let Some(&i) = self.index.get(&hash) {
            if has_secret && !self.heap[i].has_secret {
                self.heap[i].has_secret = true;
                self.heap[i].score += 5;
            } else {
                self.heap[i].score += 1;
            }
            self.sift_down(i);
            return;
        }

        if self.heap.len() >= self.capacity {
            self.evict_min();
        }

        let slot = Slot {
            hash,
            has_secret,
            score: if has_secret { 6 } else { 1 },
        };
        self.heap.push(slot);
        let i = self.heap.len() - 1;
        self.index.insert(hash, i);
        self.sift_up(i);
    }

    fn evict_min(&mut self) {
        let evicted = self.heap.swap_remove(0);
        self.index.remove(&evicted.hash);
        if !self.heap.is_empty() {
            self.index.insert(self.heap[0].hash, 0);
            self.sift_down(0);
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].hash, a);
        self.index.insert(self.heap[b].hash, b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].score < self.heap[parent].score {
                self.swap_slots(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < self.heap.len() && self.heap[left].score < self.heap[smallest].score {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].score < self.heap[smallest].score {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap_slots(i, smallest);
            i = smallest;
        }
    }

    #[cfg(test)]
    fn check_heap_invariant(&self) {
        for i in 1..self.heap.len() {
            let parent = (i - 1) / 2;
            assert!(
                self.heap[parent].score <= self.heap[i].score,
                "heap order violated at {}",
                i
            );
        }
        assert_eq!(self.heap.len(), self.index.len());
        for (hash, &pos) in &self.index {
            assert_eq!(self.heap[pos].hash, *hash, "stale index for {:x}", hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_tracks_positions_through_sifts() {
        let mut cache = FragmentCache::new(8);
        for h in 0..8u64 {
            cache.set(h, h % 2 == 0);
            cache.check_heap_invariant();
        }
        for h in 0..8u64 {
            cache.get(h);
            cache.check_heap_invariant();
        }
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn test_eviction_keeps_invariant() {
        let mut cache = FragmentCache::new(4);
        for h in 0..32u64 {
            cache.set(h, false);
            cache.check_heap_invariant();
            assert!(cache.len() <= 4);
        }
    }

    #[test]
    fn test_zero_capacity_clamps_to_one() {
        let mut cache = FragmentCache::new(0);
        cache.set(1, true);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
    }
}
