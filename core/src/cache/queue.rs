//! Eviction order for cache entries that no consumer currently holds.
//!
//! The queue is a binary max-heap over a plain `Vec` so that arbitrary entries can be removed
//! when they regain a proxy. Removing anything but the root leaves the heap "dirty"; ordering is
//! restored lazily by the next [`EvictionQueue::pop`] instead of after every removal.

use std::cmp::Ordering;
use std::fmt::Debug;

use crate::types::EntryId;

/// Decides which proxy-less entry is evicted first. Larger weights leave the cache sooner.
pub trait EvictionPolicy: Debug {
    fn weight(&self, data_size: u64, touched_time: u64) -> f64;
}

/// Blend of size and age: `size * (1 - w) - touched * w`. Older and larger entries go first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgeSizePolicy {
    time_weight: f64,
}

impl AgeSizePolicy {
    pub fn new(time_weight: f64) -> Self {
        Self { time_weight: time_weight.clamp(0.0, 1.0) }
    }
}

impl Default for AgeSizePolicy {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl EvictionPolicy for AgeSizePolicy {
    fn weight(&self, data_size: u64, touched_time: u64) -> f64 {
        let w = self.time_weight;
        data_size as f64 * (1.0 - w) - touched_time as f64 * w
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedEntry {
    id: EntryId,
    size: u64,
    weight: f64,
}

impl QueuedEntry {
    /// Heap order: heavier first, then the older id.
    fn outranks(&self, other: &QueuedEntry) -> bool {
        match self.weight.partial_cmp(&other.weight) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Less) => false,
            _ => self.id < other.id,
        }
    }
}

#[derive(Debug)]
pub struct EvictionQueue {
    heap: Vec<QueuedEntry>,
    policy: Box<dyn EvictionPolicy>,
    total_size: u64,
    dirty: bool,
}

impl Default for EvictionQueue {
    fn default() -> Self {
        Self::new(Box::new(AgeSizePolicy::default()))
    }
}

impl EvictionQueue {
    pub fn new(policy: Box<dyn EvictionPolicy>) -> Self {
        Self { heap: Vec::new(), policy, total_size: 0, dirty: false }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Sum of the data sizes of every queued entry.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.position(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.heap.iter().map(|entry| entry.id)
    }

    pub fn push(&mut self, id: EntryId, data_size: u64, touched_time: u64) {
        debug_assert!(!self.contains(id), "{id} queued twice");
        let weight = self.policy.weight(data_size, touched_time);
        self.total_size += data_size;
        self.heap.push(QueuedEntry { id, size: data_size, weight });
        if !self.dirty {
            let last = self.heap.len() - 1;
            self.sift_up(last);
        }
    }

    /// Remove and return the entry that should be evicted next.
    pub fn pop(&mut self) -> Option<(EntryId, u64)> {
        if self.heap.is_empty() {
            return None;
        }
        if self.dirty {
            self.refresh();
        }
        let top = self.pop_root();
        Some((top.id, top.size))
    }

    pub fn peek(&mut self) -> Option<EntryId> {
        if self.dirty {
            self.refresh();
        }
        self.heap.first().map(|entry| entry.id)
    }

    /// Remove an arbitrary entry. Returns its queued size.
    pub fn remove(&mut self, id: EntryId) -> Option<u64> {
        let index = self.position(id)?;
        if index == 0 && !self.dirty {
            return Some(self.pop_root().size);
        }
        let removed = self.heap.remove(index);
        self.total_size -= removed.size;
        if self.heap.len() > 1 {
            self.dirty = true;
        }
        Some(removed.size)
    }

    /// Record a new size or touch time for a queued entry.
    pub fn update(&mut self, id: EntryId, data_size: u64, touched_time: u64) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        let weight = self.policy.weight(data_size, touched_time);
        let entry = &mut self.heap[index];
        self.total_size = self.total_size - entry.size + data_size;
        entry.size = data_size;
        entry.weight = weight;
        self.dirty = true;
        true
    }

    /// Restore heap order after in-place edits.
    pub fn refresh(&mut self) {
        for index in (0..self.heap.len() / 2).rev() {
            self.sift_down(index);
        }
        self.dirty = false;
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.total_size = 0;
        self.dirty = false;
    }

    fn position(&self, id: EntryId) -> Option<usize> {
        self.heap.iter().position(|entry| entry.id == id)
    }

    fn pop_root(&mut self) -> QueuedEntry {
        let top = self.heap.swap_remove(0);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        self.total_size -= top.size;
        top
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.heap[index].outranks(&self.heap[parent]) {
                break;
            }
            self.heap.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut best = index;
            if left < len && self.heap[left].outranks(&self.heap[best]) {
                best = left;
            }
            if right < len && self.heap[right].outranks(&self.heap[best]) {
                best = right;
            }
            if best == index {
                break;
            }
            self.heap.swap(index, best);
            index = best;
        }
    }
}
