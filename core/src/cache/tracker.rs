//! Generation-based ageing of proxy-less cache entries.

use std::collections::HashMap;

use crate::types::EntryId;

/// Buckets entries into a ring of generations. Each elapsed period expires the oldest
/// generation, so an entry that is never marked used survives between `generations - 1` and
/// `generations` periods.
#[derive(Debug)]
pub struct ExpirationTracker {
    generations: Vec<Vec<EntryId>>,
    /// Generation slot of every tracked entry.
    index: HashMap<EntryId, usize>,
    newest: usize,
    period_secs: u64,
    last_aged: u64,
}

impl ExpirationTracker {
    pub fn new(generations: usize, period_secs: u64, now: u64) -> Self {
        let generations = generations.max(1);
        Self {
            generations: vec![Vec::new(); generations],
            index: HashMap::new(),
            newest: 0,
            period_secs: period_secs.max(1),
            last_aged: now,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.index.contains_key(&id)
    }

    /// Start tracking `id` in the newest generation. Already tracked entries are left alone.
    pub fn add(&mut self, id: EntryId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        self.generations[self.newest].push(id);
        self.index.insert(id, self.newest);
        true
    }

    pub fn remove(&mut self, id: EntryId) -> bool {
        let Some(slot) = self.index.remove(&id) else {
            return false;
        };
        let generation = &mut self.generations[slot];
        if let Some(position) = generation.iter().position(|entry| *entry == id) {
            generation.swap_remove(position);
        }
        true
    }

    /// Move a tracked entry back to the newest generation.
    pub fn mark_used(&mut self, id: EntryId) -> bool {
        if self.remove(id) {
            self.add(id)
        } else {
            false
        }
    }

    /// Expire the oldest generation and open a fresh one. Returns the expired entries, which are
    /// no longer tracked.
    pub fn age_one_generation(&mut self) -> Vec<EntryId> {
        let oldest = (self.newest + 1) % self.generations.len();
        let expired = std::mem::take(&mut self.generations[oldest]);
        for id in &expired {
            self.index.remove(id);
        }
        self.newest = oldest;
        expired
    }

    /// Age once per whole period elapsed since the last ageing.
    pub fn advance(&mut self, now: u64) -> Vec<EntryId> {
        let elapsed = now.saturating_sub(self.last_aged) / self.period_secs;
        if elapsed == 0 {
            return Vec::new();
        }
        self.last_aged += elapsed * self.period_secs;
        let steps = elapsed.min(self.generations.len() as u64);
        let mut expired = Vec::new();
        for _ in 0..steps {
            expired.extend(self.age_one_generation());
        }
        expired
    }

    pub fn clear(&mut self) {
        for generation in &mut self.generations {
            generation.clear();
        }
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: u64) -> EntryId {
        EntryId::new(value)
    }

    #[test]
    fn untouched_entries_expire_after_all_generations() {
        let mut tracker = ExpirationTracker::new(3, 10, 0);
        tracker.add(id(1));

        assert!(tracker.advance(9).is_empty());
        assert!(tracker.advance(10).is_empty());
        assert!(tracker.advance(20).is_empty());
        assert_eq!(tracker.advance(30), vec![id(1)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn mark_used_restarts_ageing() {
        let mut tracker = ExpirationTracker::new(3, 10, 0);
        tracker.add(id(1));
        tracker.add(id(2));
        tracker.advance(20);
        assert!(tracker.mark_used(id(1)));

        assert_eq!(tracker.advance(30), vec![id(2)]);
        assert!(tracker.contains(id(1)));
        assert_eq!(tracker.advance(50), vec![id(1)]);
    }

    #[test]
    fn long_idle_gap_expires_everything_once() {
        let mut tracker = ExpirationTracker::new(3, 10, 0);
        tracker.add(id(1));
        tracker.add(id(2));
        let mut expired = tracker.advance(10_000);
        expired.sort();
        assert_eq!(expired, vec![id(1), id(2)]);
        assert!(tracker.advance(10_005).is_empty());
    }

    #[test]
    fn removed_entries_never_expire() {
        let mut tracker = ExpirationTracker::new(2, 5, 0);
        tracker.add(id(7));
        assert!(tracker.remove(id(7)));
        assert!(!tracker.remove(id(7)));
        assert!(tracker.advance(100).is_empty());
    }
}
