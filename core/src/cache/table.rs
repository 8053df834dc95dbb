//! Key to entry table with its eviction queue and expiration tracker.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::config::RequestCacheConfig;
use crate::error::CacheInsertError;
use crate::types::{EntryId, RequestId};

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::queue::{AgeSizePolicy, EvictionPolicy, EvictionQueue};
use super::tracker::ExpirationTracker;

/// One request cache (chrome or content).
///
/// Entries whose request has at least one proxy are "pinned": they stay in the table but are
/// absent from both the eviction queue and the expiration tracker.
#[derive(Debug)]
pub struct RequestCache {
    entries: HashMap<CacheKey, CacheEntry>,
    keys: HashMap<EntryId, CacheKey>,
    queue: EvictionQueue,
    tracker: ExpirationTracker,
    max_bytes: u64,
}

impl RequestCache {
    pub fn new(config: &RequestCacheConfig, now: u64) -> Self {
        Self::with_policy(config, Box::new(AgeSizePolicy::new(config.time_weight)), now)
    }

    pub fn with_policy(
        config: &RequestCacheConfig,
        policy: Box<dyn EvictionPolicy>,
        now: u64,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            keys: HashMap::new(),
            queue: EvictionQueue::new(policy),
            tracker: ExpirationTracker::new(config.generations, config.generation_secs, now),
            max_bytes: config.max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes held by proxy-less entries.
    pub fn queued_bytes(&self) -> u64 {
        self.queue.total_size()
    }

    pub fn queue(&self) -> &EvictionQueue {
        &self.queue
    }

    pub fn tracker(&self) -> &ExpirationTracker {
        &self.tracker
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &CacheKey) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }

    pub fn key_of(&self, id: EntryId) -> Option<&CacheKey> {
        self.keys.get(&id)
    }

    /// Make `entry` the live entry for `key`, replacing (and returning) any previous one.
    ///
    /// A proxy-less entry is queued and tracked immediately; the caller runs
    /// [`Self::check_cache_limits`] afterwards.
    pub fn put(
        &mut self,
        key: CacheKey,
        mut entry: CacheEntry,
    ) -> Result<Option<CacheEntry>, CacheInsertError> {
        if entry.data_size > self.max_bytes {
            debug!(
                target: "imgcache::cache",
                uri = %key.uri(),
                size = entry.data_size,
                "entry exceeds request cache budget"
            );
            return Err(CacheInsertError::TooLarge { size: entry.data_size, max: self.max_bytes });
        }

        let replaced = self.remove(&key);
        if replaced.is_some() {
            trace!(target: "imgcache::cache", uri = %key.uri(), "replacing cached entry");
        }

        entry.evicted = false;
        if entry.has_no_proxies {
            self.queue.push(entry.id(), entry.data_size, entry.touched_time);
            self.tracker.add(entry.id());
        }
        self.keys.insert(entry.id(), key.clone());
        self.entries.insert(key, entry);
        Ok(replaced)
    }

    /// Drop the entry for `key` from the table, the queue and the tracker.
    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let mut entry = self.entries.remove(key)?;
        self.keys.remove(&entry.id());
        self.queue.remove(entry.id());
        self.tracker.remove(entry.id());
        entry.evicted = true;
        Some(entry)
    }

    /// Remove the entry for `key` only if it still belongs to `request`.
    pub fn remove_if_owned(&mut self, key: &CacheKey, request: RequestId) -> Option<CacheEntry> {
        match self.entries.get(key) {
            Some(entry) if entry.request() == request => self.remove(key),
            _ => None,
        }
    }

    /// Pin the entry: its request gained its first proxy.
    pub fn set_has_proxies(&mut self, key: &CacheKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.has_no_proxies {
            self.queue.remove(entry.id());
            self.tracker.remove(entry.id());
            entry.has_no_proxies = false;
        }
        true
    }

    /// Unpin the entry: its request lost its last proxy. The caller checks limits afterwards.
    pub fn set_has_no_proxies(&mut self, key: &CacheKey, now: u64) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if !entry.has_no_proxies {
            entry.has_no_proxies = true;
            entry.touched_time = now;
            self.queue.push(entry.id(), entry.data_size, entry.touched_time);
            self.tracker.add(entry.id());
        }
        true
    }

    /// Evict proxy-less entries until the queued bytes fit the budget.
    pub fn check_cache_limits(&mut self) -> Vec<(CacheKey, CacheEntry)> {
        let mut evicted = Vec::new();
        while self.queue.total_size() > self.max_bytes {
            let Some((id, _)) = self.queue.pop() else {
                break;
            };
            let Some(key) = self.keys.get(&id).cloned() else {
                warn!(target: "imgcache::cache", entry = %id, "queued entry missing from table");
                continue;
            };
            if let Some(entry) = self.remove(&key) {
                debug!(target: "imgcache::cache", uri = %key.uri(), "evicting for size");
                evicted.push((key, entry));
            }
        }
        evicted
    }

    /// Refresh the touch time of an entry and move it back to the newest generation.
    pub fn touch(&mut self, key: &CacheKey, now: u64) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.touched_time = now;
        if entry.has_no_proxies {
            self.queue.update(entry.id(), entry.data_size, now);
            self.tracker.mark_used(entry.id());
        }
        true
    }

    /// Record the size of a request's data. Returns `false` (and removes the entry) when the
    /// new size no longer fits the cache.
    pub fn set_data_size(&mut self, key: &CacheKey, size: u64) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if size > self.max_bytes {
            debug!(target: "imgcache::cache", uri = %key.uri(), size, "entry outgrew the cache");
            self.remove(key);
            return false;
        }
        entry.data_size = size;
        if entry.has_no_proxies {
            self.queue.update(entry.id(), size, entry.touched_time);
        }
        true
    }

    /// Age the tracker up to `now`; expired entries are removed and returned.
    pub fn expire(&mut self, now: u64) -> Vec<(CacheKey, CacheEntry)> {
        let expired = self.tracker.advance(now);
        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(key) = self.keys.get(&id).cloned() {
                if let Some(entry) = self.remove(&key) {
                    trace!(target: "imgcache::cache", uri = %key.uri(), "entry expired");
                    removed.push((key, entry));
                }
            }
        }
        removed
    }

    /// Remove every entry, pinned or not.
    pub fn evict_all(&mut self) -> Vec<(CacheKey, CacheEntry)> {
        self.remove_matching(|_, _| true)
    }

    /// Remove every proxy-less entry.
    pub fn evict_queued(&mut self) -> Vec<(CacheKey, CacheEntry)> {
        self.remove_matching(|_, entry| entry.has_no_proxies())
    }

    pub fn remove_matching<F>(&mut self, mut predicate: F) -> Vec<(CacheKey, CacheEntry)>
    where
        F: FnMut(&CacheKey, &CacheEntry) -> bool,
    {
        let doomed: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(key, entry)| predicate(key, entry))
            .map(|(key, _)| key.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| self.remove(&key).map(|entry| (key, entry)))
            .collect()
    }

    /// Check the queue total against the table. Used by debug assertions and tests.
    pub fn verify_sizes(&self) -> bool {
        let queued: u64 = self
            .queue
            .ids()
            .filter_map(|id| self.keys.get(&id))
            .filter_map(|key| self.entries.get(key))
            .map(|entry| entry.data_size)
            .sum();
        queued == self.queue.total_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::IsolationAttributes;

    fn config(max_bytes: u64) -> RequestCacheConfig {
        RequestCacheConfig { max_bytes, ..Default::default() }
    }

    fn key(uri: &str) -> CacheKey {
        CacheKey::new(uri, IsolationAttributes::default())
    }

    fn entry(id: u64, size: u64, now: u64) -> CacheEntry {
        CacheEntry::new(EntryId::new(id), RequestId::new(id), now).with_data_size(size)
    }

    #[test]
    fn put_makes_entry_live_and_queued() {
        let mut cache = RequestCache::new(&config(1000), 0);
        assert!(cache.put(key("http://a/1"), entry(1, 10, 0)).unwrap().is_none());

        let stored = cache.get(&key("http://a/1")).unwrap();
        assert!(!stored.is_evicted());
        assert!(cache.queue().contains(stored.id()));
        assert!(cache.tracker().contains(stored.id()));
        assert_eq!(cache.queued_bytes(), 10);
    }

    #[test]
    fn put_replaces_and_returns_previous_entry() {
        let mut cache = RequestCache::new(&config(1000), 0);
        cache.put(key("http://a/1"), entry(1, 10, 0)).unwrap();
        let replaced = cache.put(key("http://a/1"), entry(2, 30, 0)).unwrap().unwrap();

        assert_eq!(replaced.id(), EntryId::new(1));
        assert!(replaced.is_evicted());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.queued_bytes(), 30);
        assert!(cache.verify_sizes());
    }

    #[test]
    fn oversized_entries_are_refused() {
        let mut cache = RequestCache::new(&config(100), 0);
        let err = cache.put(key("http://a/big"), entry(1, 101, 0)).unwrap_err();
        assert_eq!(err, CacheInsertError::TooLarge { size: 101, max: 100 });
        assert!(cache.is_empty());
    }

    #[test]
    fn pinned_entries_leave_queue_and_tracker() {
        let mut cache = RequestCache::new(&config(50), 0);
        cache.put(key("http://a/1"), entry(1, 40, 0)).unwrap();
        assert!(cache.set_has_proxies(&key("http://a/1")));
        assert_eq!(cache.queued_bytes(), 0);
        assert!(cache.tracker().is_empty());

        cache.put(key("http://a/2"), entry(2, 40, 1)).unwrap();
        let evicted = cache.check_cache_limits();
        assert!(evicted.is_empty());

        cache.set_has_no_proxies(&key("http://a/1"), 5);
        let evicted = cache.check_cache_limits();
        assert_eq!(evicted.len(), 1);
        assert!(cache.queued_bytes() <= 50);
        assert!(cache.verify_sizes());
    }

    #[test]
    fn expiry_removes_untouched_entries() {
        let mut cache = RequestCache::new(&config(1000), 0);
        cache.put(key("http://a/old"), entry(1, 1, 0)).unwrap();
        cache.put(key("http://a/pinned"), entry(2, 1, 0)).unwrap();
        cache.set_has_proxies(&key("http://a/pinned"));

        cache.expire(20);
        cache.touch(&key("http://a/old"), 20);
        assert!(cache.expire(30).is_empty());

        let expired = cache.expire(60);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, key("http://a/old"));
        assert!(cache.contains(&key("http://a/pinned")));
    }

    #[test]
    fn growing_past_budget_drops_entry() {
        let mut cache = RequestCache::new(&config(100), 0);
        cache.put(key("http://a/1"), entry(1, 10, 0)).unwrap();
        assert!(cache.set_data_size(&key("http://a/1"), 60));
        assert_eq!(cache.queued_bytes(), 60);
        assert!(!cache.set_data_size(&key("http://a/1"), 200));
        assert!(cache.is_empty());
        assert_eq!(cache.queued_bytes(), 0);
    }

    #[test]
    fn evict_queued_spares_pinned_entries() {
        let mut cache = RequestCache::new(&config(1000), 0);
        cache.put(key("http://a/1"), entry(1, 10, 0)).unwrap();
        cache.put(key("http://a/2"), entry(2, 10, 0)).unwrap();
        cache.set_has_proxies(&key("http://a/2"));

        let evicted = cache.evict_queued();
        assert_eq!(evicted.len(), 1);
        assert!(cache.contains(&key("http://a/2")));
        assert_eq!(cache.evict_all().len(), 1);
        assert!(cache.is_empty());
    }
}
