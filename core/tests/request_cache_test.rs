use imgcache_core::cache::{CacheEntry, CacheKey, IsolationAttributes, RequestCache};
use imgcache_core::config::RequestCacheConfig;
use imgcache_core::types::{EntryId, RequestId};

fn key(name: &str) -> CacheKey {
    CacheKey::new(format!("https://img.test/{name}.png"), IsolationAttributes::default())
}

fn cache(max_bytes: u64) -> RequestCache {
    RequestCache::new(&RequestCacheConfig { max_bytes, ..Default::default() }, 0)
}

fn entry(id: u64, size: u64, now: u64) -> CacheEntry {
    CacheEntry::new(EntryId::new(id), RequestId::new(id), now).with_data_size(size)
}

#[test]
fn size_pressure_evicts_the_older_larger_entry() {
    let mut cache = cache(120);
    cache.put(key("a"), entry(1, 100, 1)).unwrap();
    assert!(cache.check_cache_limits().is_empty());

    cache.put(key("b"), entry(2, 50, 2)).unwrap();
    let evicted = cache.check_cache_limits();

    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].0, key("a"));
    assert!(evicted[0].1.is_evicted());
    assert!(cache.get(&key("a")).is_none());
    assert!(cache.get(&key("b")).is_some());
    assert_eq!(cache.queued_bytes(), 50);
}

#[test]
fn pinned_entries_survive_limit_checks() {
    let mut cache = cache(100);
    cache.put(key("pinned"), entry(1, 80, 1)).unwrap();
    assert!(cache.set_has_proxies(&key("pinned")));
    cache.put(key("b"), entry(2, 60, 2)).unwrap();
    cache.put(key("c"), entry(3, 60, 3)).unwrap();

    let evicted = cache.check_cache_limits();

    assert_eq!(evicted.len(), 1);
    assert!(cache.get(&key("pinned")).is_some());
    assert!(!cache.queue().contains(EntryId::new(1)));
    assert!(!cache.tracker().contains(EntryId::new(1)));
    assert!(cache.queued_bytes() <= 100);
}

#[test]
fn queue_total_tracks_mixed_operations() {
    let mut cache = cache(1_000);
    for id in 1..=8u64 {
        cache.put(key(&id.to_string()), entry(id, id * 10, id)).unwrap();
        assert!(cache.verify_sizes());
    }
    cache.set_has_proxies(&key("2"));
    cache.set_has_proxies(&key("5"));
    assert!(cache.verify_sizes());
    cache.remove(&key("3"));
    cache.set_data_size(&key("4"), 90);
    cache.touch(&key("6"), 20);
    assert!(cache.verify_sizes());
    cache.set_has_no_proxies(&key("2"), 21);
    cache.put(key("7"), entry(9, 5, 22)).unwrap();
    assert!(cache.verify_sizes());

    let expected: u64 = [1u64, 2, 4, 6, 7, 8]
        .iter()
        .filter_map(|id| cache.get(&key(&id.to_string())))
        .map(CacheEntry::data_size)
        .sum();
    assert_eq!(cache.queued_bytes(), expected);
}

#[test]
fn put_then_get_returns_the_entry() {
    let mut cache = cache(1_000);
    let stored = entry(4, 10, 7);
    assert!(cache.put(key("x"), stored.clone()).unwrap().is_none());
    let found = cache.get(&key("x")).expect("cached");
    assert_eq!(found.request(), stored.request());
    assert_eq!(found.data_size(), 10);
    assert!(!found.is_evicted());
}

#[test]
fn keys_differ_by_isolation() {
    let mut cache = cache(1_000);
    let private = IsolationAttributes { private_browsing_id: 1, ..Default::default() };
    let uri = "https://img.test/shared.png";
    cache.put(CacheKey::new(uri, IsolationAttributes::default()), entry(1, 10, 0)).unwrap();

    assert!(cache.get(&CacheKey::new(uri, private)).is_none());
}

#[test]
fn untouched_entries_expire() {
    let config = RequestCacheConfig { generations: 3, generation_secs: 10, ..Default::default() };
    let mut cache = RequestCache::new(&config, 0);
    cache.put(key("old"), entry(1, 10, 0)).unwrap();

    assert!(cache.expire(15).is_empty());
    cache.put(key("young"), entry(2, 10, 25)).unwrap();
    let expired = cache.expire(30);

    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].0, key("old"));
    assert!(cache.get(&key("young")).is_some());
}
