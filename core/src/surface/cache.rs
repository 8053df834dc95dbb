//! Process-wide cache of decoded surfaces.
//!
//! Shared by every loader and written to by decode workers, so all state lives behind one
//! `parking_lot::Mutex`. The lock is never held while decoding. Surfaces of a locked image are
//! pinned; unlocked ready surfaces sit in an LRU and are evicted when the cost budget is
//! exceeded.

use std::collections::HashMap;
use std::sync::Arc;

use hashlink::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::SurfaceCacheConfig;
use crate::types::{ImageId, Size};

use super::{DrawableSurface, LookupResult, SubstituteReason, Surface, SurfaceKey};

#[derive(Debug)]
enum SlotState {
    Pending,
    Ready(DrawableSurface),
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    locked: bool,
}

#[derive(Debug, Default)]
struct ImageSurfaces {
    slots: HashMap<SurfaceKey, Slot>,
    locked: bool,
}

#[derive(Debug)]
struct Inner {
    images: HashMap<ImageId, ImageSurfaces>,
    /// Ready, unlocked surfaces in recency order, with their cost.
    lru: LruCache<(ImageId, SurfaceKey), u64>,
    total_cost: u64,
}

impl Inner {
    fn cost_of(&self, image: ImageId, key: &SurfaceKey) -> u64 {
        match self.images.get(&image).and_then(|surfaces| surfaces.slots.get(key)) {
            Some(Slot { state: SlotState::Ready(surface), .. }) => surface.cost(),
            _ => 0,
        }
    }

    fn drop_slot(&mut self, image: ImageId, key: &SurfaceKey) -> bool {
        let cost = self.cost_of(image, key);
        let Some(surfaces) = self.images.get_mut(&image) else {
            return false;
        };
        if surfaces.slots.remove(key).is_none() {
            return false;
        }
        self.lru.remove(&(image, *key));
        self.total_cost = self.total_cost.saturating_sub(cost);
        true
    }

    fn evict_until_fits(&mut self, incoming: u64, max_cost: u64) -> bool {
        while self.total_cost + incoming > max_cost {
            let Some(((image, key), _)) = self.lru.remove_lru() else {
                return false;
            };
            trace!(target: "imgcache::surface", image = %image, size = %key.size, "evicting surface");
            self.drop_slot(image, &key);
        }
        true
    }
}

#[derive(Debug)]
pub struct SurfaceCache {
    inner: Mutex<Inner>,
    config: SurfaceCacheConfig,
}

impl SurfaceCache {
    pub fn new(config: SurfaceCacheConfig) -> Self {
        let inner = Inner { images: HashMap::new(), lru: LruCache::new_unbounded(), total_cost: 0 };
        Self { inner: Mutex::new(inner), config }
    }

    pub fn config(&self) -> &SurfaceCacheConfig {
        &self.config
    }

    pub fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }

    pub fn max_cost(&self) -> u64 {
        self.config.max_bytes
    }

    /// True when a surface of `size` could ever fit the budget.
    pub fn can_hold(&self, size: Size) -> bool {
        size.rgba_bytes() <= self.config.max_bytes
    }

    /// Number of slots (pending or ready) held for `image`.
    pub fn surface_count(&self, image: ImageId) -> usize {
        self.inner.lock().images.get(&image).map(|surfaces| surfaces.slots.len()).unwrap_or(0)
    }

    /// Reserve `key` for a decode in progress. Returns `false` if the key is already present.
    pub fn insert_placeholder(&self, image: ImageId, key: SurfaceKey) -> bool {
        let mut inner = self.inner.lock();
        let surfaces = inner.images.entry(image).or_default();
        if surfaces.slots.contains_key(&key) {
            return false;
        }
        let locked = surfaces.locked;
        surfaces.slots.insert(key, Slot { state: SlotState::Pending, locked });
        true
    }

    /// Replace the placeholder for `key` with a finished surface. Without a placeholder (the
    /// image was removed or discarded meanwhile) the surface is dropped.
    pub fn finish(&self, image: ImageId, key: SurfaceKey, surface: Surface) -> Option<DrawableSurface> {
        let cost = surface.cost();
        let mut inner = self.inner.lock();
        let has_placeholder = matches!(
            inner.images.get(&image).and_then(|surfaces| surfaces.slots.get(&key)),
            Some(Slot { state: SlotState::Pending, .. })
        );
        if !has_placeholder {
            trace!(target: "imgcache::surface", image = %image, "no placeholder; dropping surface");
            return None;
        }
        if cost > self.config.max_bytes || !inner.evict_until_fits(cost, self.config.max_bytes) {
            debug!(target: "imgcache::surface", image = %image, cost, "surface does not fit budget");
            inner.drop_slot(image, &key);
            return None;
        }

        let inner = &mut *inner;
        let slot = inner.images.get_mut(&image).and_then(|surfaces| surfaces.slots.get_mut(&key))?;
        let surface = Arc::new(surface);
        slot.state = SlotState::Ready(Arc::clone(&surface));
        if !slot.locked {
            inner.lru.insert((image, key), cost);
        }
        inner.total_cost += cost;
        Some(surface)
    }

    /// Drop the placeholder of a failed decode.
    pub fn abandon(&self, image: ImageId, key: &SurfaceKey) {
        let mut inner = self.inner.lock();
        let pending = matches!(
            inner.images.get(&image).and_then(|surfaces| surfaces.slots.get(key)),
            Some(Slot { state: SlotState::Pending, .. })
        );
        if pending {
            inner.drop_slot(image, key);
        }
    }

    /// Exact lookup. With `mark_used` the surface becomes most recently used and, if its image
    /// is locked, is locked again.
    pub fn lookup(&self, image: ImageId, key: &SurfaceKey, mark_used: bool) -> LookupResult {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(surfaces) = inner.images.get_mut(&image) else {
            return LookupResult::NotFound;
        };
        let image_locked = surfaces.locked;
        let Some(slot) = surfaces.slots.get_mut(key) else {
            return LookupResult::NotFound;
        };
        let surface = match &slot.state {
            SlotState::Pending => return LookupResult::Pending,
            SlotState::Ready(surface) => Arc::clone(surface),
        };
        if mark_used {
            if image_locked && !slot.locked {
                slot.locked = true;
                inner.lru.remove(&(image, *key));
            } else if !slot.locked {
                inner.lru.get(&(image, *key));
            }
        }
        LookupResult::Found(surface)
    }

    /// Exact match if ready, else the smallest ready surface covering the request, else the
    /// largest smaller one. Only surfaces with the same flags and playback type qualify.
    pub fn lookup_best_match(&self, image: ImageId, key: &SurfaceKey) -> LookupResult {
        let exact = self.lookup(image, key, true);
        if exact.is_found() {
            return exact;
        }

        let inner = self.inner.lock();
        let Some(surfaces) = inner.images.get(&image) else {
            return LookupResult::NotFound;
        };
        let ready = surfaces.slots.iter().filter_map(|(candidate, slot)| match &slot.state {
            SlotState::Ready(surface)
                if candidate.flags == key.flags && candidate.playback == key.playback =>
            {
                Some((candidate.size, surface))
            }
            _ => None,
        });

        let mut larger: Option<(Size, &DrawableSurface)> = None;
        let mut smaller: Option<(Size, &DrawableSurface)> = None;
        for (size, surface) in ready {
            if size.covers(key.size) {
                if larger.is_none_or(|(best, _)| size.area() < best.area()) {
                    larger = Some((size, surface));
                }
            } else if smaller.is_none_or(|(best, _)| size.area() > best.area()) {
                smaller = Some((size, surface));
            }
        }

        let reason = match exact {
            LookupResult::Pending => SubstituteReason::Pending,
            _ => SubstituteReason::NotFound,
        };
        match larger.or(smaller) {
            Some((_, surface)) => LookupResult::Substitute {
                surface: Arc::clone(surface),
                suggested_size: key.size,
                reason,
            },
            None if reason == SubstituteReason::Pending => LookupResult::Pending,
            None => LookupResult::NotFound,
        }
    }

    /// Pin every current and future surface of `image`.
    pub fn lock_image(&self, image: ImageId) {
        let mut inner = self.inner.lock();
        let surfaces = inner.images.entry(image).or_default();
        surfaces.locked = true;
        let keys: Vec<SurfaceKey> = surfaces
            .slots
            .iter_mut()
            .map(|(key, slot)| {
                slot.locked = true;
                *key
            })
            .collect();
        for key in keys {
            inner.lru.remove(&(image, key));
        }
    }

    pub fn unlock_image(&self, image: ImageId) {
        let mut inner = self.inner.lock();
        let Some(surfaces) = inner.images.get_mut(&image) else {
            return;
        };
        surfaces.locked = false;
        Self::unlock_slots(&mut inner, image);
    }

    /// Unpin the existing surfaces of `image` while keeping the image locked, so surfaces at
    /// stale sizes can age out. Surfaces touched by a later lookup are pinned again.
    pub fn unlock_entries(&self, image: ImageId) {
        let mut inner = self.inner.lock();
        Self::unlock_slots(&mut inner, image);
    }

    fn unlock_slots(inner: &mut Inner, image: ImageId) {
        let Some(surfaces) = inner.images.get_mut(&image) else {
            return;
        };
        let mut released = Vec::new();
        for (key, slot) in surfaces.slots.iter_mut() {
            if !slot.locked {
                continue;
            }
            slot.locked = false;
            if let SlotState::Ready(surface) = &slot.state {
                released.push((*key, surface.cost()));
            }
        }
        for (key, cost) in released {
            inner.lru.insert((image, key), cost);
        }
    }

    pub fn is_locked(&self, image: ImageId) -> bool {
        self.inner.lock().images.get(&image).map(|surfaces| surfaces.locked).unwrap_or(false)
    }

    /// Drop the ready surfaces of `image`, keeping placeholders of running decodes and the lock
    /// state. Returns the number of surfaces removed.
    pub fn discard_ready(&self, image: ImageId) -> usize {
        let mut inner = self.inner.lock();
        let Some(surfaces) = inner.images.get(&image) else {
            return 0;
        };
        let ready: Vec<SurfaceKey> = surfaces
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot.state, SlotState::Ready(_)))
            .map(|(key, _)| *key)
            .collect();
        ready.iter().filter(|key| inner.drop_slot(image, key)).count()
    }

    /// Forget `image` entirely, including placeholders.
    pub fn remove_image(&self, image: ImageId) {
        let mut inner = self.inner.lock();
        let Some(surfaces) = inner.images.remove(&image) else {
            return;
        };
        for (key, slot) in surfaces.slots {
            if let SlotState::Ready(surface) = slot.state {
                inner.total_cost = inner.total_cost.saturating_sub(surface.cost());
                inner.lru.remove(&(image, key));
            }
        }
    }

    /// Evict every unlocked ready surface. Returns the bytes released.
    pub fn discard_all_unlocked(&self) -> u64 {
        let mut inner = self.inner.lock();
        let before = inner.total_cost;
        while let Some(((image, key), _)) = inner.lru.remove_lru() {
            inner.drop_slot(image, &key);
        }
        before - inner.total_cost
    }

    /// Drop everything. Used at shutdown.
    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.images.clear();
        inner.lru.clear();
        inner.total_cost = 0;
    }
}
