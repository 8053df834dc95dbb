//! The image loader: request cache lookups, request sharing between consumers, revalidation and
//! the glue between channel events, images and observers.
//!
//! A loader owns every [`ImageRequest`] and [`RequestProxy`] it hands out in arenas keyed by id.
//! Cache entries, channels and images refer to requests by [`RequestId`] only, so eviction never
//! has to untangle ownership: an evicted request simply moves to the uncached set and lives on
//! until its last proxy goes away.
//!
//! The loader is single-threaded. Decode workers report back through a channel that the embedder
//! drains with [`ImageLoader::process_decode_completions`].

mod context;
mod proxy;
mod request;
mod security;
mod transport;
mod validator;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::cache::{CacheEntry, CacheKey, RequestCache};
use crate::clock::Clock;
use crate::config::RequestCacheConfig;
use crate::decode::{DecodeOutcome, DecodePool, DecoderKind};
use crate::error::{ImageError, LoadError, ValidationError};
use crate::image::{DecodeContext, DecodeFlags, DrawOutcome, FrameSelection, Image, ImageEvent};
use crate::stats::TelemetrySink;
use crate::surface::{LookupResult, PlaybackType, SurfaceCache};
use crate::types::{ChannelId, DocumentId, EntryId, IdAllocator, ImageId, ProxyId, RequestId, Size};

use self::security::inherits_principal;

pub use context::AppContext;
pub use proxy::{ImageObserver, RequestProxy};
pub use request::{ImageRequest, LoadStatus, Notification, Progress, SecurityInfo};
pub use security::{AllowAll, CorsMode, PolicyDecision, PolicyType, Principal, ReferrerPolicy, SecurityChecker};
pub use transport::{ChannelRequest, LoadFlags, LoadRequest, ResponseInfo, Transport};
pub use validator::{CacheValidator, Validation, ValidatorState, should_revalidate, validate_entry};

/// Embedder services a loader calls out to.
#[derive(Debug, Clone)]
pub struct LoaderEnv {
    pub transport: Rc<dyn Transport>,
    pub security: Rc<dyn SecurityChecker>,
    pub clock: Rc<dyn Clock>,
}

/// What a transport channel is doing for the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelRole {
    Load(RequestId),
    Validate(RequestId),
}

/// Chrome and content requests are cached separately.
#[derive(Debug)]
struct Tables {
    chrome: RequestCache,
    content: RequestCache,
}

impl Tables {
    fn for_key(&mut self, key: &CacheKey) -> &mut RequestCache {
        if key.is_chrome() { &mut self.chrome } else { &mut self.content }
    }

    fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        if key.is_chrome() { self.chrome.get(key) } else { self.content.get(key) }
    }

    /// True if `key` is cached and its entry belongs to `request`.
    fn owns(&self, key: &CacheKey, request: RequestId) -> bool {
        self.get(key).is_some_and(|entry| entry.request() == request)
    }
}

/// Cached response properties, as reported by [`ImageLoader::find_entry_properties`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryProperties {
    pub content_type: Option<String>,
    pub final_uri: String,
    pub data_size: u64,
    pub expiry_time: u64,
    pub must_validate: bool,
}

#[derive(Debug)]
pub struct ImageLoader {
    private: bool,
    tables: Tables,
    requests: HashMap<RequestId, ImageRequest>,
    proxies: HashMap<ProxyId, RequestProxy>,
    /// Requests alive only through their proxies.
    uncached: HashSet<RequestId>,
    channels: HashMap<ChannelId, ChannelRole>,
    images: HashMap<ImageId, RequestId>,
    request_ids: IdAllocator,
    proxy_ids: IdAllocator,
    entry_ids: IdAllocator,
    env: LoaderEnv,
    decode: DecodeContext,
    completions: Receiver<DecodeOutcome>,
}

impl ImageLoader {
    pub fn new(
        private: bool,
        config: &RequestCacheConfig,
        surfaces: Arc<SurfaceCache>,
        pool: Arc<DecodePool>,
        telemetry: Arc<dyn TelemetrySink>,
        env: LoaderEnv,
    ) -> Self {
        let now = env.clock.now_secs();
        let (completion, completions) = mpsc::channel();
        debug!(target: "imgcache::loader", private, max_bytes = config.max_bytes, "loader created");
        Self {
            private,
            tables: Tables {
                chrome: RequestCache::new(config, now),
                content: RequestCache::new(config, now),
            },
            requests: HashMap::new(),
            proxies: HashMap::new(),
            uncached: HashSet::new(),
            channels: HashMap::new(),
            images: HashMap::new(),
            request_ids: IdAllocator::default(),
            proxy_ids: IdAllocator::default(),
            entry_ids: IdAllocator::default(),
            env,
            decode: DecodeContext { surfaces, pool, telemetry, completion },
            completions,
        }
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn chrome_cache(&self) -> &RequestCache {
        &self.tables.chrome
    }

    pub fn content_cache(&self) -> &RequestCache {
        &self.tables.content
    }

    pub fn cache_entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.tables.get(key)
    }

    pub fn request(&self, id: RequestId) -> Option<&ImageRequest> {
        self.requests.get(&id)
    }

    /// The request currently cached under `key`.
    pub fn request_for_key(&self, key: &CacheKey) -> Option<RequestId> {
        self.tables.get(key).map(CacheEntry::request)
    }

    pub fn proxy(&self, id: ProxyId) -> Option<&RequestProxy> {
        self.proxies.get(&id)
    }

    /// The request `proxy` currently observes.
    pub fn request_of(&self, proxy: ProxyId) -> Option<&ImageRequest> {
        self.proxies.get(&proxy).and_then(|proxy| self.requests.get(&proxy.owner))
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn uncached_count(&self) -> usize {
        self.uncached.len()
    }

    pub fn is_uncached(&self, id: RequestId) -> bool {
        self.uncached.contains(&id)
    }

    fn now(&self) -> u64 {
        self.env.clock.now_secs()
    }

    /// Start or join a load of `load.uri`. Notifications for the returned proxy go to `observer`.
    pub fn load_image(
        &mut self,
        load: LoadRequest,
        observer: Rc<dyn ImageObserver>,
    ) -> Result<ProxyId, LoadError> {
        let decision = self.env.security.check_load(
            &load.uri,
            load.triggering_principal.as_ref(),
            load.cors,
            load.policy_type,
        );
        if decision == PolicyDecision::Reject {
            debug!(target: "imgcache::loader", uri = %load.uri, "load blocked by content policy");
            return Err(LoadError::Blocked { uri: load.uri });
        }

        let key = load.cache_key();
        let now = self.now();
        let verdict = match self.tables.get(&key) {
            Some(entry) => match self.requests.get(&entry.request()) {
                Some(request) => {
                    Some((entry.request(), validate_entry(entry, request, &load, &*self.env.security, now)))
                }
                None => {
                    warn!(target: "imgcache::loader", %key, "cache entry without a live request");
                    None
                }
            },
            None => None,
        };

        match verdict {
            Some((request_id, Validation::Valid)) => {
                self.decode.telemetry.record_cache_lookup(true);
                self.tables.for_key(&key).touch(&key, now);
                if let Some(request) = self.requests.get_mut(&request_id) {
                    request.load_context = load.load_context;
                    request.inner_window = load.inner_window;
                }
                trace!(target: "imgcache::loader", %key, request = %request_id, "request cache hit");
                return Ok(self.create_proxy(request_id, observer, load.load_flags, true));
            }
            Some((request_id, Validation::NeedsRevalidation)) => {
                self.decode.telemetry.record_cache_lookup(true);
                match self.revalidate(request_id, &load, Rc::clone(&observer)) {
                    Ok(proxy) => return Ok(proxy),
                    Err(err) => {
                        debug!(target: "imgcache::loader", %key, "revalidation could not start: {err}");
                        self.remove_cached(&key);
                    }
                }
            }
            Some((request_id, Validation::Invalid(reason))) => {
                debug!(target: "imgcache::loader", %key, request = %request_id, "cached request unusable: {reason}");
                self.remove_cached(&key);
            }
            None => {
                if self.tables.get(&key).is_some() {
                    self.remove_cached(&key);
                }
            }
        }

        self.decode.telemetry.record_cache_lookup(false);
        self.start_load(key, &load, observer)
    }

    fn start_load(
        &mut self,
        key: CacheKey,
        load: &LoadRequest,
        observer: Rc<dyn ImageObserver>,
    ) -> Result<ProxyId, LoadError> {
        let channel = self.env.transport.open(&ChannelRequest::for_load(load, false))?;
        let request_id = RequestId::new(self.request_ids.allocate());
        let image = Image::new(self.decode.clone(), None);
        let mut request = ImageRequest::new(request_id, key.clone(), load, image);
        request.channel = Some(channel);
        self.images.insert(request.image.id(), request_id);
        self.channels.insert(channel, ChannelRole::Load(request_id));
        self.requests.insert(request_id, request);
        debug!(target: "imgcache::loader", %key, request = %request_id, %channel, "network load started");

        let entry = CacheEntry::new(EntryId::new(self.entry_ids.allocate()), request_id, self.now())
            .with_force_principal_check(inherits_principal(key.uri()));
        self.put_into_cache(key, entry);
        Ok(self.create_proxy(request_id, observer, load.load_flags, false))
    }

    /// Join the validator of `request_id`, starting one if none is in flight.
    fn revalidate(
        &mut self,
        request_id: RequestId,
        load: &LoadRequest,
        observer: Rc<dyn ImageObserver>,
    ) -> Result<ProxyId, LoadError> {
        let in_flight = self.requests.get(&request_id).is_some_and(ImageRequest::is_validating);
        if !in_flight {
            let channel = self.env.transport.open(&ChannelRequest::for_load(load, true))?;
            let mut validator = CacheValidator::new(request_id, load);
            validator.start(channel);
            self.channels.insert(channel, ChannelRole::Validate(request_id));
            if let Some(request) = self.requests.get_mut(&request_id) {
                request.validator = Some(validator);
            }
            debug!(target: "imgcache::loader", request = %request_id, %channel, "revalidation started");
        }

        let proxy_id = ProxyId::new(self.proxy_ids.allocate());
        let mut proxy = RequestProxy::new(proxy_id, request_id, observer, load.load_flags);
        proxy.mark_validating();
        self.proxies.insert(proxy_id, proxy);
        self.attach_proxy(request_id, proxy_id);
        if let Some(validator) = self.requests.get_mut(&request_id).and_then(|r| r.validator.as_mut()) {
            validator.park(proxy_id);
        }
        Ok(proxy_id)
    }

    fn create_proxy(
        &mut self,
        request_id: RequestId,
        observer: Rc<dyn ImageObserver>,
        flags: LoadFlags,
        replay: bool,
    ) -> ProxyId {
        let proxy_id = ProxyId::new(self.proxy_ids.allocate());
        self.proxies.insert(proxy_id, RequestProxy::new(proxy_id, request_id, observer, flags));
        self.attach_proxy(request_id, proxy_id);
        if replay {
            self.sync_notify(proxy_id);
        }
        proxy_id
    }

    fn attach_proxy(&mut self, request_id: RequestId, proxy_id: ProxyId) {
        let locks = self.proxies.get(&proxy_id).map_or(0, |proxy| proxy.lock_count);
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let first = request.proxies.is_empty();
        request.proxies.push(proxy_id);
        for _ in 0..locks {
            request.image.lock();
        }
        if first && request.is_in_cache && self.tables.owns(&request.key, request_id) {
            self.tables.for_key(&request.key).set_has_proxies(&request.key);
        }
    }

    /// Catch `proxy_id` up with everything its request has already reached.
    fn sync_notify(&mut self, proxy_id: ProxyId) {
        let Some(proxy) = self.proxies.get_mut(&proxy_id) else {
            return;
        };
        let Some(request) = self.requests.get(&proxy.owner) else {
            return;
        };
        for notification in request.replay(proxy.observed) {
            proxy.deliver(&notification);
        }
    }

    fn broadcast(&mut self, request_id: RequestId, notification: Notification) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        if !request.record(&notification) {
            return;
        }
        for proxy_id in &request.proxies {
            if let Some(proxy) = self.proxies.get_mut(proxy_id) {
                proxy.deliver(&notification);
            }
        }
    }

    fn handle_image_events(&mut self, request_id: RequestId, events: Vec<ImageEvent>) {
        for event in events {
            let failed = matches!(event, ImageEvent::Error(_));
            self.broadcast(request_id, event.into());
            if failed {
                // Broken images must not be handed to later loads.
                self.uncache_request(request_id);
            }
        }
    }

    /// Store `entry` under `key`. On failure the request stays alive, uncached.
    fn put_into_cache(&mut self, key: CacheKey, entry: CacheEntry) -> bool {
        let request_id = entry.request();
        match self.tables.for_key(&key).put(key, entry) {
            Ok(replaced) => {
                if let Some(request) = self.requests.get_mut(&request_id) {
                    request.is_in_cache = true;
                }
                self.uncached.remove(&request_id);
                if let Some(old) = replaced.filter(|old| old.request() != request_id) {
                    self.on_entry_removed(old);
                }
                true
            }
            Err(err) => {
                debug!(target: "imgcache::loader", request = %request_id, "not cached: {err}");
                if let Some(request) = self.requests.get_mut(&request_id) {
                    request.is_in_cache = false;
                }
                self.uncached.insert(request_id);
                false
            }
        }
    }

    fn remove_cached(&mut self, key: &CacheKey) -> bool {
        match self.tables.for_key(key).remove(key) {
            Some(entry) => {
                self.on_entry_removed(entry);
                true
            }
            None => false,
        }
    }

    /// Drop the cache entry of `request_id`, if the cache still points at it.
    fn uncache_request(&mut self, request_id: RequestId) {
        let Some(key) = self.requests.get(&request_id).map(|request| request.key.clone()) else {
            return;
        };
        if let Some(entry) = self.tables.for_key(&key).remove_if_owned(&key, request_id) {
            self.on_entry_removed(entry);
        } else if let Some(request) = self.requests.get_mut(&request_id) {
            request.is_in_cache = false;
            self.uncached.insert(request_id);
        }
    }

    fn on_entry_removed(&mut self, entry: CacheEntry) {
        let request_id = entry.request();
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        request.is_in_cache = false;
        self.uncached.insert(request_id);
        trace!(target: "imgcache::loader", request = %request_id, "request left the cache");
        if request.proxies.is_empty() {
            self.destroy_request(request_id);
        }
    }

    fn handle_evicted(&mut self, evicted: Vec<(CacheKey, CacheEntry)>) -> usize {
        let count = evicted.len();
        for (key, entry) in evicted {
            trace!(target: "imgcache::loader", %key, "evicted");
            self.on_entry_removed(entry);
        }
        self.report_usage();
        count
    }

    fn report_usage(&self) {
        let used = self.tables.chrome.queued_bytes() + self.tables.content.queued_bytes();
        let capacity = self.tables.chrome.max_bytes() + self.tables.content.max_bytes();
        self.decode.telemetry.update_cache_usage(used, capacity);
    }

    fn destroy_request(&mut self, request_id: RequestId) {
        let Some(mut request) = self.requests.remove(&request_id) else {
            return;
        };
        self.uncached.remove(&request_id);
        if let Some(channel) = request.channel.take() {
            if self.channels.remove(&channel).is_some() {
                self.env.transport.cancel(channel);
            }
        }
        if let Some(channel) = request.validator.take().and_then(|validator| validator.channel()) {
            if self.channels.remove(&channel).is_some() {
                self.env.transport.cancel(channel);
            }
        }
        for proxy_id in &request.proxies {
            self.proxies.remove(proxy_id);
        }
        self.images.remove(&request.image.id());
        trace!(target: "imgcache::loader", request = %request_id, "request destroyed");
    }

    /// Detach and forget `proxy`. Cancelling the last proxy of a running load aborts the load.
    pub fn cancel(&mut self, proxy: ProxyId) -> Result<(), ImageError> {
        let mut removed = self.proxies.remove(&proxy).ok_or(ImageError::UnknownProxy)?;
        removed.cancelled = true;
        self.remove_proxy(&removed, Err(LoadError::Aborted.into()));
        Ok(())
    }

    fn remove_proxy(&mut self, proxy: &RequestProxy, status: LoadStatus) {
        let request_id = proxy.owner;
        let now = self.now();
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        request.proxies.retain(|attached| *attached != proxy.id);
        if let Some(validator) = request.validator.as_mut() {
            validator.unpark(proxy.id);
        }
        for _ in 0..proxy.lock_count {
            request.image.unlock();
        }
        if !request.proxies.is_empty() {
            return;
        }

        if status.is_err() && request.is_loading() && request.channel.is_some() {
            debug!(target: "imgcache::loader", request = %request_id, "last proxy gone, aborting load");
            self.uncache_request(request_id);
            self.destroy_request(request_id);
            return;
        }

        if request.is_in_cache && self.tables.owns(&request.key, request_id) {
            let key = request.key.clone();
            let table = self.tables.for_key(&key);
            table.set_has_no_proxies(&key, now);
            let evicted = table.check_cache_limits();
            self.handle_evicted(evicted);
        } else {
            self.destroy_request(request_id);
        }
    }

    /// The embedder's transport received response headers on `channel`.
    pub fn on_start_request(&mut self, channel: ChannelId, response: ResponseInfo) {
        match self.channels.get(&channel).copied() {
            Some(ChannelRole::Load(request_id)) => self.load_started(request_id, response),
            Some(ChannelRole::Validate(request_id)) => self.validation_answered(request_id, channel, response),
            None => warn!(target: "imgcache::loader", %channel, "start on unknown channel"),
        }
    }

    fn load_started(&mut self, request_id: RequestId, response: ResponseInfo) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        if let Some(final_uri) = &response.final_uri {
            request.final_uri = final_uri.clone();
        }
        if let Some(content_type) = &response.content_type {
            request.image.set_content_type(content_type);
        }
        request.content_type = response.content_type.clone();
        let uri = request.final_uri.clone();
        if request.is_in_cache && self.tables.owns(&request.key, request_id) {
            if let Some(entry) = self.tables.for_key(&request.key).get_mut(&request.key) {
                entry.set_expiry_time(response.expiry.unwrap_or(0));
                entry.set_must_validate(response.must_validate);
                entry.set_final_uri(uri.clone());
            }
        }

        self.broadcast(request_id, Notification::StartRequest);

        if !response.is_success() {
            self.fail_load(request_id, LoadError::HttpStatus { uri, status: response.status });
            return;
        }
        if let Some(content_type) = response.content_type.filter(|ct| !is_image_content_type(ct)) {
            self.fail_load(request_id, LoadError::UnsupportedType { content_type: Some(content_type) });
        }
    }

    fn validation_answered(&mut self, request_id: RequestId, channel: ChannelId, response: ResponseInfo) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            self.channels.remove(&channel);
            self.env.transport.cancel(channel);
            return;
        };
        let Some(mut validator) = request.validator.take() else {
            return;
        };
        // Compare against where the cached load ended up, not the key's URI.
        let cached_uri = self
            .tables
            .get(&request.key)
            .filter(|entry| entry.request() == request_id)
            .and_then(CacheEntry::final_uri)
            .unwrap_or(request.final_uri.as_str())
            .to_string();
        let response_uri = response
            .final_uri
            .clone()
            .or_else(|| validator.redirected_to().map(str::to_string))
            .unwrap_or_else(|| cached_uri.clone());
        match validator.resolve(response.from_cache, &response_uri, &cached_uri) {
            ValidatorState::Reused => {
                self.channels.remove(&channel);
                self.env.transport.cancel(channel);
                request.load_context = validator.load_context();
                request.inner_window = validator.inner_window();
                let key = request.key.clone();
                let now = self.now();
                self.tables.for_key(&key).touch(&key, now);
                for proxy_id in validator.take_parked() {
                    if let Some(proxy) = self.proxies.get_mut(&proxy_id) {
                        proxy.clear_validating();
                    }
                    self.sync_notify(proxy_id);
                }
            }
            _ => self.migrate(request_id, validator, channel, response),
        }
    }

    /// Move the proxies parked on `validator` to a fresh request fed by `channel`.
    fn migrate(
        &mut self,
        old_id: RequestId,
        mut validator: CacheValidator,
        channel: ChannelId,
        response: ResponseInfo,
    ) {
        self.uncache_request(old_id);
        let Some(old) = self.requests.get(&old_id) else {
            return;
        };
        let new_id = RequestId::new(self.request_ids.allocate());
        let image = Image::new(self.decode.clone(), None);
        let mut request =
            ImageRequest::succeeding(old, new_id, image, validator.load_context(), validator.inner_window());
        request.channel = Some(channel);
        if let Some(uri) = validator.redirected_to() {
            request.final_uri = uri.to_string();
        }
        request.security.had_insecure_redirect |= validator.had_insecure_redirect();
        let key = request.key.clone();
        self.images.insert(request.image.id(), new_id);
        self.channels.insert(channel, ChannelRole::Load(new_id));
        self.requests.insert(new_id, request);
        debug!(target: "imgcache::loader", from = %old_id, to = %new_id, "revalidation brought new data");

        // The new entry must be in place before proxies change hands.
        let entry = CacheEntry::new(EntryId::new(self.entry_ids.allocate()), new_id, self.now())
            .with_force_principal_check(inherits_principal(key.uri()));
        self.put_into_cache(key, entry);

        for proxy_id in validator.take_parked() {
            let Some(proxy) = self.proxies.get_mut(&proxy_id) else {
                continue;
            };
            let locks = proxy.lock_count;
            proxy.change_owner(new_id);
            proxy.clear_validating();
            if let Some(old) = self.requests.get_mut(&old_id) {
                old.proxies.retain(|attached| *attached != proxy_id);
                for _ in 0..locks {
                    old.image.unlock();
                }
            }
            self.attach_proxy(new_id, proxy_id);
        }
        if self.requests.get(&old_id).is_some_and(|old| old.proxies.is_empty()) {
            self.destroy_request(old_id);
        }

        self.load_started(new_id, response);
    }

    /// The embedder's transport followed a redirect on `channel`.
    pub fn on_redirect(&mut self, channel: ChannelId, uri: &str, secure: bool) {
        let request_id = match self.channels.get(&channel).copied() {
            Some(ChannelRole::Load(request_id)) => request_id,
            Some(ChannelRole::Validate(request_id)) => {
                if let Some(validator) = self.requests.get_mut(&request_id).and_then(|r| r.validator.as_mut()) {
                    validator.redirected(uri, secure);
                }
                return;
            }
            None => {
                trace!(target: "imgcache::loader", %channel, "redirect ignored");
                return;
            }
        };
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let decision = self.env.security.check_load(
            uri,
            request.security.triggering_principal.as_ref(),
            request.security.cors,
            request.security.policy_type,
        );
        if decision == PolicyDecision::Reject {
            self.fail_load(request_id, LoadError::Blocked { uri: uri.to_string() });
            return;
        }
        request.final_uri = uri.to_string();
        if !secure {
            request.security.had_insecure_redirect = true;
        }
        trace!(target: "imgcache::loader", request = %request_id, %uri, secure, "redirected");
    }

    /// The embedder's transport delivered body bytes on `channel`.
    pub fn on_data_available(&mut self, channel: ChannelId, bytes: &[u8]) {
        let Some(ChannelRole::Load(request_id)) = self.channels.get(&channel).copied() else {
            return;
        };
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let events = request.image.on_source_data(bytes);
        let size = request.image.source_len() as u64;
        if request.is_in_cache && self.tables.owns(&request.key, request_id) {
            let key = request.key.clone();
            let table = self.tables.for_key(&key);
            if table.set_data_size(&key, size) {
                let evicted = table.check_cache_limits();
                self.handle_evicted(evicted);
            } else {
                request.is_in_cache = false;
                self.uncached.insert(request_id);
            }
        }
        self.handle_image_events(request_id, events);
    }

    /// The load on `channel` finished.
    pub fn on_stop_request(&mut self, channel: ChannelId, status: Result<(), LoadError>) {
        let Some(role) = self.channels.remove(&channel) else {
            trace!(target: "imgcache::loader", %channel, "stop on unknown channel");
            return;
        };
        match (role, status) {
            (ChannelRole::Load(request_id), Ok(())) => {
                let Some(request) = self.requests.get_mut(&request_id) else {
                    return;
                };
                request.channel = None;
                let events = request.image.on_source_complete(Ok(()));
                self.handle_image_events(request_id, events);
                let status = match self.requests.get(&request_id).and_then(|r| r.image.error()) {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                };
                self.broadcast(request_id, Notification::StopRequest(status));
                self.report_usage();
            }
            (ChannelRole::Load(request_id), Err(err)) => {
                if let Some(request) = self.requests.get_mut(&request_id) {
                    request.channel = None;
                }
                self.fail_load(request_id, err);
            }
            (ChannelRole::Validate(request_id), Err(err)) => self.fail_validation(request_id, err),
            (ChannelRole::Validate(request_id), Ok(())) => {
                // A validator always hears headers first; a bare stop means nothing came back.
                self.fail_validation(request_id, LoadError::Aborted);
            }
        }
    }

    fn fail_load(&mut self, request_id: RequestId, err: LoadError) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        if let Some(channel) = request.channel.take() {
            if self.channels.remove(&channel).is_some() {
                self.env.transport.cancel(channel);
            }
        }
        debug!(target: "imgcache::loader", request = %request_id, "load failed: {err}");
        let err = ImageError::from(err);
        let events = request.image.on_source_complete(Err(err.clone()));
        self.handle_image_events(request_id, events);
        self.broadcast(request_id, Notification::StopRequest(Err(err)));
    }

    fn fail_validation(&mut self, request_id: RequestId, err: LoadError) {
        let Some(mut validator) = self.requests.get_mut(&request_id).and_then(|r| r.validator.take()) else {
            return;
        };
        validator.fail();
        debug!(target: "imgcache::loader", request = %request_id, "revalidation failed: {err}");
        let err = ImageError::from(ValidationError::ConditionalLoad(err));
        for proxy_id in validator.take_parked() {
            let Some(mut proxy) = self.proxies.remove(&proxy_id) else {
                continue;
            };
            proxy.clear_validating();
            proxy.deliver(&Notification::Error(err.clone()));
            proxy.deliver(&Notification::StopRequest(Err(err.clone())));
            proxy.cancelled = true;
            self.remove_proxy(&proxy, Ok(()));
        }
    }

    fn image_of(&mut self, proxy: ProxyId) -> Result<(RequestId, &mut Image), ImageError> {
        let owner = self.proxies.get(&proxy).ok_or(ImageError::UnknownProxy)?.owner;
        let request = self.requests.get_mut(&owner).ok_or(ImageError::UnknownProxy)?;
        Ok((owner, &mut request.image))
    }

    fn after_decode_request(&mut self, flags: DecodeFlags) {
        if !flags.contains(DecodeFlags::ASYNC_NOTIFY) {
            self.process_decode_completions();
        }
    }

    /// Look up a surface for `proxy`'s image, starting a decode if needed.
    pub fn lookup_frame(
        &mut self,
        proxy: ProxyId,
        size: Size,
        flags: DecodeFlags,
        playback: PlaybackType,
    ) -> Result<LookupResult, ImageError> {
        let (_, image) = self.image_of(proxy)?;
        let result = image.lookup_frame(size, flags, playback);
        self.after_decode_request(flags);
        Ok(result)
    }

    pub fn draw(
        &mut self,
        proxy: ProxyId,
        size: Size,
        flags: DecodeFlags,
        which: FrameSelection,
    ) -> Result<DrawOutcome, ImageError> {
        let (_, image) = self.image_of(proxy)?;
        let outcome = image.draw(size, flags, which);
        self.after_decode_request(flags);
        Ok(outcome)
    }

    /// Ask for `proxy`'s image to be decoded at `size`, or at its intrinsic size.
    pub fn request_decode(
        &mut self,
        proxy: ProxyId,
        size: Option<Size>,
        flags: DecodeFlags,
    ) -> Result<bool, ImageError> {
        let (_, image) = self.image_of(proxy)?;
        let size = size.or_else(|| image.size()).unwrap_or_default();
        let started = image.request_decode_for_size(size, flags);
        self.after_decode_request(flags);
        Ok(started)
    }

    pub fn lock_image(&mut self, proxy: ProxyId) -> Result<(), ImageError> {
        let handle = self.proxies.get_mut(&proxy).ok_or(ImageError::UnknownProxy)?;
        handle.lock_count += 1;
        let (_, image) = self.image_of(proxy)?;
        image.lock();
        Ok(())
    }

    pub fn unlock_image(&mut self, proxy: ProxyId) -> Result<(), ImageError> {
        let handle = self.proxies.get_mut(&proxy).ok_or(ImageError::UnknownProxy)?;
        if handle.lock_count == 0 {
            return Ok(());
        }
        handle.lock_count -= 1;
        let (_, image) = self.image_of(proxy)?;
        image.unlock();
        Ok(())
    }

    /// Drop the decoded surfaces of `proxy`'s image if nothing pins them.
    pub fn discard_image(&mut self, proxy: ProxyId) -> Result<bool, ImageError> {
        let (request_id, image) = self.image_of(proxy)?;
        if !image.can_discard() {
            return Ok(false);
        }
        let events = image.discard();
        self.handle_image_events(request_id, events);
        Ok(true)
    }

    /// Advance every running animation to `now`.
    pub fn refresh_animations(&mut self, now: Instant) {
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();
        for request_id in ids {
            let Some(request) = self.requests.get_mut(&request_id) else {
                continue;
            };
            let events = request.image.refresh_animation(now);
            self.handle_image_events(request_id, events);
        }
    }

    /// Apply every finished decode. Returns how many were applied.
    pub fn process_decode_completions(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(outcome) = self.completions.try_recv() {
            self.apply_decode_outcome(outcome);
            applied += 1;
        }
        applied
    }

    /// Block until at least one decode finishes or `timeout` elapses, then apply what arrived.
    pub fn wait_for_decodes(&mut self, timeout: Duration) -> usize {
        match self.completions.recv_timeout(timeout) {
            Ok(outcome) => {
                self.apply_decode_outcome(outcome);
                1 + self.process_decode_completions()
            }
            Err(_) => 0,
        }
    }

    fn apply_decode_outcome(&mut self, outcome: DecodeOutcome) {
        let Some(&request_id) = self.images.get(&outcome.image) else {
            trace!(target: "imgcache::loader", image = %outcome.image, "decode finished for a dropped image");
            return;
        };
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let events = request.image.on_decode_complete(&outcome);
        self.handle_image_events(request_id, events);
    }

    /// Evict every entry of the chrome or content table.
    pub fn clear_cache(&mut self, chrome: bool) -> usize {
        let evicted = if chrome { self.tables.chrome.evict_all() } else { self.tables.content.evict_all() };
        info!(target: "imgcache::loader", chrome, count = evicted.len(), "cache cleared");
        self.handle_evicted(evicted)
    }

    pub fn remove_entry(&mut self, key: &CacheKey) -> bool {
        let removed = self.remove_cached(key);
        self.report_usage();
        removed
    }

    /// Evict every entry whose URI belongs to `principal`'s origin.
    pub fn remove_entries_from_principal(&mut self, principal: &Principal) -> usize {
        let mut evicted = self.tables.chrome.remove_matching(|key, _| principal.owns_uri(key.uri()));
        evicted.extend(self.tables.content.remove_matching(|key, _| principal.owns_uri(key.uri())));
        debug!(target: "imgcache::loader", %principal, count = evicted.len(), "entries removed for principal");
        self.handle_evicted(evicted)
    }

    /// Evict every entry keyed to `document`.
    pub fn clear_cache_for_controlled_document(&mut self, document: DocumentId) -> usize {
        let matches = |key: &CacheKey, _: &CacheEntry| key.controlling_document() == Some(document);
        let mut evicted = self.tables.chrome.remove_matching(matches);
        evicted.extend(self.tables.content.remove_matching(matches));
        self.handle_evicted(evicted)
    }

    /// Evict every proxy-less entry.
    pub fn minimize_caches(&mut self) -> usize {
        let mut evicted = self.tables.chrome.evict_queued();
        evicted.extend(self.tables.content.evict_queued());
        self.handle_evicted(evicted)
    }

    /// Shed everything that can be rebuilt. Returns the decoded bytes freed.
    pub fn on_memory_pressure(&mut self) -> u64 {
        let entries = self.minimize_caches();
        let freed = self.decode.surfaces.discard_all_unlocked();
        info!(target: "imgcache::loader", entries, freed, "memory pressure handled");
        freed
    }

    /// Evict entries untouched for longer than the ageing window.
    pub fn expire_entries(&mut self) -> usize {
        let now = self.now();
        let mut evicted = self.tables.chrome.expire(now);
        evicted.extend(self.tables.content.expire(now));
        self.handle_evicted(evicted)
    }

    /// Response properties of the request cached under `key`. Counts as a use of the entry.
    pub fn find_entry_properties(&mut self, key: &CacheKey) -> Option<EntryProperties> {
        let now = self.now();
        let entry = self.tables.get(key)?;
        let request = self.requests.get(&entry.request())?;
        let properties = EntryProperties {
            content_type: request.content_type.clone(),
            final_uri: request.final_uri.clone(),
            data_size: entry.data_size(),
            expiry_time: entry.expiry_time(),
            must_validate: entry.must_validate(),
        };
        self.tables.for_key(key).touch(key, now);
        Some(properties)
    }

    /// Drop every entry, request and proxy. Used at shutdown.
    pub fn clear_all(&mut self) {
        let mut evicted = self.tables.chrome.evict_all();
        evicted.extend(self.tables.content.evict_all());
        drop(evicted);
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();
        for request_id in ids {
            self.destroy_request(request_id);
        }
        self.proxies.clear();
        self.uncached.clear();
        debug!(target: "imgcache::loader", private = self.private, "loader cleared");
    }
}

/// Content types the loader accepts for image data. Unknown `image/*` types are let through to
/// sniffing.
fn is_image_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    DecoderKind::from_mime(&essence).is_some()
        || essence.starts_with("image/")
        || essence == "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Cursor;

    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{DecodePoolConfig, SurfaceCacheConfig};
    use crate::stats::StatsCollector;

    #[derive(Debug, Default)]
    struct FakeTransport {
        next: RefCell<u64>,
        opened: RefCell<Vec<(ChannelId, ChannelRequest)>>,
        cancelled: RefCell<Vec<ChannelId>>,
    }

    impl Transport for FakeTransport {
        fn open(&self, request: &ChannelRequest) -> Result<ChannelId, LoadError> {
            let mut next = self.next.borrow_mut();
            *next += 1;
            let id = ChannelId::new(*next);
            self.opened.borrow_mut().push((id, request.clone()));
            Ok(id)
        }

        fn cancel(&self, channel: ChannelId) {
            self.cancelled.borrow_mut().push(channel);
        }
    }

    #[derive(Default)]
    struct Recorder(RefCell<Vec<Notification>>);

    impl ImageObserver for Recorder {
        fn notify(&self, _: ProxyId, notification: &Notification) {
            self.0.borrow_mut().push(notification.clone());
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = ImageBuffer::from_pixel(width, height, Rgba([10u8, 20, 30, 255]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image).write_to(&mut cursor, ImageFormat::Png).expect("encode");
        cursor.into_inner()
    }

    fn loader(transport: &Rc<FakeTransport>, max_bytes: u64) -> ImageLoader {
        let telemetry: Arc<dyn TelemetrySink> = Arc::new(StatsCollector::new());
        let pool = DecodePool::new(
            &DecodePoolConfig { worker_threads: 1, sync_decode_pixel_limit: 1 << 20 },
            Arc::clone(&telemetry),
        )
        .expect("pool");
        let env = LoaderEnv {
            transport: transport.clone(),
            security: Rc::new(AllowAll),
            clock: Rc::new(ManualClock::new(1_000)),
        };
        ImageLoader::new(
            false,
            &RequestCacheConfig { max_bytes, ..Default::default() },
            Arc::new(SurfaceCache::new(SurfaceCacheConfig::default())),
            Arc::new(pool),
            telemetry,
            env,
        )
    }

    fn observer() -> (Rc<Recorder>, Rc<dyn ImageObserver>) {
        let recorder = Rc::new(Recorder::default());
        let observer: Rc<dyn ImageObserver> = recorder.clone();
        (recorder, observer)
    }

    fn finish(loader: &mut ImageLoader, channel: ChannelId, bytes: &[u8]) {
        loader.on_start_request(channel, ResponseInfo::ok("image/png"));
        loader.on_data_available(channel, bytes);
        loader.on_stop_request(channel, Ok(()));
    }

    #[test]
    fn second_load_shares_the_request() {
        let transport = Rc::new(FakeTransport::default());
        let mut loader = loader(&transport, 1 << 20);
        let (_, first) = observer();
        let (_, second) = observer();

        let a = loader.load_image(LoadRequest::new("https://a.test/x.png"), first).expect("load");
        let b = loader.load_image(LoadRequest::new("https://a.test/x.png"), second).expect("load");
        assert_eq!(transport.opened.borrow().len(), 1);
        assert_eq!(loader.request_of(a).map(ImageRequest::id), loader.request_of(b).map(ImageRequest::id));
        assert_eq!(loader.request_count(), 1);
    }

    #[test]
    fn late_proxy_is_replayed_to() {
        let transport = Rc::new(FakeTransport::default());
        let mut loader = loader(&transport, 1 << 20);
        let (_, first) = observer();
        loader.load_image(LoadRequest::new("https://a.test/x.png"), first).expect("load");
        finish(&mut loader, ChannelId::new(1), &png(4, 4));

        let (recorder, late) = observer();
        loader.load_image(LoadRequest::new("https://a.test/x.png"), late).expect("load");
        let seen = recorder.0.borrow();
        assert_eq!(seen.first(), Some(&Notification::StartRequest));
        assert!(seen.contains(&Notification::SizeAvailable(Size::new(4, 4))));
        assert_eq!(seen.last(), Some(&Notification::StopRequest(Ok(()))));
    }

    #[test]
    fn cancelling_last_proxy_aborts_running_load() {
        let transport = Rc::new(FakeTransport::default());
        let mut loader = loader(&transport, 1 << 20);
        let (_, obs) = observer();
        let proxy = loader.load_image(LoadRequest::new("https://a.test/x.png"), obs).expect("load");
        loader.cancel(proxy).expect("cancel");
        assert_eq!(*transport.cancelled.borrow(), vec![ChannelId::new(1)]);
        assert_eq!(loader.request_count(), 0);
        assert!(loader.content_cache().is_empty());
        assert_eq!(loader.cancel(proxy), Err(ImageError::UnknownProxy));
    }

    #[test]
    fn finished_request_stays_cached_without_proxies() {
        let transport = Rc::new(FakeTransport::default());
        let mut loader = loader(&transport, 1 << 20);
        let (_, obs) = observer();
        let proxy = loader.load_image(LoadRequest::new("https://a.test/x.png"), obs).expect("load");
        finish(&mut loader, ChannelId::new(1), &png(4, 4));
        loader.cancel(proxy).expect("cancel");

        let key = LoadRequest::new("https://a.test/x.png").cache_key();
        let entry = loader.cache_entry(&key).expect("cached");
        assert!(entry.has_no_proxies());
        assert!(entry.data_size() > 0);
        assert_eq!(loader.content_cache().queued_bytes(), entry.data_size());
    }

    #[test]
    fn http_errors_fail_and_uncache() {
        let transport = Rc::new(FakeTransport::default());
        let mut loader = loader(&transport, 1 << 20);
        let (recorder, obs) = observer();
        loader.load_image(LoadRequest::new("https://a.test/missing.png"), obs).expect("load");
        loader.on_start_request(ChannelId::new(1), ResponseInfo { status: 404, ..Default::default() });

        let seen = recorder.0.borrow();
        assert_eq!(seen.first(), Some(&Notification::StartRequest));
        assert!(matches!(seen.last(), Some(Notification::StopRequest(Err(ImageError::Load(LoadError::HttpStatus { status: 404, .. }))))));
        assert!(loader.content_cache().is_empty());
        assert_eq!(loader.uncached_count(), 1);
    }

    #[test]
    fn non_image_content_is_rejected() {
        assert!(is_image_content_type("image/png"));
        assert!(is_image_content_type("image/x-unknown; q=1"));
        assert!(is_image_content_type("application/octet-stream"));
        assert!(!is_image_content_type("text/html"));

        let transport = Rc::new(FakeTransport::default());
        let mut loader = loader(&transport, 1 << 20);
        let (recorder, obs) = observer();
        loader.load_image(LoadRequest::new("https://a.test/page"), obs).expect("load");
        loader.on_start_request(ChannelId::new(1), ResponseInfo::ok("text/html"));

        let expected = ImageError::Load(LoadError::UnsupportedType { content_type: Some("text/html".into()) });
        assert_eq!(recorder.0.borrow().last(), Some(&Notification::StopRequest(Err(expected))));
        assert!(loader.content_cache().is_empty());
    }

    #[test]
    fn blocked_loads_never_reach_the_transport() {
        #[derive(Debug)]
        struct DenyAll;
        impl SecurityChecker for DenyAll {
            fn check_load(&self, _: &str, _: Option<&Principal>, _: CorsMode, _: PolicyType) -> PolicyDecision {
                PolicyDecision::Reject
            }
        }

        let transport = Rc::new(FakeTransport::default());
        let mut loader = loader(&transport, 1 << 20);
        loader.env.security = Rc::new(DenyAll);
        let (_, obs) = observer();
        let result = loader.load_image(LoadRequest::new("https://a.test/x.png"), obs);
        assert!(matches!(result, Err(LoadError::Blocked { .. })));
        assert!(transport.opened.borrow().is_empty());
    }

    #[test]
    fn locks_follow_the_proxy() {
        let transport = Rc::new(FakeTransport::default());
        let mut loader = loader(&transport, 1 << 20);
        let (_, obs) = observer();
        let proxy = loader.load_image(LoadRequest::new("https://a.test/x.png"), obs).expect("load");
        loader.lock_image(proxy).expect("lock");
        loader.lock_image(proxy).expect("lock");
        assert_eq!(loader.request_of(proxy).map(|r| r.image().lock_count()), Some(2));
        loader.unlock_image(proxy).expect("unlock");
        assert_eq!(loader.request_of(proxy).map(|r| r.image().lock_count()), Some(1));
    }
}
