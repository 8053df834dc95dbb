//! Bookkeeping for one cached request.

use crate::types::{EntryId, RequestId};

/// Metadata the request cache keeps for a request it owns.
///
/// An entry starts life evicted and proxy-less; [`super::RequestCache::put`] makes it live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    id: EntryId,
    request: RequestId,
    pub(crate) data_size: u64,
    /// Last time the entry was handed out, in clock seconds.
    pub(crate) touched_time: u64,
    pub(crate) load_time: u64,
    /// `0` when the response carried no expiry.
    pub(crate) expiry_time: u64,
    pub(crate) must_validate: bool,
    /// Set for schemes that inherit the loader's principal; such entries only serve loads made
    /// for exactly the principal they were loaded for.
    pub(crate) force_principal_check: bool,
    /// Where the load ended up after redirects, once response headers arrived.
    pub(crate) final_uri: Option<String>,
    pub(crate) evicted: bool,
    pub(crate) has_no_proxies: bool,
}

impl CacheEntry {
    pub fn new(id: EntryId, request: RequestId, now: u64) -> Self {
        Self {
            id,
            request,
            data_size: 0,
            touched_time: now,
            load_time: now,
            expiry_time: 0,
            must_validate: false,
            force_principal_check: false,
            final_uri: None,
            evicted: true,
            has_no_proxies: true,
        }
    }

    pub fn with_data_size(mut self, size: u64) -> Self {
        self.data_size = size;
        self
    }

    pub fn with_force_principal_check(mut self, value: bool) -> Self {
        self.force_principal_check = value;
        self
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn touched_time(&self) -> u64 {
        self.touched_time
    }

    pub fn load_time(&self) -> u64 {
        self.load_time
    }

    pub fn expiry_time(&self) -> u64 {
        self.expiry_time
    }

    pub fn set_expiry_time(&mut self, secs: u64) {
        self.expiry_time = secs;
    }

    pub fn must_validate(&self) -> bool {
        self.must_validate
    }

    pub fn set_must_validate(&mut self, value: bool) {
        self.must_validate = value;
    }

    pub fn force_principal_check(&self) -> bool {
        self.force_principal_check
    }

    pub fn set_force_principal_check(&mut self, value: bool) {
        self.force_principal_check = value;
    }

    pub fn final_uri(&self) -> Option<&str> {
        self.final_uri.as_deref()
    }

    pub fn set_final_uri(&mut self, uri: impl Into<String>) {
        self.final_uri = Some(uri.into());
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub fn has_no_proxies(&self) -> bool {
        self.has_no_proxies
    }

    /// True once `now` has passed a known expiry time.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry_time != 0 && self.expiry_time <= now
    }
}
