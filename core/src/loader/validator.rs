//! Cache revalidation: deciding whether a cached request can serve a new load, and the state of a
//! conditional load in flight.

use tracing::{debug, trace};

use crate::cache::CacheEntry;
use crate::cache::key::scheme_of;
use crate::error::ValidationError;
use crate::types::{ChannelId, LoadContextId, ProxyId, RequestId};

use super::request::ImageRequest;
use super::security::{PolicyDecision, SecurityChecker};
use super::transport::{LoadFlags, LoadRequest};

/// Verdict of [`validate_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(ValidationError),
    NeedsRevalidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorState {
    NotStarted,
    AwaitingResponse,
    /// The transport answered from its cache at the same location; the old request stands.
    Reused,
    /// A fresh response arrived; parked proxies moved to a new request.
    Migrated,
    Failed,
}

/// Conditional load in flight for one cached request, with the proxies waiting on its answer.
#[derive(Debug)]
pub struct CacheValidator {
    state: ValidatorState,
    request: RequestId,
    channel: Option<ChannelId>,
    parked: Vec<ProxyId>,
    /// Loading context of the load that started the revalidation; the surviving request is
    /// validated for it.
    load_context: Option<LoadContextId>,
    inner_window: Option<u64>,
    /// Last redirect target seen on the conditional load.
    redirected_to: Option<String>,
    had_insecure_redirect: bool,
}

impl CacheValidator {
    pub fn new(request: RequestId, load: &LoadRequest) -> Self {
        Self {
            state: ValidatorState::NotStarted,
            request,
            channel: None,
            parked: Vec::new(),
            load_context: load.load_context,
            inner_window: load.inner_window,
            redirected_to: None,
            had_insecure_redirect: false,
        }
    }

    pub fn state(&self) -> ValidatorState {
        self.state
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn parked(&self) -> &[ProxyId] {
        &self.parked
    }

    pub fn load_context(&self) -> Option<LoadContextId> {
        self.load_context
    }

    pub fn inner_window(&self) -> Option<u64> {
        self.inner_window
    }

    pub fn redirected_to(&self) -> Option<&str> {
        self.redirected_to.as_deref()
    }

    pub fn had_insecure_redirect(&self) -> bool {
        self.had_insecure_redirect
    }

    pub(crate) fn redirected(&mut self, uri: &str, secure: bool) {
        trace!(target: "imgcache::loader", request = %self.request, %uri, secure, "revalidation redirected");
        self.redirected_to = Some(uri.to_string());
        self.had_insecure_redirect |= !secure;
    }

    pub(crate) fn start(&mut self, channel: ChannelId) {
        self.channel = Some(channel);
        self.state = ValidatorState::AwaitingResponse;
    }

    pub(crate) fn park(&mut self, proxy: ProxyId) {
        if !self.parked.contains(&proxy) {
            self.parked.push(proxy);
        }
    }

    pub(crate) fn unpark(&mut self, proxy: ProxyId) -> bool {
        let before = self.parked.len();
        self.parked.retain(|parked| *parked != proxy);
        self.parked.len() != before
    }

    /// Decide the outcome of the first response.
    pub(crate) fn resolve(&mut self, from_cache: bool, response_uri: &str, final_uri: &str) -> ValidatorState {
        self.state = if from_cache && response_uri == final_uri {
            ValidatorState::Reused
        } else {
            ValidatorState::Migrated
        };
        debug!(target: "imgcache::loader", request = %self.request, state = ?self.state, "revalidation answered");
        self.state
    }

    pub(crate) fn fail(&mut self) {
        self.state = ValidatorState::Failed;
    }

    pub(crate) fn take_parked(&mut self) -> Vec<ProxyId> {
        std::mem::take(&mut self.parked)
    }
}

/// Whether a reusable entry must be revalidated before serving a load with `flags`.
pub fn should_revalidate(entry: &CacheEntry, flags: LoadFlags, expired: bool) -> bool {
    if flags.contains(LoadFlags::BYPASS_CACHE) {
        return false;
    }
    if flags.contains(LoadFlags::VALIDATE_ALWAYS) || entry.must_validate() {
        return true;
    }
    if !expired {
        return false;
    }
    // Stale entries are fine for these loads unless explicitly marked otherwise.
    if flags.intersects(LoadFlags::VALIDATE_NEVER | LoadFlags::VALIDATE_ONCE_PER_SESSION) {
        return false;
    }
    !flags.contains(LoadFlags::FROM_CACHE)
}

/// Decide whether `request`, found in the cache through `entry`, can serve `load`.
pub fn validate_entry(
    entry: &CacheEntry,
    request: &ImageRequest,
    load: &LoadRequest,
    checker: &dyn SecurityChecker,
    now: u64,
) -> Validation {
    if let Err(err) = validate_security(entry, request, load, checker) {
        trace!(target: "imgcache::loader", uri = %load.uri, "cached request rejected: {err}");
        return Validation::Invalid(err);
    }

    // data: URIs are immutable.
    if scheme_of(&load.uri) == "data" && !load.load_flags.contains(LoadFlags::BYPASS_CACHE) {
        return Validation::Valid;
    }

    let mut revalidate = false;
    if request.load_context() != load.load_context || request.inner_window() != load.inner_window {
        if load.load_flags.contains(LoadFlags::BYPASS_CACHE) {
            return Validation::Invalid(ValidationError::BypassCache);
        }
        revalidate = should_revalidate(entry, load.load_flags, entry.is_expired(now));
    }

    if request.security().app_cache != load.app_cache {
        return Validation::Invalid(ValidationError::AppCacheMismatch);
    }

    if revalidate { Validation::NeedsRevalidation } else { Validation::Valid }
}

fn validate_security(
    entry: &CacheEntry,
    request: &ImageRequest,
    load: &LoadRequest,
    checker: &dyn SecurityChecker,
) -> Result<(), ValidationError> {
    let security = request.security();
    if security.referrer_policy != load.referrer_policy {
        return Err(ValidationError::ReferrerPolicyMismatch);
    }
    if security.cors != load.cors {
        return Err(ValidationError::CorsMismatch);
    }
    // A request made for a principal may not be handed to a load without one. A request made
    // without a principal may be shared, unless its entry pins the principal exactly.
    let principal_mismatch = match &security.triggering_principal {
        Some(cached) => load.triggering_principal.as_ref() != Some(cached),
        None => entry.force_principal_check() && load.triggering_principal.is_some(),
    };
    if principal_mismatch {
        return Err(ValidationError::PrincipalMismatch);
    }

    // The key is the first URI of a redirect chain; re-check where it actually ended up.
    let final_uri = request.final_uri();
    let decision =
        checker.check_load(final_uri, load.triggering_principal.as_ref(), load.cors, load.policy_type);
    let insecure_for_secure_load =
        security.had_insecure_redirect && scheme_of(&load.uri) == "https";
    if decision == PolicyDecision::Reject || insecure_for_secure_load {
        return Err(ValidationError::ContentPolicy { uri: final_uri.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryId;

    fn entry() -> CacheEntry {
        CacheEntry::new(EntryId::new(1), RequestId::new(1), 100)
    }

    #[test]
    fn bypass_never_revalidates() {
        let mut entry = entry();
        entry.set_must_validate(true);
        assert!(!should_revalidate(&entry, LoadFlags::BYPASS_CACHE, true));
    }

    #[test]
    fn must_validate_and_validate_always_force_revalidation() {
        let mut entry = entry();
        assert!(should_revalidate(&entry, LoadFlags::VALIDATE_ALWAYS, false));
        entry.set_must_validate(true);
        assert!(should_revalidate(&entry, LoadFlags::VALIDATE_NEVER, false));
    }

    #[test]
    fn expired_entries_depend_on_flags() {
        let entry = entry();
        assert!(should_revalidate(&entry, LoadFlags::empty(), true));
        assert!(!should_revalidate(&entry, LoadFlags::VALIDATE_NEVER, true));
        assert!(!should_revalidate(&entry, LoadFlags::VALIDATE_ONCE_PER_SESSION, true));
        assert!(!should_revalidate(&entry, LoadFlags::FROM_CACHE, true));
        assert!(!should_revalidate(&entry, LoadFlags::empty(), false));
    }

    #[test]
    fn validator_resolution() {
        let load = LoadRequest::new("https://a.test/x.png");
        let mut validator = CacheValidator::new(RequestId::new(3), &load);
        assert_eq!(validator.state(), ValidatorState::NotStarted);
        validator.start(ChannelId::new(9));
        validator.park(ProxyId::new(1));
        validator.park(ProxyId::new(1));
        validator.park(ProxyId::new(2));
        assert_eq!(validator.parked(), &[ProxyId::new(1), ProxyId::new(2)]);
        assert!(validator.unpark(ProxyId::new(2)));

        let uri = "https://a.test/x.png";
        assert_eq!(validator.resolve(true, uri, uri), ValidatorState::Reused);
        assert_eq!(validator.resolve(false, uri, uri), ValidatorState::Migrated);
        assert_eq!(validator.resolve(true, "https://b.test/x.png", uri), ValidatorState::Migrated);
        assert_eq!(validator.take_parked(), vec![ProxyId::new(1)]);
    }

    #[test]
    fn validator_remembers_redirects() {
        let load = LoadRequest::new("https://a.test/x.png");
        let mut validator = CacheValidator::new(RequestId::new(3), &load);
        assert_eq!(validator.redirected_to(), None);
        validator.redirected("https://cdn.test/x.png", true);
        assert!(!validator.had_insecure_redirect());
        validator.redirected("http://mirror.test/x.png", false);
        validator.redirected("https://cdn.test/x.png", true);
        assert_eq!(validator.redirected_to(), Some("https://cdn.test/x.png"));
        assert!(validator.had_insecure_redirect());
    }
}
