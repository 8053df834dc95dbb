//! The network seam. The loader asks a [`Transport`] to open channels; the embedder reports what
//! happens on them back through `ImageLoader::on_start_request` and friends.

use std::fmt::Debug;

use bitflags::bitflags;

use crate::cache::{CacheKey, IsolationAttributes};
use crate::error::LoadError;
use crate::types::{ChannelId, DocumentId, LoadContextId};

use super::security::{CorsMode, Principal, PolicyType, ReferrerPolicy};

bitflags! {
    /// Cache behaviour requested for a load.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LoadFlags: u32 {
        /// Ignore cached requests and fetch from the network.
        const BYPASS_CACHE = 1 << 0;
        /// Revalidate a cached request even if it has not expired.
        const VALIDATE_ALWAYS = 1 << 1;
        /// Reuse expired requests without revalidating.
        const VALIDATE_NEVER = 1 << 2;
        const VALIDATE_ONCE_PER_SESSION = 1 << 3;
        /// Prefer stale cached data over the network.
        const FROM_CACHE = 1 << 4;
    }
}

/// What a consumer asks the loader for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub uri: String,
    pub attrs: IsolationAttributes,
    pub load_flags: LoadFlags,
    pub triggering_principal: Option<Principal>,
    pub cors: CorsMode,
    pub referrer_policy: ReferrerPolicy,
    pub policy_type: PolicyType,
    /// The loading context a cached request was last validated for.
    pub load_context: Option<LoadContextId>,
    pub inner_window: Option<u64>,
    pub controlling_document: Option<DocumentId>,
    pub app_cache: Option<u64>,
}

impl LoadRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            attrs: IsolationAttributes::default(),
            load_flags: LoadFlags::empty(),
            triggering_principal: None,
            cors: CorsMode::None,
            referrer_policy: ReferrerPolicy::Default,
            policy_type: PolicyType::Image,
            load_context: None,
            inner_window: None,
            controlling_document: None,
            app_cache: None,
        }
    }

    pub fn with_flags(mut self, flags: LoadFlags) -> Self {
        self.load_flags = flags;
        self
    }

    pub fn with_attrs(mut self, attrs: IsolationAttributes) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.triggering_principal = Some(principal);
        self
    }

    pub fn with_cors(mut self, cors: CorsMode) -> Self {
        self.cors = cors;
        self
    }

    pub fn with_referrer_policy(mut self, policy: ReferrerPolicy) -> Self {
        self.referrer_policy = policy;
        self
    }

    pub fn with_policy_type(mut self, policy: PolicyType) -> Self {
        self.policy_type = policy;
        self
    }

    pub fn with_load_context(mut self, context: LoadContextId) -> Self {
        self.load_context = Some(context);
        self
    }

    pub fn with_inner_window(mut self, window: u64) -> Self {
        self.inner_window = Some(window);
        self
    }

    pub fn with_controlling_document(mut self, document: DocumentId) -> Self {
        self.controlling_document = Some(document);
        self
    }

    pub fn with_app_cache(mut self, app_cache: u64) -> Self {
        self.app_cache = Some(app_cache);
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.uri.clone(), self.attrs.clone())
            .with_controlling_document(self.controlling_document)
    }
}

/// Parameters of a channel the loader wants opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub uri: String,
    pub load_flags: LoadFlags,
    /// A conditional request revalidating a cached response.
    pub conditional: bool,
    pub triggering_principal: Option<Principal>,
    pub cors: CorsMode,
    pub referrer_policy: ReferrerPolicy,
    /// Partition the transport's own cache the same way as the request cache.
    pub private_browsing: bool,
}

impl ChannelRequest {
    pub(crate) fn for_load(load: &LoadRequest, conditional: bool) -> Self {
        Self {
            uri: load.uri.clone(),
            load_flags: load.load_flags,
            conditional,
            triggering_principal: load.triggering_principal.clone(),
            cors: load.cors,
            referrer_policy: load.referrer_policy,
            private_browsing: load.attrs.is_private(),
        }
    }
}

/// Response headers the loader cares about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseInfo {
    /// HTTP status; 0 for non-HTTP channels.
    pub status: u16,
    /// Location after redirects, if it differs from the requested URI.
    pub final_uri: Option<String>,
    /// Served from the transport's cache without touching the network.
    pub from_cache: bool,
    pub content_type: Option<String>,
    /// Absolute expiry in clock seconds.
    pub expiry: Option<u64>,
    pub must_validate: bool,
}

impl ResponseInfo {
    pub fn ok(content_type: impl Into<String>) -> Self {
        Self { status: 200, content_type: Some(content_type.into()), ..Default::default() }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0 || (200..300).contains(&self.status) || self.status == 304
    }
}

/// Network stack supplied by the embedder. Opening must not call back into the loader; events are
/// delivered later by the embedder.
pub trait Transport: Debug {
    fn open(&self, request: &ChannelRequest) -> Result<ChannelId, LoadError>;
    fn cancel(&self, channel: ChannelId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_carries_isolation_and_document() {
        let attrs = IsolationAttributes { user_context_id: 2, ..Default::default() };
        let load = LoadRequest::new("https://a.test/x.png")
            .with_attrs(attrs.clone())
            .with_controlling_document(DocumentId::new(7));
        let key = load.cache_key();
        assert_eq!(key.uri(), "https://a.test/x.png");
        assert_eq!(key.attrs(), &attrs);
        assert_eq!(key.controlling_document(), Some(DocumentId::new(7)));
    }

    #[test]
    fn success_statuses() {
        assert!(ResponseInfo::ok("image/png").is_success());
        assert!(ResponseInfo { status: 304, ..Default::default() }.is_success());
        assert!(ResponseInfo::default().is_success());
        assert!(!ResponseInfo { status: 404, ..Default::default() }.is_success());
    }

    #[test]
    fn private_loads_mark_channel_private() {
        let attrs = IsolationAttributes { private_browsing_id: 1, ..Default::default() };
        let channel = ChannelRequest::for_load(&LoadRequest::new("https://a.test/").with_attrs(attrs), true);
        assert!(channel.private_browsing);
        assert!(channel.conditional);
    }
}
