//! Security inputs of a load and the embedder's content-policy hook.

use std::fmt;

use url::{Origin, Url};

use crate::cache::key::scheme_of;

/// Who triggered a load. Compared by value when deciding whether a cached request may be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    /// Privileged browser code.
    System,
    /// A web origin such as `https://example.com`.
    Origin(String),
}

impl Principal {
    pub fn origin(origin: impl Into<String>) -> Self {
        Principal::Origin(origin.into())
    }

    /// True if `uri` belongs to this principal's origin. The system principal owns nothing.
    pub fn owns_uri(&self, uri: &str) -> bool {
        match self {
            Principal::System => false,
            Principal::Origin(origin) => match (origin_of(origin), origin_of(uri)) {
                (Some(own), Some(candidate)) => own == candidate,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::System => f.write_str("[System Principal]"),
            Principal::Origin(origin) => f.write_str(origin),
        }
    }
}

/// Scheme, host and port of `uri`, with default ports normalised away. `None` for URIs without
/// a tuple origin such as `data:`.
pub(crate) fn origin_of(uri: &str) -> Option<Origin> {
    let origin = Url::parse(uri).ok()?.origin();
    origin.is_tuple().then_some(origin)
}

/// Schemes whose documents take the principal of whoever loaded them. A cached request for one of
/// these, made without a principal, cannot vouch for who it was loaded for.
pub fn inherits_principal(uri: &str) -> bool {
    matches!(scheme_of(uri).as_str(), "data" | "blob" | "about" | "javascript")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CorsMode {
    #[default]
    None,
    Anonymous,
    UseCredentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReferrerPolicy {
    #[default]
    Default,
    NoReferrer,
    NoReferrerWhenDowngrade,
    Origin,
    OriginWhenCrossOrigin,
    SameOrigin,
    StrictOrigin,
    StrictOriginWhenCrossOrigin,
    UnsafeUrl,
}

/// What kind of load the content policy is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolicyType {
    #[default]
    Image,
    Favicon,
    /// Images loaded by the browser itself, such as theme resources.
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Accept,
    Reject,
}

/// Content-policy hook supplied by the embedder. Consulted for new loads, redirect targets and
/// the final location of cached requests.
pub trait SecurityChecker: fmt::Debug {
    fn check_load(
        &self,
        uri: &str,
        principal: Option<&Principal>,
        cors: CorsMode,
        policy: PolicyType,
    ) -> PolicyDecision;
}

/// Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl SecurityChecker for AllowAll {
    fn check_load(&self, _: &str, _: Option<&Principal>, _: CorsMode, _: PolicyType) -> PolicyDecision {
        PolicyDecision::Accept
    }
}
