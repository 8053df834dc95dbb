//! The shared load behind every proxy of one cache key.

use bitflags::bitflags;

use crate::cache::CacheKey;
use crate::error::ImageError;
use crate::image::{Image, ImageEvent};
use crate::types::{ChannelId, LoadContextId, ProxyId, Rect, RequestId, Size};

use super::security::{CorsMode, PolicyType, Principal, ReferrerPolicy};
use super::transport::LoadRequest;
use super::validator::CacheValidator;

bitflags! {
    /// Milestones a request has reached. Each proxy keeps the subset it has been told about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Progress: u32 {
        const LOAD_STARTED = 1 << 0;
        const SIZE_AVAILABLE = 1 << 1;
        const IS_ANIMATED = 1 << 2;
        const HAS_TRANSPARENCY = 1 << 3;
        const FRAME_COMPLETE = 1 << 4;
        const DECODE_COMPLETE = 1 << 5;
        const LOAD_COMPLETE = 1 << 6;
        const HAS_ERROR = 1 << 7;
    }
}

/// Final status of a network load.
pub type LoadStatus = Result<(), ImageError>;

/// Event delivered to an [`super::ImageObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    StartRequest,
    SizeAvailable(Size),
    IsAnimated,
    HasTransparency,
    FrameUpdate(Rect),
    FrameComplete,
    DecodeComplete,
    Discard,
    Error(ImageError),
    StopRequest(LoadStatus),
}

impl Notification {
    /// The milestone this notification announces, if it is one.
    pub fn progress(&self) -> Option<Progress> {
        match self {
            Notification::StartRequest => Some(Progress::LOAD_STARTED),
            Notification::SizeAvailable(_) => Some(Progress::SIZE_AVAILABLE),
            Notification::IsAnimated => Some(Progress::IS_ANIMATED),
            Notification::HasTransparency => Some(Progress::HAS_TRANSPARENCY),
            Notification::FrameComplete => Some(Progress::FRAME_COMPLETE),
            Notification::DecodeComplete => Some(Progress::DECODE_COMPLETE),
            Notification::Error(_) => Some(Progress::HAS_ERROR),
            Notification::StopRequest(_) => Some(Progress::LOAD_COMPLETE),
            Notification::FrameUpdate(_) | Notification::Discard => None,
        }
    }
}

impl From<ImageEvent> for Notification {
    fn from(event: ImageEvent) -> Self {
        match event {
            ImageEvent::SizeAvailable(size) => Notification::SizeAvailable(size),
            ImageEvent::IsAnimated => Notification::IsAnimated,
            ImageEvent::HasTransparency => Notification::HasTransparency,
            ImageEvent::FrameUpdate(rect) => Notification::FrameUpdate(rect),
            ImageEvent::FrameComplete => Notification::FrameComplete,
            ImageEvent::DecodeComplete => Notification::DecodeComplete,
            ImageEvent::Discard => Notification::Discard,
            ImageEvent::Error(err) => Notification::Error(err),
        }
    }
}

/// Decoded pixels are gone after a discard; these milestones must be announced again.
pub(crate) const DECODE_PROGRESS: Progress = Progress::FRAME_COMPLETE.union(Progress::DECODE_COMPLETE);

/// Security context a request was created with. Reuse requires a matching context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityInfo {
    pub triggering_principal: Option<Principal>,
    pub cors: CorsMode,
    pub referrer_policy: ReferrerPolicy,
    pub policy_type: PolicyType,
    pub had_insecure_redirect: bool,
    pub app_cache: Option<u64>,
}

impl SecurityInfo {
    pub(crate) fn from_load(load: &LoadRequest) -> Self {
        Self {
            triggering_principal: load.triggering_principal.clone(),
            cors: load.cors,
            referrer_policy: load.referrer_policy,
            policy_type: load.policy_type,
            had_insecure_redirect: false,
            app_cache: load.app_cache,
        }
    }
}

#[derive(Debug)]
pub struct ImageRequest {
    pub(crate) id: RequestId,
    pub(crate) key: CacheKey,
    pub(crate) uri: String,
    pub(crate) final_uri: String,
    /// Attached proxies in attach order.
    pub(crate) proxies: Vec<ProxyId>,
    pub(crate) validator: Option<CacheValidator>,
    pub(crate) is_in_cache: bool,
    pub(crate) progress: Progress,
    pub(crate) status: Option<LoadStatus>,
    pub(crate) error: Option<ImageError>,
    pub(crate) security: SecurityInfo,
    pub(crate) load_context: Option<LoadContextId>,
    pub(crate) inner_window: Option<u64>,
    pub(crate) channel: Option<ChannelId>,
    pub(crate) content_type: Option<String>,
    pub(crate) image: Image,
}

impl ImageRequest {
    pub(crate) fn new(id: RequestId, key: CacheKey, load: &LoadRequest, image: Image) -> Self {
        Self {
            id,
            uri: key.uri().to_string(),
            final_uri: key.uri().to_string(),
            key,
            proxies: Vec::new(),
            validator: None,
            is_in_cache: false,
            progress: Progress::empty(),
            status: None,
            error: None,
            security: SecurityInfo::from_load(load),
            load_context: load.load_context,
            inner_window: load.inner_window,
            channel: None,
            content_type: None,
            image,
        }
    }

    /// A request taking over from `previous` after a revalidation brought a fresh response.
    pub(crate) fn succeeding(
        previous: &ImageRequest,
        id: RequestId,
        image: Image,
        load_context: Option<LoadContextId>,
        inner_window: Option<u64>,
    ) -> Self {
        Self {
            id,
            key: previous.key.clone(),
            uri: previous.uri.clone(),
            final_uri: previous.uri.clone(),
            proxies: Vec::new(),
            validator: None,
            is_in_cache: false,
            progress: Progress::empty(),
            status: None,
            error: None,
            security: SecurityInfo { had_insecure_redirect: false, ..previous.security.clone() },
            load_context,
            inner_window,
            channel: None,
            content_type: None,
            image,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn final_uri(&self) -> &str {
        &self.final_uri
    }

    pub fn proxies(&self) -> &[ProxyId] {
        &self.proxies
    }

    pub fn is_in_cache(&self) -> bool {
        self.is_in_cache
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn security(&self) -> &SecurityInfo {
        &self.security
    }

    pub fn load_context(&self) -> Option<LoadContextId> {
        self.load_context
    }

    pub fn inner_window(&self) -> Option<u64> {
        self.inner_window
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn is_validating(&self) -> bool {
        self.validator.is_some()
    }

    /// The network load is still running.
    pub fn is_loading(&self) -> bool {
        !self.progress.contains(Progress::LOAD_COMPLETE)
    }

    /// Record `notification` against the request's own progress. Returns `false` for a milestone
    /// that was already reached, which must not be broadcast again.
    pub(crate) fn record(&mut self, notification: &Notification) -> bool {
        match notification {
            Notification::Discard => {
                self.progress.remove(DECODE_PROGRESS);
                true
            }
            Notification::Error(err) => {
                if self.progress.contains(Progress::HAS_ERROR) {
                    return false;
                }
                self.progress.insert(Progress::HAS_ERROR);
                self.error = Some(err.clone());
                true
            }
            Notification::StopRequest(status) => {
                if self.progress.contains(Progress::LOAD_COMPLETE) {
                    return false;
                }
                self.progress.insert(Progress::LOAD_COMPLETE);
                self.status = Some(status.clone());
                true
            }
            other => match other.progress() {
                Some(bit) if self.progress.contains(bit) => false,
                Some(bit) => {
                    self.progress.insert(bit);
                    true
                }
                None => true,
            },
        }
    }

    /// Notifications that bring an observer who has seen `observed` up to date, in the order a
    /// live observer would have received them.
    pub(crate) fn replay(&self, observed: Progress) -> Vec<Notification> {
        let missing = self.progress.difference(observed);
        let mut out = Vec::new();
        if missing.contains(Progress::LOAD_STARTED) {
            out.push(Notification::StartRequest);
        }
        if missing.contains(Progress::SIZE_AVAILABLE) {
            if let Some(size) = self.image.size() {
                out.push(Notification::SizeAvailable(size));
            }
        }
        if missing.contains(Progress::IS_ANIMATED) {
            out.push(Notification::IsAnimated);
        }
        if missing.contains(Progress::HAS_TRANSPARENCY) {
            out.push(Notification::HasTransparency);
        }
        if missing.contains(Progress::HAS_ERROR) {
            if let Some(err) = &self.error {
                out.push(Notification::Error(err.clone()));
            }
        }
        if missing.contains(Progress::LOAD_COMPLETE) {
            out.push(Notification::StopRequest(self.status.clone().unwrap_or(Ok(()))));
        }
        if missing.contains(Progress::FRAME_COMPLETE) {
            let rect = self.image.size().map(Rect::from_size).unwrap_or_default();
            out.push(Notification::FrameUpdate(rect));
            out.push(Notification::FrameComplete);
        }
        if missing.contains(Progress::DECODE_COMPLETE) {
            out.push(Notification::DecodeComplete);
        }
        out
    }
}
