//! Per-consumer handles onto a shared request.

use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::types::{ProxyId, RequestId};

use super::request::{DECODE_PROGRESS, Notification, Progress};
use super::transport::LoadFlags;

/// Receives the notifications of one proxy. Called on the loader's thread while the loader is
/// borrowed, so implementations must not call back into the loader.
pub trait ImageObserver {
    fn notify(&self, proxy: ProxyId, notification: &Notification);
}

pub struct RequestProxy {
    pub(crate) id: ProxyId,
    observer: Rc<dyn ImageObserver>,
    pub(crate) load_flags: LoadFlags,
    pub(crate) owner: RequestId,
    /// Parked on a cache validator.
    pub(crate) validating: bool,
    /// Notifications are withheld until released; replay catches up afterwards.
    pub(crate) deferred: bool,
    pub(crate) observed: Progress,
    pub(crate) lock_count: u32,
    pub(crate) cancelled: bool,
}

impl fmt::Debug for RequestProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestProxy")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("validating", &self.validating)
            .field("deferred", &self.deferred)
            .field("observed", &self.observed)
            .field("lock_count", &self.lock_count)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

impl RequestProxy {
    pub(crate) fn new(id: ProxyId, owner: RequestId, observer: Rc<dyn ImageObserver>, load_flags: LoadFlags) -> Self {
        Self {
            id,
            observer,
            load_flags,
            owner,
            validating: false,
            deferred: false,
            observed: Progress::empty(),
            lock_count: 0,
            cancelled: false,
        }
    }

    pub fn id(&self) -> ProxyId {
        self.id
    }

    pub fn owner(&self) -> RequestId {
        self.owner
    }

    pub fn is_validating(&self) -> bool {
        self.validating
    }

    pub fn observed(&self) -> Progress {
        self.observed
    }

    /// Park on a validator: stay attached but hear nothing until released.
    pub(crate) fn mark_validating(&mut self) {
        self.validating = true;
        self.deferred = true;
    }

    pub(crate) fn clear_validating(&mut self) {
        self.validating = false;
        self.deferred = false;
    }

    /// Move to `owner`. The new request has its own milestones, so nothing counts as seen.
    pub(crate) fn change_owner(&mut self, owner: RequestId) {
        trace!(target: "imgcache::loader", proxy = %self.id, from = %self.owner, to = %owner, "proxy migrated");
        self.owner = owner;
        self.observed = Progress::empty();
    }

    /// Deliver `notification` unless withheld or already seen.
    pub(crate) fn deliver(&mut self, notification: &Notification) {
        if self.deferred || self.cancelled {
            return;
        }
        if let Some(bit) = notification.progress() {
            if self.observed.contains(bit) {
                return;
            }
            self.observed.insert(bit);
        }
        if matches!(notification, Notification::Discard) {
            self.observed.remove(DECODE_PROGRESS);
        }
        self.observer.notify(self.id, notification);
    }
}
