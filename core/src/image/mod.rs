//! Decode orchestration for a single image.
//!
//! An [`Image`] owns the source bytes of one request and decides which surfaces to decode, when
//! to decode them inline and how to recover from decoder failures. It never touches proxies; the
//! owning request turns the [`ImageEvent`]s returned here into observer notifications.

mod animation;
mod flags;

use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::decode::codec::{self, DecoderKind, ImageMetadata};
use crate::decode::{DecodeOutcome, DecodePool, DecodeTask, DecodeTelemetry, Schedule};
use crate::error::{DecodeError, ImageError};
use crate::stats::TelemetrySink;
use crate::surface::{LookupResult, PlaybackType, SubstituteReason, SurfaceCache, SurfaceKey};
use crate::types::{ImageId, Rect, Size, next_image_id};

pub use animation::AnimationState;
pub use flags::{DecodeFlags, DrawOutcome, FrameSelection, ImgDrawResult};

/// State change of an image that observers may care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageEvent {
    SizeAvailable(Size),
    IsAnimated,
    HasTransparency,
    FrameUpdate(Rect),
    FrameComplete,
    DecodeComplete,
    Discard,
    Error(ImageError),
}

/// Shared services every image decodes through.
#[derive(Debug, Clone)]
pub struct DecodeContext {
    pub surfaces: Arc<SurfaceCache>,
    pub pool: Arc<DecodePool>,
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Completion channel of the owning loader.
    pub completion: Sender<DecodeOutcome>,
}

#[derive(Debug)]
pub struct Image {
    id: ImageId,
    kind: Option<DecoderKind>,
    buffer: Vec<u8>,
    /// Source bytes, frozen once the load completes.
    source: Option<Arc<[u8]>>,
    metadata: Option<ImageMetadata>,
    has_been_decoded: bool,
    want_full_decode: bool,
    retried: bool,
    error: Option<ImageError>,
    lock_count: u32,
    animation: Option<AnimationState>,
    last_decode: Option<DecodeTelemetry>,
    ctx: DecodeContext,
}

impl Image {
    pub fn new(ctx: DecodeContext, kind: Option<DecoderKind>) -> Self {
        let id = next_image_id();
        trace!(target: "imgcache::image", image = %id, ?kind, "image created");
        Self {
            id,
            kind,
            buffer: Vec::new(),
            source: None,
            metadata: None,
            has_been_decoded: false,
            want_full_decode: false,
            retried: false,
            error: None,
            lock_count: 0,
            animation: None,
            last_decode: None,
            ctx,
        }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn kind(&self) -> Option<DecoderKind> {
        self.kind
    }

    /// Intrinsic size, once the header has been read.
    pub fn size(&self) -> Option<Size> {
        self.metadata.map(|meta| meta.size)
    }

    pub fn is_animated(&self) -> bool {
        self.metadata.is_some_and(|meta| meta.animated)
    }

    pub fn has_alpha(&self) -> bool {
        self.metadata.is_some_and(|meta| meta.has_alpha)
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&ImageError> {
        self.error.as_ref()
    }

    pub fn all_source_data(&self) -> bool {
        self.source.is_some()
    }

    pub fn source_len(&self) -> usize {
        match &self.source {
            Some(source) => source.len(),
            None => self.buffer.len(),
        }
    }

    pub fn has_been_decoded(&self) -> bool {
        self.has_been_decoded
    }

    pub fn wants_full_decode(&self) -> bool {
        self.want_full_decode
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub fn animation(&self) -> Option<&AnimationState> {
        self.animation.as_ref()
    }

    pub fn last_decode(&self) -> Option<DecodeTelemetry> {
        self.last_decode
    }

    /// Pick a decoder from the response's content type when none was chosen yet.
    pub fn set_content_type(&mut self, content_type: &str) {
        if self.kind.is_none() {
            self.kind = DecoderKind::from_mime(content_type);
        }
    }

    /// Append source bytes and read the header as soon as enough has arrived.
    pub fn on_source_data(&mut self, bytes: &[u8]) -> Vec<ImageEvent> {
        if self.error.is_some() || self.source.is_some() {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);
        if self.metadata.is_some() {
            return Vec::new();
        }
        if self.kind.is_none() {
            self.kind = DecoderKind::sniff(&self.buffer);
        }
        let Some(kind) = self.kind else {
            return Vec::new();
        };
        match codec::read_metadata(kind, &self.buffer) {
            Ok(meta) => self.apply_metadata(meta),
            Err(_) => Vec::new(),
        }
    }

    /// The load finished. Freeze the source, settle metadata and run any decode that was asked
    /// for before the data was complete.
    pub fn on_source_complete(&mut self, status: Result<(), ImageError>) -> Vec<ImageEvent> {
        if self.error.is_some() {
            return Vec::new();
        }
        if let Err(err) = status {
            return self.do_error(err);
        }
        let source: Arc<[u8]> = Arc::from(std::mem::take(&mut self.buffer));
        self.source = Some(Arc::clone(&source));

        if self.kind.is_none() {
            self.kind = DecoderKind::sniff(&source);
        }
        let Some(kind) = self.kind else {
            let err = if source.is_empty() { DecodeError::EmptySource } else { DecodeError::UnsupportedFormat };
            return self.do_error(err.into());
        };
        // Animation may only become visible once every frame is present.
        let events = match codec::read_metadata(kind, &source) {
            Ok(meta) => self.apply_metadata(meta),
            Err(err) => return self.do_error(err.into()),
        };

        if self.want_full_decode {
            self.want_full_decode = false;
            if let Some(size) = self.size() {
                let playback = if self.is_animated() { PlaybackType::Animated } else { PlaybackType::Static };
                let key = SurfaceKey::new(size, DecodeFlags::empty().surface_flags(), playback);
                self.decode(key, DecodeFlags::empty());
            }
        }
        events
    }

    fn apply_metadata(&mut self, meta: ImageMetadata) -> Vec<ImageEvent> {
        let mut events = Vec::new();
        if let Some(known) = self.metadata.as_mut() {
            if meta.animated && !known.animated {
                known.animated = true;
                events.push(ImageEvent::IsAnimated);
            }
            return events;
        }
        events.push(ImageEvent::SizeAvailable(meta.size));
        if meta.animated {
            events.push(ImageEvent::IsAnimated);
        }
        if meta.has_alpha {
            events.push(ImageEvent::HasTransparency);
        }
        self.metadata = Some(meta);
        events
    }

    /// Size a decode for `requested` should produce.
    fn size_to_decode(&self, requested: Size, flags: DecodeFlags, playback: PlaybackType) -> Size {
        let Some(intrinsic) = self.size() else {
            return requested;
        };
        if self.can_downscale_during_decode(requested, intrinsic, flags, playback) {
            requested
        } else {
            intrinsic
        }
    }

    fn can_downscale_during_decode(
        &self,
        requested: Size,
        intrinsic: Size,
        flags: DecodeFlags,
        playback: PlaybackType,
    ) -> bool {
        self.ctx.surfaces.config().downscale_during_decode
            && flags.contains(DecodeFlags::HIGH_QUALITY_SCALING)
            && playback == PlaybackType::Static
            && !self.is_animated()
            && !requested.is_empty()
            && intrinsic.covers(requested)
            && requested != intrinsic
            && self.ctx.surfaces.can_hold(requested)
    }

    /// Find a surface for `size`, starting a decode when nothing suitable exists.
    pub fn lookup_frame(&mut self, size: Size, flags: DecodeFlags, playback: PlaybackType) -> LookupResult {
        if self.error.is_some() || size.is_empty() {
            return LookupResult::NotFound;
        }
        let key = SurfaceKey::new(self.size_to_decode(size, flags, playback), flags.surface_flags(), playback);
        let result = self.lookup_surface(&key, flags);

        let needs_decode = match &result {
            LookupResult::NotFound => true,
            LookupResult::Substitute { reason, .. } => {
                *reason == SubstituteReason::NotFound
                    && !flags.contains(DecodeFlags::AVOID_REDECODE_FOR_SIZE)
            }
            LookupResult::Pending => flags.contains(DecodeFlags::SYNC_DECODE),
            LookupResult::Found(_) => false,
        };
        if !needs_decode {
            return result;
        }

        if self.decode(key, flags) {
            // The surface (or a failure) is in place now; look again.
            return self.lookup_surface(&key, flags);
        }
        result
    }

    fn lookup_surface(&self, key: &SurfaceKey, flags: DecodeFlags) -> LookupResult {
        let exact_only = flags.contains(DecodeFlags::SYNC_DECODE)
            || !flags.contains(DecodeFlags::HIGH_QUALITY_SCALING);
        if exact_only {
            self.ctx.surfaces.lookup(self.id, key, true)
        } else {
            self.ctx.surfaces.lookup_best_match(self.id, key)
        }
    }

    /// Start a decode at `key`. Returns `true` if the work finished before returning.
    fn decode(&mut self, key: SurfaceKey, flags: DecodeFlags) -> bool {
        if self.error.is_some() {
            return false;
        }
        let (Some(meta), Some(source), Some(kind)) = (self.metadata, self.source.clone(), self.kind) else {
            self.want_full_decode = true;
            return false;
        };

        let schedule = if flags.contains(DecodeFlags::SYNC_DECODE) {
            Schedule::Sync
        } else if !self.has_been_decoded && flags.contains(DecodeFlags::SYNC_DECODE_IF_FAST) {
            Schedule::SyncIfFast
        } else {
            Schedule::Async
        };

        let inserted = self.ctx.surfaces.insert_placeholder(self.id, key);
        if !inserted && schedule != Schedule::Sync {
            // Already decoding at this key.
            return false;
        }
        if inserted && self.lock_count > 0 && self.has_been_decoded {
            self.ctx.surfaces.unlock_entries(self.id);
        }

        debug!(
            target: "imgcache::image",
            image = %self.id,
            size = %key.size,
            playback = ?key.playback,
            ?schedule,
            "requesting decode"
        );
        let task = DecodeTask::new(
            self.id,
            key,
            kind,
            source,
            meta.size,
            true,
            Arc::clone(&self.ctx.surfaces),
            Arc::clone(&self.ctx.telemetry),
            self.ctx.completion.clone(),
        )
        .with_high_quality(flags.contains(DecodeFlags::HIGH_QUALITY_SCALING));
        self.ctx.pool.run(task, schedule)
    }

    /// Ask for a surface at `size` without drawing. Returns `true` if one is ready now.
    pub fn request_decode_for_size(&mut self, size: Size, flags: DecodeFlags) -> bool {
        if self.size().is_none() || !self.all_source_data() {
            self.want_full_decode = true;
            return false;
        }
        let playback = if self.is_animated() { PlaybackType::Animated } else { PlaybackType::Static };
        self.lookup_frame(size, flags, playback).is_found()
    }

    pub fn draw(&mut self, size: Size, flags: DecodeFlags, which: FrameSelection) -> DrawOutcome {
        if size.is_empty() {
            return DrawOutcome::empty(ImgDrawResult::BadArgs);
        }
        if self.error.is_some() {
            return DrawOutcome::empty(ImgDrawResult::BadImage);
        }
        let animated = which == FrameSelection::Current && self.is_animated();
        let playback = if animated { PlaybackType::Animated } else { PlaybackType::Static };
        let frame_index = match (&self.animation, animated) {
            (Some(state), true) => state.current_frame(),
            _ => 0,
        };

        match self.lookup_frame(size, flags, playback) {
            LookupResult::Found(surface) => {
                let result = if self.all_source_data() { ImgDrawResult::Success } else { ImgDrawResult::Incomplete };
                DrawOutcome { result, surface: Some(surface), frame_index }
            }
            LookupResult::Substitute { surface, .. } => {
                DrawOutcome { result: ImgDrawResult::WrongSize, surface: Some(surface), frame_index }
            }
            LookupResult::Pending => DrawOutcome::empty(ImgDrawResult::Incomplete),
            LookupResult::NotFound if self.error.is_some() => DrawOutcome::empty(ImgDrawResult::BadImage),
            LookupResult::NotFound
                if flags.contains(DecodeFlags::SYNC_DECODE) && self.all_source_data() =>
            {
                DrawOutcome::empty(ImgDrawResult::TemporaryError)
            }
            LookupResult::NotFound => DrawOutcome::empty(ImgDrawResult::NotReady),
        }
    }

    /// Fold a finished decode into the image's state.
    pub fn on_decode_complete(&mut self, outcome: &DecodeOutcome) -> Vec<ImageEvent> {
        if outcome.image != self.id || self.error.is_some() {
            return Vec::new();
        }
        self.last_decode = Some(outcome.telemetry);
        let summary = match &outcome.result {
            Ok(summary) => *summary,
            Err(err) => return self.recover_from_decode_error(outcome.key, err.clone()),
        };

        self.has_been_decoded = true;
        if outcome.key.playback == PlaybackType::Animated && self.animation.is_none() {
            let delays = match self.ctx.surfaces.lookup(self.id, &outcome.key, false) {
                LookupResult::Found(surface) => surface.frame_delays(),
                _ => Vec::new(),
            };
            if delays.len() > 1 {
                self.animation = Some(AnimationState::new(delays, Instant::now()));
                self.update_surface_lock();
            }
        }
        let invalid = match self.size() {
            Some(size) => Rect::from_size(size),
            None => summary.invalid_rect,
        };
        vec![ImageEvent::FrameUpdate(invalid), ImageEvent::FrameComplete, ImageEvent::DecodeComplete]
    }

    fn recover_from_decode_error(&mut self, key: SurfaceKey, err: DecodeError) -> Vec<ImageEvent> {
        warn!(target: "imgcache::image", image = %self.id, "decode failed: {err}");
        self.ctx.surfaces.discard_ready(self.id);
        if self.is_animated() || self.retried {
            return self.do_error(err.into());
        }
        self.retried = true;
        self.animation = None;
        self.decode(key, DecodeFlags::empty());
        vec![ImageEvent::Discard]
    }

    /// Enter the error state. Only the first error is reported.
    pub fn do_error(&mut self, err: ImageError) -> Vec<ImageEvent> {
        if self.error.is_some() {
            trace!(target: "imgcache::image", image = %self.id, "suppressing repeated error: {err}");
            return Vec::new();
        }
        debug!(target: "imgcache::image", image = %self.id, "image entering error state: {err}");
        self.error = Some(err.clone());
        self.animation = None;
        self.lock_count = 0;
        self.want_full_decode = false;
        self.ctx.surfaces.unlock_image(self.id);
        self.ctx.surfaces.discard_ready(self.id);
        vec![ImageEvent::Error(err)]
    }

    pub fn lock(&mut self) {
        self.lock_count += 1;
        if self.error.is_none() {
            self.update_surface_lock();
        }
    }

    pub fn unlock(&mut self) {
        if self.lock_count == 0 {
            warn!(target: "imgcache::image", image = %self.id, "unlock without matching lock");
            return;
        }
        self.lock_count -= 1;
        self.update_surface_lock();
    }

    fn pins_animation(&self) -> bool {
        self.animation.is_some() && !self.ctx.surfaces.config().discard_animated
    }

    fn update_surface_lock(&self) {
        let wanted = self.error.is_none() && (self.lock_count > 0 || self.pins_animation());
        let locked = self.ctx.surfaces.is_locked(self.id);
        if wanted && !locked {
            self.ctx.surfaces.lock_image(self.id);
        } else if !wanted && locked {
            self.ctx.surfaces.unlock_image(self.id);
        }
    }

    pub fn can_discard(&self) -> bool {
        self.all_source_data() && self.lock_count == 0 && !self.pins_animation()
    }

    /// Drop every decoded surface. Refused while locked, loading or pinned by an animation.
    pub fn discard(&mut self) -> Vec<ImageEvent> {
        if !self.can_discard() {
            return Vec::new();
        }
        let removed = self.ctx.surfaces.discard_ready(self.id);
        self.animation = None;
        if removed == 0 {
            return Vec::new();
        }
        trace!(target: "imgcache::image", image = %self.id, removed, "discarded surfaces");
        vec![ImageEvent::Discard]
    }

    /// Advance the animation to `now`.
    pub fn refresh_animation(&mut self, now: Instant) -> Vec<ImageEvent> {
        let Some(state) = self.animation.as_mut() else {
            return Vec::new();
        };
        if !state.advance(now) {
            return Vec::new();
        }
        let rect = self.size().map(Rect::from_size).unwrap_or_default();
        vec![ImageEvent::FrameUpdate(rect)]
    }

    pub fn reset_animation(&mut self, now: Instant) {
        if let Some(state) = self.animation.as_mut() {
            state.reset(now);
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.ctx.surfaces.remove_image(self.id);
    }
}
