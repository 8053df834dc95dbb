//! A single unit of decode work and what it reports back.

use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::DecodeError;
use crate::stats::TelemetrySink;
use crate::surface::{PlaybackType, Surface, SurfaceCache, SurfaceFlags, SurfaceFrame, SurfaceKey};
use crate::types::{ImageId, Rect, Size};

use super::codec::{self, DecoderKind};
use super::composite::FrameCompositor;
use super::resize::{ResizeFilter, resize_rgba};

/// Identity used to deduplicate decode work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodeKey {
    pub image: ImageId,
    pub size: Size,
    pub flags: SurfaceFlags,
    pub playback: PlaybackType,
}

/// Decode timings and volume, reported to telemetry and to the owning image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeTelemetry {
    pub decode_time: Duration,
    pub chunk_count: u32,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedSummary {
    pub size: Size,
    pub frame_count: usize,
    /// Area of the surface that changed; the whole surface for a fresh decode.
    pub invalid_rect: Rect,
    /// False when the surface cache refused the surface.
    pub retained: bool,
}

/// Result of a decode task, delivered to the owning loader's completion channel.
#[derive(Debug, Clone)]
pub struct DecodeOutcome {
    pub image: ImageId,
    pub key: SurfaceKey,
    pub result: Result<DecodedSummary, DecodeError>,
    pub telemetry: DecodeTelemetry,
    /// True when the task ran on the thread that requested it.
    pub ran_sync: bool,
}

/// Everything a worker needs to turn source bytes into a cached surface. Owns no loader state.
#[derive(Debug)]
pub struct DecodeTask {
    pub(crate) image: ImageId,
    pub(crate) key: SurfaceKey,
    pub(crate) kind: DecoderKind,
    pub(crate) source: Arc<[u8]>,
    pub(crate) intrinsic: Size,
    pub(crate) high_quality: bool,
    pub(crate) source_complete: bool,
    pub(crate) surfaces: Arc<SurfaceCache>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) completion: Sender<DecodeOutcome>,
}

impl DecodeTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        image: ImageId,
        key: SurfaceKey,
        kind: DecoderKind,
        source: Arc<[u8]>,
        intrinsic: Size,
        source_complete: bool,
        surfaces: Arc<SurfaceCache>,
        telemetry: Arc<dyn TelemetrySink>,
        completion: Sender<DecodeOutcome>,
    ) -> Self {
        Self {
            image,
            key,
            kind,
            source,
            intrinsic,
            high_quality: false,
            source_complete,
            surfaces,
            telemetry,
            completion,
        }
    }

    pub fn with_high_quality(mut self, high_quality: bool) -> Self {
        self.high_quality = high_quality;
        self
    }

    pub fn key(&self) -> DecodeKey {
        DecodeKey { image: self.image, size: self.key.size, flags: self.key.flags, playback: self.key.playback }
    }

    pub fn surface_key(&self) -> SurfaceKey {
        self.key
    }

    /// Small, fully loaded images are cheap enough to decode on the requesting thread.
    pub fn prefers_sync(&self, pixel_limit: u64) -> bool {
        self.source_complete && self.key.size.area() <= pixel_limit
    }

    pub(crate) fn completion(&self) -> Sender<DecodeOutcome> {
        self.completion.clone()
    }

    /// Decode, store the surface in the surface cache and build the outcome. Does not send it.
    pub fn run(self, ran_sync: bool) -> DecodeOutcome {
        let started = Instant::now();
        trace!(
            target: "imgcache::decode",
            image = %self.image,
            size = %self.key.size,
            ?self.kind,
            ran_sync,
            "decode started"
        );

        let decoded = match self.key.playback {
            PlaybackType::Static => self.decode_static(),
            PlaybackType::Animated => self.decode_animated(),
        };

        let result = match decoded {
            Ok(surface) => {
                let frame_count = surface.frame_count();
                let size = surface.size();
                // Not retained when over budget or when the image went away meanwhile.
                let retained = self.surfaces.finish(self.image, self.key, surface).is_some();
                Ok(DecodedSummary {
                    size,
                    frame_count,
                    invalid_rect: Rect::from_size(size),
                    retained,
                })
            }
            Err(err) => {
                self.surfaces.abandon(self.image, &self.key);
                Err(err)
            }
        };

        let telemetry = DecodeTelemetry {
            decode_time: started.elapsed(),
            chunk_count: chunk_count(self.source.len()),
            bytes: self.source.len() as u64,
        };
        self.telemetry.record_decode(telemetry.decode_time);
        self.telemetry.record_decode_chunks(telemetry.chunk_count, telemetry.bytes);
        if let Err(err) = &result {
            debug!(target: "imgcache::decode", image = %self.image, "decode failed: {err}");
        }

        DecodeOutcome { image: self.image, key: self.key, result, telemetry, ran_sync }
    }

    fn decode_static(&self) -> Result<Surface, DecodeError> {
        let rgba = codec::decode_first_frame(self.kind, &self.source, self.key.flags)?;
        let decoded_size = Size::new(rgba.width(), rgba.height());
        let target = if self.key.size.is_empty() { decoded_size } else { self.key.size };
        let filter = ResizeFilter::for_quality(self.high_quality);
        let mut pixels = resize_rgba(rgba.into_raw(), decoded_size, target, filter)?;

        let premultiply = !self.key.flags.contains(SurfaceFlags::NO_PREMULTIPLY_ALPHA);
        if premultiply {
            codec::premultiply_alpha(&mut pixels);
        }
        Ok(Surface::new_static(target, pixels, premultiply))
    }

    fn decode_animated(&self) -> Result<Surface, DecodeError> {
        let raw = codec::decode_frames(self.kind, &self.source)?;
        let canvas = if self.intrinsic.is_empty() {
            Size::new(raw[0].width, raw[0].height)
        } else {
            self.intrinsic
        };
        let premultiply = !self.key.flags.contains(SurfaceFlags::NO_PREMULTIPLY_ALPHA);

        let mut compositor = FrameCompositor::new(canvas);
        let mut frames = Vec::with_capacity(raw.len());
        for frame in &raw {
            let (mut pixels, _) = compositor.composite(frame);
            if canvas != self.key.size && !self.key.size.is_empty() {
                pixels = resize_rgba(pixels, canvas, self.key.size, ResizeFilter::Bilinear)?;
            }
            if premultiply {
                codec::premultiply_alpha(&mut pixels);
            }
            frames.push(SurfaceFrame { pixels, delay: Duration::from_millis(frame.delay_ms as u64) });
        }
        let size = if self.key.size.is_empty() { canvas } else { self.key.size };
        Ok(Surface::new_animated(size, frames, premultiply))
    }
}

/// Decoders consume source data in 4 KiB reads.
fn chunk_count(len: usize) -> u32 {
    len.div_ceil(4096).max(1) as u32
}
