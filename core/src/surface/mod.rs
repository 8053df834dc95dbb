//! Decoded surfaces and the process-wide cache that holds them.

use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use crate::types::Size;

pub mod cache;

pub use cache::SurfaceCache;

bitflags! {
    /// Variations of a decode that produce different pixels for the same size.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SurfaceFlags: u32 {
        const NO_PREMULTIPLY_ALPHA = 1 << 0;
        const NO_COLORSPACE_CONVERSION = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackType {
    /// First frame only.
    Static,
    /// Every composited frame of an animation.
    Animated,
}

/// Identifies one surface of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceKey {
    pub size: Size,
    pub flags: SurfaceFlags,
    pub playback: PlaybackType,
}

impl SurfaceKey {
    pub fn new(size: Size, flags: SurfaceFlags, playback: PlaybackType) -> Self {
        Self { size, flags, playback }
    }

    pub fn with_size(self, size: Size) -> Self {
        Self { size, ..self }
    }
}

/// One composited frame of RGBA8888 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceFrame {
    pub pixels: Vec<u8>,
    pub delay: Duration,
}

/// Immutable decoded pixels. Static surfaces hold one frame, animated ones every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    size: Size,
    frames: Vec<SurfaceFrame>,
    premultiplied: bool,
}

impl Surface {
    pub fn new_static(size: Size, pixels: Vec<u8>, premultiplied: bool) -> Self {
        Self { size, frames: vec![SurfaceFrame { pixels, delay: Duration::ZERO }], premultiplied }
    }

    pub fn new_animated(size: Size, frames: Vec<SurfaceFrame>, premultiplied: bool) -> Self {
        Self { size, frames, premultiplied }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Pixels of the first frame.
    pub fn pixels(&self) -> &[u8] {
        self.frames.first().map(|frame| frame.pixels.as_slice()).unwrap_or(&[])
    }

    pub fn frame(&self, index: usize) -> Option<&SurfaceFrame> {
        self.frames.get(index)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_delays(&self) -> Vec<Duration> {
        self.frames.iter().map(|frame| frame.delay).collect()
    }

    pub fn is_premultiplied(&self) -> bool {
        self.premultiplied
    }

    /// Bytes charged against the surface cache budget.
    pub fn cost(&self) -> u64 {
        self.size.rgba_bytes() * self.frames.len().max(1) as u64
    }
}

/// Shared handle to a ready surface; drawing never copies pixels.
pub type DrawableSurface = Arc<Surface>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstituteReason {
    /// Nothing exists at the requested size.
    NotFound,
    /// A decode at the requested size is still running.
    Pending,
}

#[derive(Debug, Clone)]
pub enum LookupResult {
    Found(DrawableSurface),
    /// A surface of a different size; `suggested_size` is what the caller should decode.
    Substitute { surface: DrawableSurface, suggested_size: Size, reason: SubstituteReason },
    Pending,
    NotFound,
}

impl LookupResult {
    pub fn surface(&self) -> Option<&DrawableSurface> {
        match self {
            LookupResult::Found(surface) | LookupResult::Substitute { surface, .. } => Some(surface),
            LookupResult::Pending | LookupResult::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, LookupResult::Found(_))
    }
}
