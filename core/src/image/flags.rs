use bitflags::bitflags;

use crate::surface::{DrawableSurface, SurfaceFlags};

bitflags! {
    /// Per-call decode and lookup options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DecodeFlags: u32 {
        /// Decode on the calling thread if nothing suitable is cached.
        const SYNC_DECODE = 1 << 0;
        /// Decode inline if the image was never decoded and the work is small.
        const SYNC_DECODE_IF_FAST = 1 << 1;
        /// Allow best-match substitution and downscale-during-decode.
        const HIGH_QUALITY_SCALING = 1 << 2;
        /// Defer notifications produced by this call to the next completion pass.
        const ASYNC_NOTIFY = 1 << 3;
        /// A substitute of the wrong size is acceptable; do not start a decode for the exact size.
        const AVOID_REDECODE_FOR_SIZE = 1 << 4;
        const NO_PREMULTIPLY_ALPHA = 1 << 5;
        const NO_COLORSPACE_CONVERSION = 1 << 6;
    }
}

impl DecodeFlags {
    /// The subset of flags that changes decoded pixels, and therefore the surface key.
    pub fn surface_flags(self) -> SurfaceFlags {
        let mut flags = SurfaceFlags::empty();
        if self.contains(Self::NO_PREMULTIPLY_ALPHA) {
            flags.insert(SurfaceFlags::NO_PREMULTIPLY_ALPHA);
        }
        if self.contains(Self::NO_COLORSPACE_CONVERSION) {
            flags.insert(SurfaceFlags::NO_COLORSPACE_CONVERSION);
        }
        flags
    }
}

/// Outcome of a draw request as reported to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImgDrawResult {
    Success,
    /// Something was drawn, but a better surface is still decoding.
    Incomplete,
    NotReady,
    /// A surface of another size was drawn; redraw once the right size is decoded.
    WrongSize,
    /// A synchronous decode was asked for and produced nothing.
    TemporaryError,
    BadArgs,
    BadImage,
}

/// Which frame a draw wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameSelection {
    /// The frame the animation is currently showing; the only frame for static images.
    #[default]
    Current,
    First,
}

#[derive(Debug, Clone)]
pub struct DrawOutcome {
    pub result: ImgDrawResult,
    pub surface: Option<DrawableSurface>,
    /// Frame of `surface` to paint.
    pub frame_index: usize,
}

impl DrawOutcome {
    pub(crate) fn empty(result: ImgDrawResult) -> Self {
        Self { result, surface: None, frame_index: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pixel_affecting_flags_reach_the_surface_key() {
        let flags = DecodeFlags::SYNC_DECODE
            | DecodeFlags::HIGH_QUALITY_SCALING
            | DecodeFlags::NO_PREMULTIPLY_ALPHA;
        assert_eq!(flags.surface_flags(), SurfaceFlags::NO_PREMULTIPLY_ALPHA);
        assert!(DecodeFlags::ASYNC_NOTIFY.surface_flags().is_empty());
    }
}
