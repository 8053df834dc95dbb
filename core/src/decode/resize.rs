//! Downscaling decoded frames to the size a consumer asked for.

use fast_image_resize as fir;

use crate::error::DecodeError;
use crate::types::Size;

/// Resampling kernel. High quality scaling uses Lanczos3, everything else bilinear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeFilter {
    Nearest,
    #[default]
    Bilinear,
    CatmullRom,
    Lanczos3,
}

impl ResizeFilter {
    pub fn for_quality(high_quality: bool) -> Self {
        if high_quality { Self::Lanczos3 } else { Self::Bilinear }
    }
}

impl From<ResizeFilter> for fir::ResizeAlg {
    fn from(value: ResizeFilter) -> Self {
        use fir::FilterType;
        match value {
            ResizeFilter::Nearest => fir::ResizeAlg::Nearest,
            ResizeFilter::Bilinear => fir::ResizeAlg::Convolution(FilterType::Bilinear),
            ResizeFilter::CatmullRom => fir::ResizeAlg::Convolution(FilterType::CatmullRom),
            ResizeFilter::Lanczos3 => fir::ResizeAlg::Convolution(FilterType::Lanczos3),
        }
    }
}

/// Resample straight-alpha RGBA8888 pixels from `from` to `to`.
pub fn resize_rgba(
    pixels: Vec<u8>,
    from: Size,
    to: Size,
    filter: ResizeFilter,
) -> Result<Vec<u8>, DecodeError> {
    if from.is_empty() || to.is_empty() {
        return Err(DecodeError::Resize(format!("cannot scale {from} to {to}")));
    }
    if from == to {
        return Ok(pixels);
    }
    if (pixels.len() as u64) < from.rgba_bytes() {
        return Err(DecodeError::Resize("source buffer is smaller than expected".into()));
    }

    let src = fir::images::ImageRef::new(from.width, from.height, &pixels, fir::PixelType::U8x4)
        .map_err(|err| DecodeError::Resize(err.to_string()))?;
    let mut dst = fir::images::Image::new(to.width, to.height, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new().resize_alg(filter.into()).use_alpha(true);

    fir::Resizer::new()
        .resize(&src, &mut dst, Some(&options))
        .map_err(|err| DecodeError::Resize(err.to_string()))?;
    Ok(dst.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(size: Size) -> Vec<u8> {
        let mut pixels = Vec::with_capacity(size.rgba_bytes() as usize);
        let dx = size.width.saturating_sub(1).max(1);
        let dy = size.height.saturating_sub(1).max(1);
        for y in 0..size.height {
            for x in 0..size.width {
                pixels.extend_from_slice(&[(x * 255 / dx) as u8, (y * 255 / dy) as u8, 0, 255]);
            }
        }
        pixels
    }

    #[test]
    fn downscale_preserves_gradient_direction() {
        let from = Size::new(8, 8);
        let to = Size::new(4, 4);
        let out = resize_rgba(gradient(from), from, to, ResizeFilter::Lanczos3).expect("resize");
        assert_eq!(out.len() as u64, to.rgba_bytes());
        let last = out.len() - 4;
        assert!(out[0] < out[last]);
        assert!(out[1] < out[last + 1]);
    }

    #[test]
    fn same_size_is_passthrough() {
        let size = Size::new(3, 3);
        let pixels = gradient(size);
        let out = resize_rgba(pixels.clone(), size, size, ResizeFilter::Nearest).expect("resize");
        assert_eq!(out, pixels);
    }

    #[test]
    fn empty_target_is_rejected() {
        let from = Size::new(2, 2);
        let err = resize_rgba(gradient(from), from, Size::new(0, 2), ResizeFilter::Bilinear);
        assert!(matches!(err, Err(DecodeError::Resize(_))));
    }
}
