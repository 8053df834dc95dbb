//! Format selection and the calls into the `image` crate.
//!
//! Bit-level decoding is delegated entirely; this module picks a decoder, reads metadata from
//! possibly partial data, and turns the first frame (or every frame) into straight-alpha RGBA.

use std::io::Cursor;

use anyhow::anyhow;
use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::metadata::Orientation;
use image::{AnimationDecoder, DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbaImage};
use moxcms::{CmsError, ColorProfile, Layout, TransformOptions};
use tracing::warn;

use crate::error::DecodeError;
use crate::surface::SurfaceFlags;
use crate::types::Size;

use super::composite::{Blend, Disposal};

/// Closed set of supported formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderKind {
    Png,
    Jpeg,
    Gif,
    WebP,
    Bmp,
    Ico,
}

impl DecoderKind {
    /// Map a response content type to a decoder. Parameters after `;` are ignored.
    pub fn from_mime(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/png" | "image/apng" | "image/x-png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::WebP),
            "image/bmp" | "image/x-ms-bmp" => Some(Self::Bmp),
            "image/x-icon" | "image/vnd.microsoft.icon" => Some(Self::Ico),
            _ => None,
        }
    }

    /// Identify the format from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Gif => Some(Self::Gif),
            ImageFormat::WebP => Some(Self::WebP),
            ImageFormat::Bmp => Some(Self::Bmp),
            ImageFormat::Ico => Some(Self::Ico),
            _ => None,
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Gif => ImageFormat::Gif,
            Self::WebP => ImageFormat::WebP,
            Self::Bmp => ImageFormat::Bmp,
            Self::Ico => ImageFormat::Ico,
        }
    }

    pub fn supports_animation(self) -> bool {
        matches!(self, Self::Png | Self::Gif | Self::WebP)
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Ico => "image/x-icon",
        }
    }
}

/// What a metadata decode learns without producing pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMetadata {
    pub size: Size,
    pub animated: bool,
    pub has_alpha: bool,
}

/// A frame as produced by the animation decoder, before compositing onto the canvas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub delay_ms: u32,
    pub disposal: Disposal,
    pub blend: Blend,
}

fn map_image_error(err: image::ImageError) -> DecodeError {
    match err {
        image::ImageError::Unsupported(_) => DecodeError::UnsupportedFormat,
        other => DecodeError::Corrupt(other.to_string()),
    }
}

/// Read intrinsic size, animation and alpha. Fails on data too short to contain a header, so
/// callers feeding partial data treat an error as "not yet".
pub fn read_metadata(kind: DecoderKind, bytes: &[u8]) -> Result<ImageMetadata, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptySource);
    }
    let decoder = ImageReader::with_format(Cursor::new(bytes), kind.image_format())
        .into_decoder()
        .map_err(|err| DecodeError::Metadata(err.to_string()))?;
    let (width, height) = decoder.dimensions();
    let has_alpha = decoder.color_type().has_alpha();
    drop(decoder);

    let animated = match kind {
        DecoderKind::Png => PngDecoder::new(Cursor::new(bytes))
            .and_then(|decoder| decoder.is_apng())
            .unwrap_or(false),
        DecoderKind::WebP => WebPDecoder::new(Cursor::new(bytes))
            .map(|decoder| decoder.has_animation())
            .unwrap_or(false),
        DecoderKind::Gif => match GifDecoder::new(Cursor::new(bytes)) {
            Ok(decoder) => decoder.into_frames().take(2).filter(Result::is_ok).count() > 1,
            Err(_) => false,
        },
        DecoderKind::Jpeg | DecoderKind::Bmp | DecoderKind::Ico => false,
    };

    Ok(ImageMetadata { size: Size::new(width, height), animated, has_alpha })
}

/// Decode the first frame into straight-alpha RGBA at intrinsic size, applying EXIF orientation
/// and converting embedded ICC profiles to sRGB unless told not to.
pub fn decode_first_frame(
    kind: DecoderKind,
    bytes: &[u8],
    flags: SurfaceFlags,
) -> Result<RgbaImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptySource);
    }
    let mut decoder = ImageReader::with_format(Cursor::new(bytes), kind.image_format())
        .into_decoder()
        .map_err(map_image_error)?;

    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let icc_profile = if flags.contains(SurfaceFlags::NO_COLORSPACE_CONVERSION) {
        None
    } else {
        decoder.icc_profile().unwrap_or(None)
    };

    let mut image = DynamicImage::from_decoder(decoder).map_err(map_image_error)?;
    if orientation != Orientation::NoTransforms {
        image.apply_orientation(orientation);
    }
    let mut rgba = image.into_rgba8();

    if let Some(profile) = icc_profile {
        if let Err(err) = convert_to_srgb_in_place(&mut rgba, &profile) {
            warn!(target: "imgcache::decode", ?kind, "ignoring unusable ICC profile: {err:#}");
        }
    }
    Ok(rgba)
}

/// Decode every frame of an animated image.
///
/// GIF frames come out raw, positioned within the canvas and carrying their own disposal and
/// transparency. APNG and WebP frames are handed out by the `image` crate already flattened onto
/// the full canvas, so each one replaces its predecessor.
pub fn decode_frames(kind: DecoderKind, bytes: &[u8]) -> Result<Vec<RawFrame>, DecodeError> {
    let cursor = Cursor::new(bytes);
    let frames = match kind {
        DecoderKind::Gif => return decode_gif_frames(bytes),
        DecoderKind::WebP => WebPDecoder::new(cursor).map_err(map_image_error)?.into_frames(),
        DecoderKind::Png => PngDecoder::new(cursor)
            .and_then(|decoder| decoder.apng())
            .map_err(map_image_error)?
            .into_frames(),
        DecoderKind::Jpeg | DecoderKind::Bmp | DecoderKind::Ico => {
            return Err(DecodeError::UnsupportedFormat);
        }
    };

    let mut raw = Vec::new();
    for frame in frames {
        let frame = frame.map_err(map_image_error)?;
        let (numer, denom) = frame.delay().numer_denom_ms();
        let delay_ms = if denom == 0 { 0 } else { numer / denom };
        let (left, top) = (frame.left(), frame.top());
        let buffer = frame.into_buffer();
        raw.push(RawFrame {
            left,
            top,
            width: buffer.width(),
            height: buffer.height(),
            pixels: buffer.into_raw(),
            delay_ms,
            disposal: Disposal::Keep,
            blend: Blend::Source,
        });
    }
    if raw.is_empty() {
        return Err(DecodeError::Corrupt("animation contains no frames".into()));
    }
    Ok(raw)
}

fn decode_gif_frames(bytes: &[u8]) -> Result<Vec<RawFrame>, DecodeError> {
    let corrupt = |err: gif::DecodingError| DecodeError::Corrupt(err.to_string());
    let mut options = gif::DecodeOptions::new();
    options.set_color_output(gif::ColorOutput::RGBA);
    let mut decoder = options.read_info(Cursor::new(bytes)).map_err(corrupt)?;

    let mut raw = Vec::new();
    while let Some(frame) = decoder.read_next_frame().map_err(corrupt)? {
        let disposal = match frame.dispose {
            gif::DisposalMethod::Background => Disposal::Clear,
            gif::DisposalMethod::Previous => Disposal::RestorePrevious,
            gif::DisposalMethod::Any | gif::DisposalMethod::Keep => Disposal::Keep,
        };
        // Transparent palette entries decode to alpha 0 and must let the canvas show through.
        let blend = if frame.transparent.is_some() { Blend::Over } else { Blend::Source };
        raw.push(RawFrame {
            left: u32::from(frame.left),
            top: u32::from(frame.top),
            width: u32::from(frame.width),
            height: u32::from(frame.height),
            pixels: frame.buffer.to_vec(),
            delay_ms: u32::from(frame.delay) * 10,
            disposal,
            blend,
        });
    }
    if raw.is_empty() {
        return Err(DecodeError::Corrupt("animation contains no frames".into()));
    }
    Ok(raw)
}

/// Premultiply RGBA8888 pixels in place.
pub fn premultiply_alpha(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(4) {
        let alpha = px[3] as u16;
        if alpha == 255 {
            continue;
        }
        for channel in &mut px[..3] {
            *channel = ((*channel as u16 * alpha + 127) / 255) as u8;
        }
    }
}

fn convert_to_srgb_in_place(image: &mut RgbaImage, profile_bytes: &[u8]) -> crate::Result<()> {
    let src_profile = ColorProfile::new_from_slice(profile_bytes)
        .map_err(|err| anyhow!("invalid ICC profile: {err}"))?;
    let dest_profile = ColorProfile::new_srgb();
    let raw = image.as_mut();

    match src_profile.create_transform_8bit(
        Layout::Rgba,
        &dest_profile,
        Layout::Rgba,
        TransformOptions::default(),
    ) {
        Ok(transform) => {
            let mut converted = vec![0u8; raw.len()];
            transform
                .transform(&raw[..], &mut converted)
                .map_err(|err| anyhow!("icc transform failed: {err}"))?;
            raw.copy_from_slice(&converted);
            Ok(())
        }
        // Gray and some CMYK-derived profiles only offer RGB layouts; alpha is carried over.
        Err(CmsError::InvalidLayout) => {
            let rgb: Vec<u8> = raw.chunks_exact(4).flat_map(|px| [px[0], px[1], px[2]]).collect();
            let mut converted = vec![0u8; rgb.len()];
            src_profile
                .create_transform_8bit(
                    Layout::Rgb,
                    &dest_profile,
                    Layout::Rgb,
                    TransformOptions::default(),
                )
                .map_err(|err| anyhow!("icc transform setup failed: {err}"))?
                .transform(&rgb, &mut converted)
                .map_err(|err| anyhow!("icc transform failed: {err}"))?;
            for (rgba, rgb) in raw.chunks_exact_mut(4).zip(converted.chunks_exact(3)) {
                rgba[..3].copy_from_slice(rgb);
            }
            Ok(())
        }
        Err(err) => Err(anyhow!("icc transform setup failed: {err}")),
    }
}
