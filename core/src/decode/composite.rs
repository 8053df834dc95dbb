//! Compositing animation frames onto a canvas.

use crate::types::{Rect, Size};

use super::codec::RawFrame;

/// What happens to a frame's area before the next frame is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposal {
    #[default]
    Keep,
    /// Clear the frame's area to transparent black.
    Clear,
    /// Restore the canvas as it was before the frame was drawn.
    RestorePrevious,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Blend {
    /// Frame pixels replace the canvas.
    #[default]
    Source,
    /// Frame pixels are alpha-blended over the canvas.
    Over,
}

/// Maintains the canvas between frames and applies each frame's disposal lazily, when the next
/// frame arrives.
#[derive(Debug)]
pub struct FrameCompositor {
    size: Size,
    canvas: Vec<u8>,
    previous: Option<Vec<u8>>,
    pending_disposal: Option<(Disposal, Rect)>,
}

impl FrameCompositor {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            canvas: vec![0; size.rgba_bytes() as usize],
            previous: None,
            pending_disposal: None,
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Draw `frame` and return the full composited canvas, plus the area that changed.
    pub fn composite(&mut self, frame: &RawFrame) -> (Vec<u8>, Rect) {
        let mut dirty = Rect::default();
        if let Some((disposal, area)) = self.pending_disposal.take() {
            match disposal {
                Disposal::Keep => {}
                Disposal::Clear => {
                    self.fill(area, [0, 0, 0, 0]);
                    dirty = dirty.union(area);
                }
                Disposal::RestorePrevious => {
                    if let Some(previous) = self.previous.take() {
                        self.canvas = previous;
                        dirty = dirty.union(area);
                    }
                }
            }
        }

        let area = Rect::new(frame.left, frame.top, frame.width, frame.height).clamp_to(self.size);
        if frame.disposal == Disposal::RestorePrevious {
            self.previous = Some(self.canvas.clone());
        }
        self.draw(frame, area);
        self.pending_disposal = Some((frame.disposal, area));
        (self.canvas.clone(), dirty.union(area))
    }

    fn fill(&mut self, area: Rect, color: [u8; 4]) {
        let stride = self.size.width as usize * 4;
        for y in area.y..area.y + area.height {
            let start = y as usize * stride + area.x as usize * 4;
            for px in self.canvas[start..start + area.width as usize * 4].chunks_exact_mut(4) {
                px.copy_from_slice(&color);
            }
        }
    }

    fn draw(&mut self, frame: &RawFrame, area: Rect) {
        let stride = self.size.width as usize * 4;
        let frame_stride = frame.width as usize * 4;
        for row in 0..area.height as usize {
            let src_start = row * frame_stride;
            let Some(src) = frame.pixels.get(src_start..src_start + area.width as usize * 4) else {
                break;
            };
            let dst_start = (area.y as usize + row) * stride + area.x as usize * 4;
            let dst = &mut self.canvas[dst_start..dst_start + area.width as usize * 4];
            match frame.blend {
                Blend::Source => dst.copy_from_slice(src),
                Blend::Over => {
                    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                        blend_over(d, s);
                    }
                }
            }
        }
    }
}

/// Straight-alpha "source over destination".
fn blend_over(dst: &mut [u8], src: &[u8]) {
    let sa = src[3] as u32;
    if sa == 255 {
        dst.copy_from_slice(src);
        return;
    }
    if sa == 0 {
        return;
    }
    let da = dst[3] as u32;
    let out_a = sa * 255 + da * (255 - sa);
    if out_a == 0 {
        dst.copy_from_slice(&[0, 0, 0, 0]);
        return;
    }
    for channel in 0..3 {
        let value = (src[channel] as u32 * sa * 255
            + dst[channel] as u32 * da * (255 - sa))
            / out_a;
        dst[channel] = value.min(255) as u8;
    }
    dst[3] = (out_a / 255).min(255) as u8;
}
