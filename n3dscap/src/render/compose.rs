//! Places the screens of a normalised frame on one canvas and scales it.

use crate::config::ScaleFactor;
use crate::frame::VideoFrame;
use crate::profile::{Rect, ScreenRegion};

const RGBA: usize = VideoFrame::BYTES_PER_PIXEL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Area of the source frame to copy
    pub source: Rect,
    pub dest_x: u32,
    pub dest_y: u32,
}

/// Screens stacked top to bottom, each centred horizontally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub width: u32,
    pub height: u32,
    pub placements: Vec<Placement>,
}

impl Layout {
    pub fn stacked(screens: &[ScreenRegion], crop: bool) -> Self {
        let sources: Vec<Rect> = screens
            .iter()
            .map(|s| if crop { s.crop } else { s.full })
            .collect();

        let width = sources.iter().map(|r| r.width).max().unwrap_or(0);
        let mut height = 0;
        let placements = sources
            .into_iter()
            .map(|source| {
                let placement = Placement {
                    source,
                    dest_x: (width - source.width) / 2,
                    dest_y: height,
                };
                height += source.height;
                placement
            })
            .collect();

        Self {
            width,
            height,
            placements,
        }
    }

    /// Output size once `scale` is applied.
    pub fn scaled_size(&self, scale: ScaleFactor) -> (u32, u32) {
        (scale.apply(self.width), scale.apply(self.height))
    }
}

/// Draws `frame` through `layout` into `out` (RGBA8, black background) with
/// nearest neighbour scaling. Returns the output dimensions.
pub fn compose(
    frame: &VideoFrame,
    layout: &Layout,
    scale: ScaleFactor,
    out: &mut Vec<u8>,
) -> (u32, u32) {
    let (out_w, out_h) = layout.scaled_size(scale);
    let (num, den) = scale.ratio();

    out.clear();
    out.resize(out_w as usize * out_h as usize * RGBA, 0);
    for alpha in out.iter_mut().skip(3).step_by(RGBA) {
        *alpha = 0xFF;
    }

    let frame_rect = Rect::new(0, 0, frame.width, frame.height);
    let src_stride = frame.stride();
    let out_stride = out_w as usize * RGBA;

    for placement in &layout.placements {
        let source = placement.source;
        if source.width == 0 || source.height == 0 || !frame_rect.contains(&source) {
            continue;
        }

        let x0 = placement.dest_x * num / den;
        let x1 = (placement.dest_x + source.width) * num / den;
        let y0 = placement.dest_y * num / den;
        let y1 = (placement.dest_y + source.height) * num / den;

        for oy in y0..y1.min(out_h) {
            // canvas row back to source row
            let sy = source.y
                + (oy * den / num)
                    .saturating_sub(placement.dest_y)
                    .min(source.height - 1);
            let src_row = sy as usize * src_stride;
            let dst_row = oy as usize * out_stride;

            for ox in x0..x1.min(out_w) {
                let sx = source.x
                    + (ox * den / num)
                        .saturating_sub(placement.dest_x)
                        .min(source.width - 1);
                let src = src_row + sx as usize * RGBA;
                let dst = dst_row + ox as usize * RGBA;
                out[dst..dst + RGBA].copy_from_slice(&frame.pixels[src..src + RGBA]);
            }
        }
    }

    (out_w, out_h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DeviceProfile;
    use bytes::Bytes;
    use std::time::Instant;

    // every pixel carries its own coordinates
    fn coordinate_frame(width: u32, height: u32) -> VideoFrame {
        let mut pixels = Vec::with_capacity((width * height) as usize * RGBA);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[(x >> 8) as u8, x as u8, y as u8, 0xFF]);
            }
        }
        VideoFrame::new(Bytes::from(pixels), width, height, 0, Instant::now())
    }

    fn pixel(out: &[u8], width: u32, x: u32, y: u32) -> (u32, u32) {
        let i = ((y * width + x) as usize) * RGBA;
        (((out[i] as u32) << 8) | out[i + 1] as u32, out[i + 2] as u32)
    }

    #[test]
    fn n3ds_layouts() {
        let profile = DeviceProfile::n3ds();

        let full = Layout::stacked(&profile.screens, false);
        assert_eq!((full.width, full.height), (400, 480));
        assert_eq!(full.placements[1].dest_x, 40);
        assert_eq!(full.placements[1].dest_y, 240);

        let cropped = Layout::stacked(&profile.screens, true);
        assert_eq!((cropped.width, cropped.height), (256, 384));
        assert_eq!(cropped.placements[1].dest_x, 0);
    }

    #[test]
    fn double_scale_of_cropped_frame_doubles_dimensions() {
        let profile = DeviceProfile::n3ds();
        let frame = coordinate_frame(720, 240);
        let layout = Layout::stacked(&profile.screens, true);

        let mut out = Vec::new();
        let size = compose(&frame, &layout, ScaleFactor::Two, &mut out);

        assert_eq!(size, (512, 768));
        assert_eq!(out.len(), 512 * 768 * RGBA);
        // top left of the top crop and of the bottom crop
        assert_eq!(pixel(&out, 512, 0, 0), (72, 24));
        assert_eq!(pixel(&out, 512, 1, 1), (72, 24));
        assert_eq!(pixel(&out, 512, 2, 0), (73, 24));
        assert_eq!(pixel(&out, 512, 0, 384), (432, 24));
        assert_eq!(pixel(&out, 512, 511, 767), (432 + 255, 24 + 191));
    }

    #[test]
    fn crop_toggle_leaves_frame_untouched() {
        let profile = DeviceProfile::n3ds();
        let frame = coordinate_frame(720, 240);
        let before = frame.pixels.clone();
        let mut out = Vec::new();

        compose(&frame, &Layout::stacked(&profile.screens, true), ScaleFactor::One, &mut out);
        let size = compose(
            &frame,
            &Layout::stacked(&profile.screens, false),
            ScaleFactor::One,
            &mut out,
        );

        assert_eq!(frame.pixels, before);
        assert_eq!(size, (400, 480));
        assert_eq!(pixel(&out, 400, 0, 0), (0, 0));
        // bottom screen is centred, black bars either side
        assert_eq!(&out[(240 * 400) as usize * RGBA..][..RGBA], &[0, 0, 0, 0xFF]);
        assert_eq!(pixel(&out, 400, 40, 240), (400, 0));
    }

    #[test]
    fn one_and_a_half_scale() {
        let profile = DeviceProfile::n3ds();
        let frame = coordinate_frame(720, 240);
        let layout = Layout::stacked(&profile.screens, true);

        let mut out = Vec::new();
        let size = compose(&frame, &layout, ScaleFactor::OneAndHalf, &mut out);
        assert_eq!(size, (384, 576));
        assert_eq!(pixel(&out, 384, 383, 575), (432 + 255, 24 + 191));
    }
}
