use bytes::{Bytes, BytesMut};

use crate::profile::{PixelFormat, Rotation, VideoFormat};

const RGBA: usize = 4;

/// Splits a frame body into its image and PCM parts.
pub fn split_body<'a>(video: &VideoFormat, body: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
    let image_len = video.source_bytes();
    if body.len() < image_len {
        return None;
    }
    Some(body.split_at(image_len))
}

/// Converts the device's image into RGBA8 in display orientation.
///
/// Returns `None` when `data` is shorter than the image described by `format`.
pub fn decode_image(format: &VideoFormat, data: &[u8]) -> Option<Bytes> {
    if data.len() < format.source_bytes() {
        return None;
    }

    let src_w = format.source_width as usize;
    let src_h = format.source_height as usize;
    let bpp = format.pixel_format.bytes_per_pixel();
    let (out_w, _) = format.frame_size();
    let out_w = out_w as usize;

    let mut image_buffer = BytesMut::zeroed(src_w * src_h * RGBA);

    for row in 0..src_h {
        for col in 0..src_w {
            let src = (row * src_w + col) * bpp;
            let [r, g, b] = match format.pixel_format {
                PixelFormat::Rgb24 => [data[src], data[src + 1], data[src + 2]],
                PixelFormat::Rgb565 => rgb565(data[src], data[src + 1]),
            };

            let (x, y) = match format.rotation {
                Rotation::None => (col, row),
                // source rows become output columns, last source column on top
                Rotation::Ccw90 => (row, src_w - 1 - col),
            };

            let dst = (y * out_w + x) * RGBA;
            image_buffer[dst] = r;
            image_buffer[dst + 1] = g;
            image_buffer[dst + 2] = b;
            image_buffer[dst + 3] = 0xFF;
        }
    }

    Some(image_buffer.freeze())
}

fn rgb565(low: u8, high: u8) -> [u8; 3] {
    let c = u16::from_le_bytes([low, high]);
    let r = (((c & 0xF800) >> 11) << 3) as u8;
    let g = (((c & 0x7E0) >> 5) << 2) as u8;
    let b = ((c & 0x1F) << 3) as u8;
    [r, g, b]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(pixel_format: PixelFormat, rotation: Rotation) -> VideoFormat {
        VideoFormat {
            source_width: 3,
            source_height: 2,
            pixel_format,
            rotation,
        }
    }

    fn pixel(image: &[u8], width: usize, x: usize, y: usize) -> &[u8] {
        let i = (y * width + x) * RGBA;
        &image[i..i + RGBA]
    }

    #[test]
    fn rgb24_gets_opaque_alpha() {
        let data: Vec<u8> = (0..18).collect();
        let image = decode_image(&format(PixelFormat::Rgb24, Rotation::None), &data).unwrap();
        assert_eq!(image.len(), 3 * 2 * RGBA);
        assert_eq!(pixel(&image, 3, 0, 0), &[0, 1, 2, 0xFF]);
        assert_eq!(pixel(&image, 3, 2, 1), &[15, 16, 17, 0xFF]);
    }

    #[test]
    fn ccw_rotation_moves_last_column_to_top_row() {
        // 3 wide, 2 tall; pixel value encodes (row, col)
        let mut data = Vec::new();
        for row in 0..2u8 {
            for col in 0..3u8 {
                data.extend_from_slice(&[row, col, 0]);
            }
        }
        let format = format(PixelFormat::Rgb24, Rotation::Ccw90);
        assert_eq!(format.frame_size(), (2, 3));

        let image = decode_image(&format, &data).unwrap();
        // out(x, y) = src(row = x, col = 2 - y)
        assert_eq!(&pixel(&image, 2, 0, 0)[..2], &[0, 2]);
        assert_eq!(&pixel(&image, 2, 1, 0)[..2], &[1, 2]);
        assert_eq!(&pixel(&image, 2, 0, 2)[..2], &[0, 0]);
        assert_eq!(&pixel(&image, 2, 1, 2)[..2], &[1, 0]);
    }

    #[test]
    fn rgb565_expands_channels() {
        assert_eq!(rgb565(0x00, 0xF8), [0xF8, 0, 0]);
        assert_eq!(rgb565(0xE0, 0x07), [0, 0xFC, 0]);
        assert_eq!(rgb565(0x1F, 0x00), [0, 0, 0xF8]);
    }

    #[test]
    fn short_image_is_rejected() {
        let format = format(PixelFormat::Rgb565, Rotation::None);
        assert!(decode_image(&format, &[0u8; 11]).is_none());
        assert!(split_body(&format, &[0u8; 11]).is_none());
    }

    #[test]
    fn split_parts_borrow_from_the_body() {
        let body: Vec<u8> = (0..16).collect();
        let (image, pcm) = {
            let format = format(PixelFormat::Rgb565, Rotation::None);
            split_body(&format, &body).unwrap()
        };
        assert_eq!(image, &body[..12]);
        assert_eq!(pcm, &[12, 13, 14, 15]);
    }
}
