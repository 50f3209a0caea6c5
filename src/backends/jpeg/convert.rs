// SPDX-License-Identifier: GPL-3.0-only

//! Semi-planar YUV to RGB conversion for the software encoder

use crate::backends::camera::{FrameOffset, PixelFormat, Rect};
use image::RgbImage;

/// Convert a YUV frame region to RGB using BT.601 coefficients
///
/// `crop` selects the region of the frame to convert; it is clamped to the
/// frame bounds. Returns `None` when the buffer is too short for the
/// declared layout.
pub fn yuv_to_rgb(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
    offset: &FrameOffset,
    crop: Rect,
) -> Option<RgbImage> {
    if width == 0 || height == 0 {
        return None;
    }
    let stride = offset.stride.max(width) as usize;
    let left = crop.left.min(width.saturating_sub(1));
    let top = crop.top.min(height.saturating_sub(1));
    let out_w = crop.width.min(width - left).max(1);
    let out_h = crop.height.min(height - top).max(1);

    let luma_len = stride * offset.scanline.max(height) as usize;
    if data.len() < luma_len {
        return None;
    }
    let chroma = &data[(offset.cbcr_offset as usize).min(data.len())..];
    // (vertical subsampling, u-first)
    let layout = match format {
        PixelFormat::Nv12 => Some((2, true)),
        PixelFormat::Nv21 => Some((2, false)),
        PixelFormat::Nv16 => Some((1, true)),
        PixelFormat::Nv61 => Some((1, false)),
        PixelFormat::Yv12 => Some((2, false)),
        _ => None,
    };

    let mut rgb = vec![0u8; out_w as usize * out_h as usize * 3];
    for row in 0..out_h as usize {
        let y_row = top as usize + row;
        for col in 0..out_w as usize {
            let x = left as usize + col;
            let y = data[y_row * stride + x] as i32;
            let (u, v) = match layout {
                Some((vsub, u_first)) => {
                    let idx = (y_row / vsub) * stride + (x / 2) * 2;
                    let a = chroma.get(idx).copied().unwrap_or(128) as i32 - 128;
                    let b = chroma.get(idx + 1).copied().unwrap_or(128) as i32 - 128;
                    if u_first { (a, b) } else { (b, a) }
                }
                None => (0, 0),
            };

            let r = y + ((179 * v) >> 7);
            let g = y - ((44 * u + 91 * v) >> 7);
            let b = y + ((227 * u) >> 7);

            let out = (row * out_w as usize + col) * 3;
            rgb[out] = r.clamp(0, 255) as u8;
            rgb[out + 1] = g.clamp(0, 255) as u8;
            rgb[out + 2] = b.clamp(0, 255) as u8;
        }
    }

    RgbImage::from_raw(out_w, out_h, rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{Dimension, Padding};

    #[test]
    fn test_gray_nv21_stays_gray() {
        let dim = Dimension::new(4, 4);
        let offset = FrameOffset::for_format(PixelFormat::Nv21, dim, &Padding::default());
        let mut data = vec![128u8; offset.frame_len as usize];
        data[..16].fill(100);
        let img = yuv_to_rgb(&data, PixelFormat::Nv21, 4, 4, &offset, Rect::full(dim)).unwrap();
        assert_eq!(img.dimensions(), (4, 4));
        assert_eq!(img.get_pixel(1, 1).0, [100, 100, 100]);
    }

    #[test]
    fn test_crop_is_clamped() {
        let dim = Dimension::new(8, 8);
        let offset = FrameOffset::for_format(PixelFormat::Nv12, dim, &Padding::default());
        let data = vec![128u8; offset.frame_len as usize];
        let crop = Rect {
            left: 4,
            top: 4,
            width: 100,
            height: 100,
        };
        let img = yuv_to_rgb(&data, PixelFormat::Nv12, 8, 8, &offset, crop).unwrap();
        assert_eq!(img.dimensions(), (4, 4));
    }

    #[test]
    fn test_short_buffer_rejected() {
        let dim = Dimension::new(8, 8);
        let offset = FrameOffset::for_format(PixelFormat::Nv21, dim, &Padding::default());
        assert!(yuv_to_rgb(&[0u8; 10], PixelFormat::Nv21, 8, 8, &offset, Rect::full(dim)).is_none());
    }
}
