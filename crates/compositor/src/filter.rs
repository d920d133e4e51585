//! Pixel filters used by adjustment layers and filter masks

use serde::{Deserialize, Serialize};

use crate::color::ColorSpace;
use crate::device::PaintDevice;
use crate::geometry::Rect;
use crate::tiles::TileError;

/// A filter configuration.
///
/// Point filters map each pixel independently. Area filters read a margin
/// around the requested rect (`need_rect`) and spread changes by the same
/// margin (`change_rect`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    Invert,
    Brightness { delta: i16 },
    Desaturate,
    Threshold { level: u8 },
    BoxBlur { radius: u32 },
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::Invert => "invert",
            Filter::Brightness { .. } => "brightness",
            Filter::Desaturate => "desaturate",
            Filter::Threshold { .. } => "threshold",
            Filter::BoxBlur { .. } => "box_blur",
        }
    }

    fn margin(&self) -> i32 {
        match self {
            Filter::BoxBlur { radius } => (*radius).min(i32::MAX as u32) as i32,
            _ => 0,
        }
    }

    /// Rect that must be read to produce `rect`
    pub fn need_rect(&self, rect: Rect) -> Rect {
        rect.grown(self.margin())
    }

    /// Rect of output affected by a change of input inside `rect`
    pub fn change_rect(&self, rect: Rect) -> Rect {
        rect.grown(self.margin())
    }

    /// Filter `src` into `dst` over `rect`; `dst` is written all-or-nothing
    pub fn process(&self, src: &PaintDevice, dst: &mut PaintDevice, rect: Rect) -> Result<(), TileError> {
        if rect.is_empty() {
            return Ok(());
        }
        let color_space = src.color_space();
        let output = match self {
            Filter::BoxBlur { radius } if *radius > 0 => {
                let need = self.need_rect(rect);
                let input = src.read_bytes(need);
                box_blur(
                    &input,
                    color_space,
                    need.width as usize,
                    need.height as usize,
                    *radius as usize,
                )
            }
            _ => {
                let mut bytes = src.read_bytes(rect);
                for px in bytes.chunks_exact_mut(color_space.pixel_size()) {
                    self.apply_point(color_space, px);
                }
                bytes
            }
        };
        dst.write_bytes(rect, &output)
    }

    fn apply_point(&self, color_space: ColorSpace, px: &mut [u8]) {
        let alpha = color_space.alpha_pos();
        let color_channels = (0..px.len()).filter(|i| *i != alpha || color_space == ColorSpace::Alpha8);
        match self {
            Filter::Invert => {
                for i in color_channels {
                    px[i] = 255 - px[i];
                }
            }
            Filter::Brightness { delta } => {
                for i in color_channels {
                    px[i] = (px[i] as i16 + delta).clamp(0, 255) as u8;
                }
            }
            Filter::Desaturate => {
                if color_space == ColorSpace::Rgba8 {
                    let luma = (px[0] as u32 * 54 + px[1] as u32 * 183 + px[2] as u32 * 19 + 128) >> 8;
                    px[..3].fill(luma.min(255) as u8);
                }
            }
            Filter::Threshold { level } => {
                for i in color_channels {
                    px[i] = if px[i] >= *level { 255 } else { 0 };
                }
            }
            Filter::BoxBlur { .. } => {}
        }
    }
}

/// Alpha-weighted box blur. `input` covers the requested rect grown by
/// `radius`; the result covers the requested rect only.
fn box_blur(input: &[u8], color_space: ColorSpace, in_w: usize, in_h: usize, radius: usize) -> Vec<u8> {
    let window = 2 * radius + 1;
    let out_w = in_w - 2 * radius;
    let out_h = in_h - 2 * radius;

    let premultiplied: Vec<[u64; 4]> = match color_space {
        ColorSpace::Rgba8 => bytemuck::cast_slice::<u8, [u8; 4]>(input)
            .iter()
            .map(|p| {
                let a = p[3] as u64;
                [p[0] as u64 * a, p[1] as u64 * a, p[2] as u64 * a, a]
            })
            .collect(),
        ColorSpace::Alpha8 => input.iter().map(|a| [0, 0, 0, *a as u64]).collect(),
    };

    let mut horizontal = vec![[0u64; 4]; out_w * in_h];
    for y in 0..in_h {
        let row = &premultiplied[y * in_w..(y + 1) * in_w];
        let mut acc = [0u64; 4];
        for x in 0..in_w {
            add_assign(&mut acc, &row[x]);
            if x >= window {
                sub_assign(&mut acc, &row[x - window]);
            }
            if x + 1 >= window {
                horizontal[y * out_w + x + 1 - window] = acc;
            }
        }
    }

    let area = (window * window) as u64;
    let ps = color_space.pixel_size();
    let mut output = vec![0u8; out_w * out_h * ps];
    for x in 0..out_w {
        let mut acc = [0u64; 4];
        for y in 0..in_h {
            add_assign(&mut acc, &horizontal[y * out_w + x]);
            if y >= window {
                sub_assign(&mut acc, &horizontal[(y - window) * out_w + x]);
            }
            if y + 1 >= window {
                let out_y = y + 1 - window;
                let px = &mut output[(out_y * out_w + x) * ps..][..ps];
                let alpha_sum = acc[3];
                match color_space {
                    ColorSpace::Rgba8 => {
                        if alpha_sum > 0 {
                            for c in 0..3 {
                                px[c] = ((acc[c] + alpha_sum / 2) / alpha_sum).min(255) as u8;
                            }
                        }
                        px[3] = ((alpha_sum + area / 2) / area).min(255) as u8;
                    }
                    ColorSpace::Alpha8 => {
                        px[0] = ((alpha_sum + area / 2) / area).min(255) as u8;
                    }
                }
            }
        }
    }
    output
}

#[inline]
fn add_assign(acc: &mut [u64; 4], value: &[u64; 4]) {
    for (a, v) in acc.iter_mut().zip(value) {
        *a += v;
    }
}

#[inline]
fn sub_assign(acc: &mut [u64; 4], value: &[u64; 4]) {
    for (a, v) in acc.iter_mut().zip(value) {
        *a -= v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_growth() {
        let blur = Filter::BoxBlur { radius: 3 };
        let rect = Rect::new(10, 10, 10, 10);
        assert_eq!(blur.need_rect(rect), Rect::new(7, 7, 16, 16));
        assert_eq!(blur.change_rect(rect), Rect::new(7, 7, 16, 16));
        assert_eq!(Filter::Invert.need_rect(rect), rect);
    }

    #[test]
    fn test_invert_keeps_alpha() {
        let mut src = PaintDevice::new(ColorSpace::Rgba8);
        src.fill(Rect::new(0, 0, 2, 2), &[10, 20, 30, 128]).unwrap();
        let mut dst = PaintDevice::new(ColorSpace::Rgba8);
        Filter::Invert.process(&src, &mut dst, Rect::new(0, 0, 2, 2)).unwrap();
        assert_eq!(dst.pixel(1, 1), &[245, 235, 225, 128]);
    }

    #[test]
    fn test_box_blur_spreads_single_pixel() {
        let mut src = PaintDevice::new(ColorSpace::Alpha8);
        src.set_pixel(5, 5, &[255]).unwrap();
        let mut dst = PaintDevice::new(ColorSpace::Alpha8);
        let blur = Filter::BoxBlur { radius: 1 };
        blur.process(&src, &mut dst, Rect::new(0, 0, 11, 11)).unwrap();
        assert_eq!(dst.pixel(5, 5), &[28]);
        assert_eq!(dst.pixel(4, 6), &[28]);
        assert_eq!(dst.pixel(3, 5), &[0]);
        assert_eq!(dst.exact_bounds(), Rect::new(4, 4, 3, 3));
    }

    #[test]
    fn test_box_blur_of_uniform_color_is_identity() {
        let mut src = PaintDevice::new(ColorSpace::Rgba8);
        src.fill(Rect::new(0, 0, 20, 20), &[40, 80, 120, 255]).unwrap();
        let mut dst = PaintDevice::new(ColorSpace::Rgba8);
        Filter::BoxBlur { radius: 2 }
            .process(&src, &mut dst, Rect::new(5, 5, 5, 5))
            .unwrap();
        assert_eq!(dst.pixel(7, 7), &[40, 80, 120, 255]);
    }

    #[test]
    fn test_threshold_on_alpha_device() {
        let mut src = PaintDevice::new(ColorSpace::Alpha8);
        src.set_pixel(0, 0, &[99]).unwrap();
        src.set_pixel(1, 0, &[100]).unwrap();
        let mut dst = PaintDevice::new(ColorSpace::Alpha8);
        Filter::Threshold { level: 100 }
            .process(&src, &mut dst, Rect::new(0, 0, 2, 1))
            .unwrap();
        assert_eq!(dst.pixel(0, 0), &[0]);
        assert_eq!(dst.pixel(1, 0), &[255]);
    }
}
