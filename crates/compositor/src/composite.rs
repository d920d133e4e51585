//! Composite operations and per-pixel blending math

use serde::{Deserialize, Serialize};

use crate::color::{ChannelFlags, ColorSpace};
use crate::constants::{MAX_PIXEL_SIZE, OPACITY_OPAQUE, OPACITY_TRANSPARENT};

/// How a source pixel is combined with the destination underneath it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompositeOp {
    /// Source over destination
    #[default]
    Over = 0,
    /// Replace the destination, opacity interpolates between the two
    Copy = 1,
    /// Remove destination alpha where the source is opaque
    Erase = 2,
    /// Paint underneath the destination
    Behind = 3,
    Multiply = 4,
    Screen = 5,
    Add = 6,
    Darken = 7,
    Lighten = 8,
}

impl CompositeOp {
    /// Stable string id of the operation
    pub fn id(self) -> &'static str {
        match self {
            CompositeOp::Over => "normal",
            CompositeOp::Copy => "copy",
            CompositeOp::Erase => "erase",
            CompositeOp::Behind => "behind",
            CompositeOp::Multiply => "multiply",
            CompositeOp::Screen => "screen",
            CompositeOp::Add => "add",
            CompositeOp::Darken => "darken",
            CompositeOp::Lighten => "lighten",
        }
    }

    /// True when a fully transparent source leaves the destination unchanged
    #[inline]
    pub fn transparent_source_is_noop(self) -> bool {
        !matches!(self, CompositeOp::Copy)
    }

    fn blend_channel(self, s: f32, d: f32) -> f32 {
        match self {
            CompositeOp::Multiply => s * d,
            CompositeOp::Screen => s + d - s * d,
            CompositeOp::Add => (s + d).min(1.0),
            CompositeOp::Darken => s.min(d),
            CompositeOp::Lighten => s.max(d),
            _ => s,
        }
    }
}

/// Multiply two 8-bit normalized values
#[inline]
pub fn mul_u8(a: u8, b: u8) -> u8 {
    let t = a as u32 * b as u32 + 0x80;
    (((t >> 8) + t) >> 8) as u8
}

/// Linear interpolation from `a` to `b` by `t / 255`
#[inline]
pub fn lerp_u8(a: u8, b: u8, t: u8) -> u8 {
    let a = a as i32;
    let b = b as i32;
    let t = t as i32;
    (a + ((b - a) * t + if b >= a { 127 } else { -127 }) / 255).clamp(0, 255) as u8
}

#[inline]
fn to_unit(v: u8) -> f32 {
    v as f32 / 255.0
}

#[inline]
fn from_unit(v: f32) -> u8 {
    (v * 255.0 + 0.5).clamp(0.0, 255.0) as u8
}

/// Composite one source pixel onto one destination pixel.
///
/// Channels disabled in `flags` keep their destination value. `flags` must
/// already be normalized for `color_space`.
pub fn compose_pixel(
    color_space: ColorSpace,
    op: CompositeOp,
    dst: &mut [u8],
    src: &[u8],
    opacity: u8,
    flags: &ChannelFlags,
) {
    let n = color_space.pixel_size();
    let alpha = color_space.alpha_pos();
    let src_alpha = mul_u8(src[alpha], opacity);

    if src_alpha == OPACITY_TRANSPARENT && op.transparent_source_is_noop() {
        return;
    }
    if op == CompositeOp::Over && src_alpha == OPACITY_OPAQUE && flags.is_all() {
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }

    let mut out = [0u8; MAX_PIXEL_SIZE];
    out[..n].copy_from_slice(&dst[..n]);

    let sa = to_unit(src_alpha);
    let da = to_unit(dst[alpha]);

    match op {
        CompositeOp::Copy => {
            for i in 0..n {
                out[i] = lerp_u8(dst[i], src[i], opacity);
            }
        }
        CompositeOp::Erase => {
            out[alpha] = from_unit(da * (1.0 - sa));
        }
        CompositeOp::Behind => {
            let oa = da + sa * (1.0 - da);
            out[alpha] = from_unit(oa);
            if oa > 0.0 {
                for i in (0..n).filter(|i| *i != alpha) {
                    let s = to_unit(src[i]);
                    let d = to_unit(dst[i]);
                    out[i] = from_unit((d * da + s * sa * (1.0 - da)) / oa);
                }
            }
        }
        _ => {
            let oa = sa + da * (1.0 - sa);
            out[alpha] = from_unit(oa);
            if oa > 0.0 {
                for i in (0..n).filter(|i| *i != alpha) {
                    let s = to_unit(src[i]);
                    let d = to_unit(dst[i]);
                    let mixed = (1.0 - da) * s + da * op.blend_channel(s, d);
                    out[i] = from_unit((mixed * sa + d * da * (1.0 - sa)) / oa);
                }
            }
        }
    }

    for (i, value) in out[..n].iter().enumerate() {
        if flags.is_enabled(i) {
            dst[i] = *value;
        }
    }
}

/// Composite a row of pixels. Both slices hold the same number of pixels.
pub fn compose_row(
    color_space: ColorSpace,
    op: CompositeOp,
    dst: &mut [u8],
    src: &[u8],
    opacity: u8,
    flags: &ChannelFlags,
) {
    if opacity == OPACITY_TRANSPARENT && op.transparent_source_is_noop() {
        return;
    }
    match color_space {
        ColorSpace::Rgba8 => {
            let dst_px: &mut [[u8; 4]] = bytemuck::cast_slice_mut(dst);
            let src_px: &[[u8; 4]] = bytemuck::cast_slice(src);
            for (d, s) in dst_px.iter_mut().zip(src_px) {
                compose_pixel(color_space, op, d, s, opacity, flags);
            }
        }
        ColorSpace::Alpha8 => {
            for (d, s) in dst.iter_mut().zip(src) {
                compose_pixel(
                    color_space,
                    op,
                    std::slice::from_mut(d),
                    std::slice::from_ref(s),
                    opacity,
                    flags,
                );
            }
        }
    }
}
