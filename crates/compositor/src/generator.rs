//! Procedural content for generator layers

use serde::{Deserialize, Serialize};

use crate::color::ColorSpace;
use crate::device::PaintDevice;
use crate::geometry::Rect;
use crate::tiles::TileError;

/// Procedural fill regenerated into a generator layer's original
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Generator {
    SolidColor {
        color: [u8; 4],
    },
    Checkerboard {
        cell: u32,
        first: [u8; 4],
        second: [u8; 4],
    },
}

impl Generator {
    pub fn name(&self) -> &'static str {
        match self {
            Generator::SolidColor { .. } => "solid_color",
            Generator::Checkerboard { .. } => "checkerboard",
        }
    }

    /// Pixel at `(x, y)` as RGBA
    fn color_at(&self, x: i32, y: i32) -> [u8; 4] {
        match self {
            Generator::SolidColor { color } => *color,
            Generator::Checkerboard { cell, first, second } => {
                let cell = (*cell).clamp(1, i32::MAX as u32) as i32;
                let parity = (x.div_euclid(cell) + y.div_euclid(cell)).rem_euclid(2);
                if parity == 0 { *first } else { *second }
            }
        }
    }

    /// Render into `dst` over `rect`
    pub fn generate(&self, dst: &mut PaintDevice, rect: Rect) -> Result<(), TileError> {
        let color_space = dst.color_space();
        let narrow = |rgba: [u8; 4]| -> Vec<u8> {
            match color_space {
                ColorSpace::Rgba8 => rgba.to_vec(),
                ColorSpace::Alpha8 => vec![rgba[3]],
            }
        };
        match self {
            Generator::SolidColor { color } => dst.fill(rect, &narrow(*color)),
            Generator::Checkerboard { .. } => dst.for_each_pixel_mut(rect, |x, y, px| {
                px.copy_from_slice(&narrow(self.color_at(x, y)));
            }),
        }
    }
}
