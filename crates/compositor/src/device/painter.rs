//! Compositing between paint devices

use crate::color::{ChannelFlags, ColorSpace};
use crate::composite::{CompositeOp, compose_row, mul_u8};
use crate::geometry::Rect;
use crate::tiles::TileError;

use super::{PaintDevice, local_offset, tile_parts};

impl PaintDevice {
    /// Composite `src` onto this device over `rect`.
    ///
    /// Every destination tile under the affected area is made writable
    /// before the first pixel changes, so a failed allocation leaves the
    /// device untouched.
    pub fn composite_rect(
        &mut self,
        src: &PaintDevice,
        rect: Rect,
        op: CompositeOp,
        opacity: u8,
        flags: &ChannelFlags,
    ) -> Result<(), TileError> {
        debug_assert_eq!(self.color_space(), src.color_space());
        let color_space = self.color_space();
        let flags = flags.normalized_for(color_space);

        let source_is_transparent = color_space.opacity(src.default_pixel()) == 0;
        let rect = if source_is_transparent && op.transparent_source_is_noop() {
            rect & src.extent()
        } else {
            rect
        };
        if rect.is_empty() {
            return Ok(());
        }

        self.prepare_rect(rect)?;
        let ps = self.pixel_size();
        let offset = self.offset();
        let mut row = Vec::new();
        for part in tile_parts(self.store_rect(rect)) {
            let Some(data) = self.store.writable_data(part.index) else {
                continue;
            };
            let run = part.local.width as usize * ps;
            row.resize(run, 0);
            for dy in 0..part.local.height {
                let x = part.origin.x + offset.x;
                let y = part.origin.y + dy + offset.y;
                src.read_row_into(x, y, &mut row);
                let start = local_offset(part.local.x, part.local.y + dy, ps);
                compose_row(
                    color_space,
                    op,
                    &mut data[start..start + run],
                    &row,
                    opacity,
                    &flags,
                );
            }
        }
        Ok(())
    }

    /// Multiply the alpha of every pixel in `rect` by `selection`
    /// (an [`ColorSpace::Alpha8`] device).
    pub fn apply_selection(&mut self, selection: &PaintDevice, rect: Rect) -> Result<(), TileError> {
        debug_assert_eq!(selection.color_space(), ColorSpace::Alpha8);
        let alpha = self.color_space().alpha_pos();
        self.for_each_pixel_mut(rect, |x, y, px| {
            px[alpha] = mul_u8(px[alpha], selection.pixel(x, y)[0]);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_over_region() {
        let mut dst = PaintDevice::new(ColorSpace::Rgba8);
        dst.fill(Rect::new(0, 0, 10, 10), &[0, 0, 255, 255]).unwrap();
        let mut src = PaintDevice::new(ColorSpace::Rgba8);
        src.fill(Rect::new(5, 5, 10, 10), &[255, 0, 0, 255]).unwrap();

        dst.composite_rect(
            &src,
            Rect::new(0, 0, 100, 100),
            CompositeOp::Over,
            255,
            &ChannelFlags::ALL,
        )
        .unwrap();
        assert_eq!(dst.pixel(0, 0), &[0, 0, 255, 255]);
        assert_eq!(dst.pixel(7, 7), &[255, 0, 0, 255]);
        assert_eq!(dst.pixel(14, 14), &[255, 0, 0, 255]);
        assert_eq!(dst.exact_bounds(), Rect::new(0, 0, 15, 15));
    }

    #[test]
    fn test_transparent_source_touches_nothing() {
        let mut dst = PaintDevice::new(ColorSpace::Rgba8);
        let src = PaintDevice::new(ColorSpace::Rgba8);
        dst.composite_rect(
            &src,
            Rect::new(0, 0, 500, 500),
            CompositeOp::Over,
            255,
            &ChannelFlags::ALL,
        )
        .unwrap();
        assert_eq!(dst.extent(), Rect::EMPTY);
    }

    #[test]
    fn test_composite_respects_offsets() {
        let mut dst = PaintDevice::new(ColorSpace::Alpha8);
        dst.set_x(3);
        let mut src = PaintDevice::new(ColorSpace::Alpha8);
        src.set_pixel(70, 2, &[200]).unwrap();
        src.set_y(10);
        dst.composite_rect(
            &src,
            Rect::new(0, 0, 128, 64),
            CompositeOp::Over,
            255,
            &ChannelFlags::ALL,
        )
        .unwrap();
        assert_eq!(dst.pixel(70, 12), &[200]);
        assert_eq!(dst.exact_bounds(), Rect::new(70, 12, 1, 1));
    }

    #[test]
    fn test_apply_selection() {
        let mut device = PaintDevice::new(ColorSpace::Rgba8);
        device.fill(Rect::new(0, 0, 4, 1), &[10, 20, 30, 255]).unwrap();
        let mut selection = PaintDevice::new(ColorSpace::Alpha8);
        selection.fill(Rect::new(0, 0, 2, 1), &[255]).unwrap();
        device.apply_selection(&selection, Rect::new(0, 0, 4, 1)).unwrap();
        assert_eq!(device.pixel(1, 0), &[10, 20, 30, 255]);
        assert_eq!(device.pixel(2, 0), &[10, 20, 30, 0]);
    }
}
