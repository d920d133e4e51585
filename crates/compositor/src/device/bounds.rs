//! Exact content bounds

use crate::constants::TILE_SIZE;
use crate::geometry::Rect;

use super::PaintDevice;

/// Tight rect of pixels differing from `default` inside one tile buffer
fn non_default_rect(data: &[u8], default: &[u8], pixel_size: usize) -> Option<Rect> {
    let size = TILE_SIZE as usize;
    let row_len = size * pixel_size;
    let mut top = None;
    let mut bottom = 0;
    let mut left = size;
    let mut right = 0;

    for y in 0..size {
        let row = &data[y * row_len..(y + 1) * row_len];
        let mut first = None;
        let mut last = 0;
        for (x, px) in row.chunks_exact(pixel_size).enumerate() {
            if px != default {
                first.get_or_insert(x);
                last = x;
            }
        }
        if let Some(first) = first {
            top.get_or_insert(y);
            bottom = y;
            left = left.min(first);
            right = right.max(last);
        }
    }

    top.map(|top| {
        Rect::new(
            left as i32,
            top as i32,
            (right - left + 1) as i32,
            (bottom - top + 1) as i32,
        )
    })
}

impl PaintDevice {
    /// Tight bounds of every pixel that differs from the default pixel.
    ///
    /// Scans tile contents, skipping lazy default tiles and tiles already
    /// inside the bounds found so far.
    pub fn exact_bounds(&self) -> Rect {
        let store = self.tile_store();
        let default = store.default_pixel();
        let pixel_size = self.pixel_size();
        let mut bounds = Rect::EMPTY;

        for (index, tile) in store.iter() {
            if store.is_default_tile(tile) {
                continue;
            }
            let tile_rect = index.rect();
            if bounds.contains(&tile_rect) {
                continue;
            }
            if let Some(local) = non_default_rect(tile.data(), default, pixel_size) {
                bounds |= local.translated(tile_rect.x, tile_rect.y);
            }
        }
        bounds.translated_by(self.offset())
    }

    /// Cached [`exact_bounds`](Self::exact_bounds); recomputed lazily after
    /// any mutation of the device.
    pub fn exact_bounds_amortized(&self) -> Rect {
        *self.exact_bounds_cache.get_or_init(|| self.exact_bounds())
    }

    /// True when no pixel differs from the default pixel
    pub fn is_empty_content(&self) -> bool {
        self.exact_bounds_amortized().is_empty()
    }

    /// Number of pixels in `rect` that differ from the default pixel
    pub fn non_default_pixel_count(&self, rect: Rect) -> usize {
        let default = self.default_pixel().to_vec();
        let mut count = 0;
        self.for_each_pixel(rect, |_, _, px| {
            if px != default.as_slice() {
                count += 1;
            }
        });
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorSpace;

    #[test]
    fn test_non_default_rect_scan() {
        let mut data = vec![0u8; (TILE_SIZE * TILE_SIZE) as usize];
        assert!(non_default_rect(&data, &[0], 1).is_none());
        data[3 * 64 + 7] = 1;
        data[10 * 64 + 2] = 1;
        assert_eq!(non_default_rect(&data, &[0], 1), Some(Rect::new(2, 3, 6, 8)));
    }

    #[test]
    fn test_amortized_bounds_follow_mutations() {
        let mut device = PaintDevice::new(ColorSpace::Alpha8);
        device.set_pixel(1, 1, &[255]).unwrap();
        assert_eq!(device.exact_bounds_amortized(), Rect::new(1, 1, 1, 1));
        device.set_pixel(100, 50, &[255]).unwrap();
        assert_eq!(device.exact_bounds_amortized(), Rect::new(1, 1, 100, 50));
        device.clear();
        assert!(device.is_empty_content());
    }

    #[test]
    fn test_bounds_respect_default_pixel() {
        let mut device = PaintDevice::new(ColorSpace::Alpha8);
        device.fill(Rect::new(0, 0, 64, 64), &[7]).unwrap();
        device.set_pixel(4, 4, &[0]).unwrap();
        device.set_default_pixel(&[7]);
        assert_eq!(device.non_default_pixel_count(Rect::new(0, 0, 64, 64)), 1);
    }
}
