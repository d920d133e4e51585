//! Line iterators and random accessors over a paint device
//!
//! Const variants only ever read: absent tiles resolve to the default tile
//! and nothing is created, so neither `extent()` nor `exact_bounds()` can
//! change. Mutable variants touch every tile they step onto, which widens
//! the extent even if no byte is written; private memory is only allocated
//! when `raw_data()` is requested.

use crate::constants::TILE_SIZE;
use crate::geometry::Rect;
use crate::tiles::{TileError, TileIndex};

use super::PaintDevice;

#[derive(Debug, Clone, Copy)]
struct Cursor {
    rect: Rect,
    x: i32,
    y: i32,
}

impl Cursor {
    fn new(rect: Rect) -> Self {
        Self {
            rect,
            x: rect.x,
            y: rect.y,
        }
    }

    fn right(&self) -> i64 {
        self.rect.right()
    }

    fn bottom(&self) -> i64 {
        self.rect.bottom()
    }

    fn next_pixel(&mut self) -> bool {
        if (self.x as i64 + 1) < self.right() {
            self.x += 1;
            true
        } else {
            false
        }
    }

    fn next_row(&mut self) -> bool {
        if (self.y as i64 + 1) < self.bottom() {
            self.y += 1;
            self.x = self.rect.x;
            true
        } else {
            false
        }
    }

    fn next_in_column(&mut self) -> bool {
        if (self.y as i64 + 1) < self.bottom() {
            self.y += 1;
            true
        } else {
            false
        }
    }

    fn next_column(&mut self) -> bool {
        if (self.x as i64 + 1) < self.right() {
            self.x += 1;
            self.y = self.rect.y;
            true
        } else {
            false
        }
    }
}

/// Pixels left before the cursor leaves the current tile along x, bounded
/// by the end of the row.
fn conseq_pixels_x(device: &PaintDevice, cursor: &Cursor) -> usize {
    let (sx, _) = device.to_store(cursor.x, cursor.y);
    let in_tile = TILE_SIZE - sx.rem_euclid(TILE_SIZE);
    let in_row = cursor.right() - cursor.x as i64;
    (in_tile as i64).min(in_row).max(0) as usize
}

macro_rules! const_reader {
    ($name:ident) => {
        impl<'a> $name<'a> {
            #[inline]
            pub fn x(&self) -> i32 {
                self.cursor.x
            }

            #[inline]
            pub fn y(&self) -> i32 {
                self.cursor.y
            }

            /// Bytes of the current pixel
            #[inline]
            pub fn old_raw_data(&self) -> &'a [u8] {
                self.device.pixel(self.cursor.x, self.cursor.y)
            }
        }
    };
}

macro_rules! mut_reader {
    ($name:ident) => {
        impl<'a> $name<'a> {
            #[inline]
            pub fn x(&self) -> i32 {
                self.cursor.x
            }

            #[inline]
            pub fn y(&self) -> i32 {
                self.cursor.y
            }

            /// Bytes of the current pixel as they are now
            #[inline]
            pub fn old_raw_data(&self) -> &[u8] {
                self.device.pixel(self.cursor.x, self.cursor.y)
            }

            /// Writable bytes of the current pixel; splits a shared tile
            pub fn raw_data(&mut self) -> Result<&mut [u8], TileError> {
                self.device.pixel_mut(self.cursor.x, self.cursor.y)
            }

            fn touch_current(&mut self) {
                let (sx, sy) = self.device.to_store(self.cursor.x, self.cursor.y);
                let index = TileIndex::containing(sx, sy);
                if self.last_touched != Some(index) {
                    self.device.touch_at(self.cursor.x, self.cursor.y);
                    self.last_touched = Some(index);
                }
            }
        }
    };
}

/// Read-only row-by-row iterator
pub struct HLineConstIterator<'a> {
    device: &'a PaintDevice,
    cursor: Cursor,
}

const_reader!(HLineConstIterator);

impl HLineConstIterator<'_> {
    /// Step right; false at the end of the row
    pub fn next_pixel(&mut self) -> bool {
        self.cursor.next_pixel()
    }

    /// Move to the start of the next row; false after the last row
    pub fn next_row(&mut self) -> bool {
        self.cursor.next_row()
    }

    /// Pixels that can be read contiguously from the current tile row
    pub fn n_conseq_pixels(&self) -> usize {
        conseq_pixels_x(self.device, &self.cursor)
    }
}

/// Read-only column-by-column iterator
pub struct VLineConstIterator<'a> {
    device: &'a PaintDevice,
    cursor: Cursor,
}

const_reader!(VLineConstIterator);

impl VLineConstIterator<'_> {
    /// Step down; false at the end of the column
    pub fn next_pixel(&mut self) -> bool {
        self.cursor.next_in_column()
    }

    /// Move to the top of the next column; false after the last column
    pub fn next_column(&mut self) -> bool {
        self.cursor.next_column()
    }
}

/// Read-only random access
pub struct RandomConstAccessor<'a> {
    device: &'a PaintDevice,
    cursor: Cursor,
}

const_reader!(RandomConstAccessor);

impl RandomConstAccessor<'_> {
    pub fn move_to(&mut self, x: i32, y: i32) {
        self.cursor.x = x;
        self.cursor.y = y;
    }
}

/// Writing row-by-row iterator
pub struct HLineIterator<'a> {
    device: &'a mut PaintDevice,
    cursor: Cursor,
    last_touched: Option<TileIndex>,
}

mut_reader!(HLineIterator);

impl HLineIterator<'_> {
    pub fn next_pixel(&mut self) -> bool {
        let moved = self.cursor.next_pixel();
        if moved {
            self.touch_current();
        }
        moved
    }

    pub fn next_row(&mut self) -> bool {
        let moved = self.cursor.next_row();
        if moved {
            self.touch_current();
        }
        moved
    }

    pub fn n_conseq_pixels(&self) -> usize {
        conseq_pixels_x(self.device, &self.cursor)
    }
}

/// Writing column-by-column iterator
pub struct VLineIterator<'a> {
    device: &'a mut PaintDevice,
    cursor: Cursor,
    last_touched: Option<TileIndex>,
}

mut_reader!(VLineIterator);

impl VLineIterator<'_> {
    pub fn next_pixel(&mut self) -> bool {
        let moved = self.cursor.next_in_column();
        if moved {
            self.touch_current();
        }
        moved
    }

    pub fn next_column(&mut self) -> bool {
        let moved = self.cursor.next_column();
        if moved {
            self.touch_current();
        }
        moved
    }
}

/// Writing random access
pub struct RandomAccessor<'a> {
    device: &'a mut PaintDevice,
    cursor: Cursor,
    last_touched: Option<TileIndex>,
}

mut_reader!(RandomAccessor);

impl RandomAccessor<'_> {
    pub fn move_to(&mut self, x: i32, y: i32) {
        self.cursor.x = x;
        self.cursor.y = y;
        self.touch_current();
    }
}

impl PaintDevice {
    pub fn create_hline_const_iterator(&self, rect: Rect) -> HLineConstIterator<'_> {
        HLineConstIterator {
            device: self,
            cursor: Cursor::new(rect),
        }
    }

    pub fn create_vline_const_iterator(&self, rect: Rect) -> VLineConstIterator<'_> {
        VLineConstIterator {
            device: self,
            cursor: Cursor::new(rect),
        }
    }

    pub fn create_random_const_accessor(&self) -> RandomConstAccessor<'_> {
        RandomConstAccessor {
            device: self,
            cursor: Cursor::new(Rect::EMPTY),
        }
    }

    /// Writing row iterator; the first tile is touched immediately
    pub fn create_hline_iterator(&mut self, rect: Rect) -> HLineIterator<'_> {
        let mut it = HLineIterator {
            device: self,
            cursor: Cursor::new(rect),
            last_touched: None,
        };
        if !rect.is_empty() {
            it.touch_current();
        }
        it
    }

    pub fn create_vline_iterator(&mut self, rect: Rect) -> VLineIterator<'_> {
        let mut it = VLineIterator {
            device: self,
            cursor: Cursor::new(rect),
            last_touched: None,
        };
        if !rect.is_empty() {
            it.touch_current();
        }
        it
    }

    pub fn create_random_accessor(&mut self) -> RandomAccessor<'_> {
        RandomAccessor {
            device: self,
            cursor: Cursor::new(Rect::EMPTY),
            last_touched: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::color::ColorSpace;
    use crate::device::PaintDevice;
    use crate::geometry::Rect;

    fn painted() -> PaintDevice {
        let mut device = PaintDevice::new(ColorSpace::Rgba8);
        device.fill(Rect::new(5, 5, 20, 20), &[1, 2, 3, 255]).unwrap();
        device
    }

    #[test]
    fn test_const_iterators_do_not_change_bounds() {
        let device = painted();
        let extent = device.extent();
        let bounds = device.exact_bounds();
        let far = Rect::new(-500, -500, 1200, 1200);

        let mut it = device.create_hline_const_iterator(far);
        let mut seen = 0usize;
        loop {
            loop {
                if it.old_raw_data()[3] != 0 {
                    seen += 1;
                }
                if !it.next_pixel() {
                    break;
                }
            }
            if !it.next_row() {
                break;
            }
        }
        assert_eq!(seen, 400);

        let mut vit = device.create_vline_const_iterator(far);
        while vit.next_column() {}
        let mut acc = device.create_random_const_accessor();
        acc.move_to(10_000, -10_000);
        assert_eq!(acc.old_raw_data(), &[0, 0, 0, 0]);

        assert_eq!(device.extent(), extent);
        assert_eq!(device.exact_bounds(), bounds);
        assert_eq!(device.tile_store().tile_count(), 1);
    }

    #[test]
    fn test_mut_iterator_touches_without_allocating() {
        let mut device = PaintDevice::new(ColorSpace::Rgba8);
        {
            let mut it = device.create_hline_iterator(Rect::new(0, 0, 130, 1));
            while it.next_pixel() {}
        }
        assert_eq!(device.extent(), Rect::new(0, 0, 192, 64));
        assert_eq!(device.pool().allocated_tiles(), 0);
        assert!(device.exact_bounds().is_empty());
    }

    #[test]
    fn test_mut_iterator_writes() {
        let mut device = PaintDevice::new(ColorSpace::Alpha8);
        {
            let mut it = device.create_vline_iterator(Rect::new(3, 0, 2, 3));
            loop {
                loop {
                    let value = (it.x() * 10 + it.y()) as u8;
                    it.raw_data().unwrap()[0] = value;
                    if !it.next_pixel() {
                        break;
                    }
                }
                if !it.next_column() {
                    break;
                }
            }
        }
        assert_eq!(device.pixel(3, 2), &[32]);
        assert_eq!(device.pixel(4, 0), &[40]);
        assert_eq!(device.exact_bounds(), Rect::new(3, 0, 2, 3));
    }

    #[test]
    fn test_random_accessor_touches_on_move() {
        let mut device = PaintDevice::new(ColorSpace::Alpha8);
        {
            let mut acc = device.create_random_accessor();
            acc.move_to(-1, -1);
            assert_eq!(acc.old_raw_data(), &[0]);
            acc.move_to(200, 5);
            acc.raw_data().unwrap()[0] = 5;
        }
        assert_eq!(device.extent(), Rect::new(-64, -64, 320, 128));
        assert_eq!(device.pixel(200, 5), &[5]);
    }

    #[test]
    fn test_conseq_pixels_stop_at_tile_edge() {
        let device = painted();
        let mut it = device.create_hline_const_iterator(Rect::new(60, 0, 10, 1));
        assert_eq!(it.n_conseq_pixels(), 4);
        for _ in 0..4 {
            it.next_pixel();
        }
        assert_eq!(it.n_conseq_pixels(), 6);
    }
}
