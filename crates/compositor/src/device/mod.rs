//! Paint devices: sparse, effectively infinite rasters backed by tiles
//!
//! A [`PaintDevice`] maps image coordinates onto a [`TileStore`] through an
//! integer origin offset. Reads of untouched regions return the default pixel
//! without creating tiles; writes go through the store's copy-on-write
//! boundary and always widen the extent to whole tiles.

mod bounds;
mod iterators;
mod painter;

use std::fmt;
use std::sync::OnceLock;

use glam::IVec2;
use tracing::warn;

use crate::color::ColorSpace;
use crate::constants::TILE_SIZE;
use crate::geometry::Rect;
use crate::tiles::{Memento, TileError, TileIndex, TilePool, TileStore, tiles_in_rect};

pub use iterators::{
    HLineConstIterator, HLineIterator, RandomAccessor, RandomConstAccessor, VLineConstIterator,
    VLineIterator,
};

/// Part of a store-space rect that falls inside one tile
#[derive(Debug, Clone, Copy)]
pub(crate) struct TilePart {
    pub index: TileIndex,
    /// Rect inside the tile, in tile-local pixels
    pub local: Rect,
    /// Store coordinates of `local`'s top-left pixel
    pub origin: IVec2,
}

pub(crate) fn tile_parts(store_rect: Rect) -> impl Iterator<Item = TilePart> {
    tiles_in_rect(store_rect).filter_map(move |index| {
        let tile_rect = index.rect();
        let part = store_rect & tile_rect;
        if part.is_empty() {
            return None;
        }
        Some(TilePart {
            index,
            local: part.translated(-tile_rect.x, -tile_rect.y),
            origin: part.top_left(),
        })
    })
}

#[inline]
pub(crate) fn local_offset(local_x: i32, local_y: i32, pixel_size: usize) -> usize {
    (local_y as usize * TILE_SIZE as usize + local_x as usize) * pixel_size
}

/// A sparse 2D raster with a default pixel, origin offset and color space
///
/// `Clone` is a rough clone: the copy shares every tile with the original
/// until one side writes to it.
#[derive(Clone)]
pub struct PaintDevice {
    store: TileStore,
    color_space: ColorSpace,
    offset: IVec2,
    exact_bounds_cache: OnceLock<Rect>,
}

impl PaintDevice {
    /// Transparent device in its own unlimited pool
    pub fn new(color_space: ColorSpace) -> Self {
        Self::with_pool(color_space, TilePool::unlimited())
    }

    /// Transparent device whose tiles are accounted in `pool`
    pub fn with_pool(color_space: ColorSpace, pool: TilePool) -> Self {
        Self::with_default_pixel(color_space, &color_space.transparent(), pool)
    }

    pub fn with_default_pixel(color_space: ColorSpace, default_pixel: &[u8], pool: TilePool) -> Self {
        debug_assert_eq!(default_pixel.len(), color_space.pixel_size());
        Self {
            store: TileStore::new(default_pixel, pool),
            color_space,
            offset: IVec2::ZERO,
            exact_bounds_cache: OnceLock::new(),
        }
    }

    /// Empty device with the same color space, default pixel, offset and pool
    pub fn empty_like(&self) -> Self {
        let mut device =
            Self::with_default_pixel(self.color_space, self.default_pixel(), self.pool().clone());
        device.offset = self.offset;
        device
    }

    #[inline]
    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    #[inline]
    pub fn pixel_size(&self) -> usize {
        self.color_space.pixel_size()
    }

    #[inline]
    pub fn pool(&self) -> &TilePool {
        self.store.pool()
    }

    #[inline]
    pub fn tile_store(&self) -> &TileStore {
        &self.store
    }

    #[inline]
    pub fn x(&self) -> i32 {
        self.offset.x
    }

    #[inline]
    pub fn y(&self) -> i32 {
        self.offset.y
    }

    #[inline]
    pub fn offset(&self) -> IVec2 {
        self.offset
    }

    /// Translate the logical origin; tile data does not move
    pub fn set_x(&mut self, x: i32) {
        self.move_to(IVec2::new(x, self.offset.y));
    }

    pub fn set_y(&mut self, y: i32) {
        self.move_to(IVec2::new(self.offset.x, y));
    }

    pub fn move_to(&mut self, offset: IVec2) {
        self.offset = offset;
        self.invalidate_bounds();
    }

    #[inline]
    pub fn default_pixel(&self) -> &[u8] {
        self.store.default_pixel()
    }

    pub fn set_default_pixel(&mut self, pixel: &[u8]) {
        self.store.set_default_pixel(pixel);
        self.invalidate_bounds();
    }

    /// Tile-aligned bounding rect of every touched tile, in image coordinates
    pub fn extent(&self) -> Rect {
        self.store.extent().rect().translated_by(self.offset)
    }

    #[inline]
    pub(crate) fn invalidate_bounds(&mut self) {
        self.exact_bounds_cache.take();
    }

    #[inline]
    pub(crate) fn to_store(&self, x: i32, y: i32) -> (i32, i32) {
        (
            x.saturating_sub(self.offset.x),
            y.saturating_sub(self.offset.y),
        )
    }

    #[inline]
    pub(crate) fn store_rect(&self, rect: Rect) -> Rect {
        rect.translated(-self.offset.x, -self.offset.y)
    }

    /// Pixel at `(x, y)`; untouched regions read as the default pixel
    pub fn pixel(&self, x: i32, y: i32) -> &[u8] {
        let (sx, sy) = self.to_store(x, y);
        let index = TileIndex::containing(sx, sy);
        let ps = self.pixel_size();
        let start = local_offset(
            sx - index.col * TILE_SIZE,
            sy - index.row * TILE_SIZE,
            ps,
        );
        &self.store.tile(index).data()[start..start + ps]
    }

    /// Mutable pixel at `(x, y)`, splitting the tile if it is shared
    pub(crate) fn pixel_mut(&mut self, x: i32, y: i32) -> Result<&mut [u8], TileError> {
        let (sx, sy) = self.to_store(x, y);
        let index = TileIndex::containing(sx, sy);
        let ps = self.pixel_size();
        self.invalidate_bounds();
        let data = self.store.ensure_writable(index)?;
        let start = local_offset(
            sx - index.col * TILE_SIZE,
            sy - index.row * TILE_SIZE,
            ps,
        );
        Ok(&mut data[start..start + ps])
    }

    pub fn set_pixel(&mut self, x: i32, y: i32, pixel: &[u8]) -> Result<(), TileError> {
        let ps = self.pixel_size();
        self.pixel_mut(x, y)?.copy_from_slice(&pixel[..ps]);
        Ok(())
    }

    /// Mark the tile under `(x, y)` as touched without allocating it
    pub(crate) fn touch_at(&mut self, x: i32, y: i32) -> TileIndex {
        let (sx, sy) = self.to_store(x, y);
        let index = TileIndex::containing(sx, sy);
        self.store.touch(index);
        self.invalidate_bounds();
        index
    }

    /// Make every tile under `rect` writable up front, or fail untouched
    pub(crate) fn prepare_rect(&mut self, rect: Rect) -> Result<(), TileError> {
        let store_rect = self.store_rect(rect);
        self.store.prepare_writable(store_rect)?;
        self.invalidate_bounds();
        Ok(())
    }

    /// Set every pixel of `rect` to `pixel`.
    ///
    /// The extent always grows to the tile-aligned superset of `rect`, even
    /// when `pixel` equals the default pixel. All-or-nothing under memory
    /// pressure.
    pub fn fill(&mut self, rect: Rect, pixel: &[u8]) -> Result<(), TileError> {
        if rect.is_empty() {
            return Ok(());
        }
        let ps = self.pixel_size();
        if pixel.len() < ps {
            return Err(TileError::SizeMismatch {
                expected: ps,
                actual: pixel.len(),
            });
        }
        self.prepare_rect(rect)?;
        let pixel = &pixel[..ps];
        for part in tile_parts(self.store_rect(rect)) {
            let Some(data) = self.store.writable_data(part.index) else {
                warn!("Tile {:?} not writable after preparation", part.index);
                continue;
            };
            for ly in part.local.y..part.local.y + part.local.height {
                let start = local_offset(part.local.x, ly, ps);
                let end = start + part.local.width as usize * ps;
                for chunk in data[start..end].chunks_exact_mut(ps) {
                    chunk.copy_from_slice(pixel);
                }
            }
        }
        Ok(())
    }

    /// Drop all content; the extent returns to the empty sentinel
    pub fn clear(&mut self) {
        self.store.clear();
        self.invalidate_bounds();
    }

    /// Reset `rect` to the default pixel
    pub fn clear_rect(&mut self, rect: Rect) -> Result<(), TileError> {
        let default = self.default_pixel().to_vec();
        self.fill(rect, &default)
    }

    /// Copy one row of `out.len() / pixel_size` pixels starting at `(x, y)`
    pub(crate) fn read_row_into(&self, x: i32, y: i32, out: &mut [u8]) {
        let ps = self.pixel_size();
        let (mut sx, sy) = self.to_store(x, y);
        let mut written = 0;
        while written < out.len() {
            let index = TileIndex::containing(sx, sy);
            let lx = sx - index.col * TILE_SIZE;
            let ly = sy - index.row * TILE_SIZE;
            let run = ((TILE_SIZE - lx) as usize * ps).min(out.len() - written);
            let start = local_offset(lx, ly, ps);
            out[written..written + run]
                .copy_from_slice(&self.store.tile(index).data()[start..start + run]);
            written += run;
            sx = sx.saturating_add((run / ps) as i32);
        }
    }

    /// Raw pixel bytes of `rect`, row-major
    pub fn read_bytes(&self, rect: Rect) -> Vec<u8> {
        if rect.is_empty() {
            return Vec::new();
        }
        let ps = self.pixel_size();
        let row_len = rect.width as usize * ps;
        let mut out = vec![0; row_len * rect.height as usize];
        for (row, chunk) in out.chunks_exact_mut(row_len).enumerate() {
            self.read_row_into(rect.x, rect.y + row as i32, chunk);
        }
        out
    }

    /// Write row-major pixel bytes into `rect`. All-or-nothing.
    pub fn write_bytes(&mut self, rect: Rect, bytes: &[u8]) -> Result<(), TileError> {
        if rect.is_empty() {
            return Ok(());
        }
        let ps = self.pixel_size();
        let expected = rect.area() as usize * ps;
        if bytes.len() != expected {
            return Err(TileError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        self.prepare_rect(rect)?;
        let store_rect = self.store_rect(rect);
        let row_len = rect.width as usize * ps;
        for part in tile_parts(store_rect) {
            let Some(data) = self.store.writable_data(part.index) else {
                continue;
            };
            let src_x = (part.origin.x - store_rect.x) as usize * ps;
            let run = part.local.width as usize * ps;
            for dy in 0..part.local.height {
                let src_row = (part.origin.y - store_rect.y + dy) as usize;
                let src = &bytes[src_row * row_len + src_x..][..run];
                let start = local_offset(part.local.x, part.local.y + dy, ps);
                data[start..start + run].copy_from_slice(src);
            }
        }
        Ok(())
    }

    /// Visit every pixel of `rect` read-only
    pub fn for_each_pixel(&self, rect: Rect, mut f: impl FnMut(i32, i32, &[u8])) {
        let ps = self.pixel_size();
        let mut row = vec![0; rect.width.max(0) as usize * ps];
        for y in rect.y..rect.y.saturating_add(rect.height.max(0)) {
            self.read_row_into(rect.x, y, &mut row);
            for (i, px) in row.chunks_exact(ps).enumerate() {
                f(rect.x + i as i32, y, px);
            }
        }
    }

    /// Visit every pixel of `rect` mutably. Tiles are prepared first, so
    /// either every pixel is visited or the call fails before any write.
    pub fn for_each_pixel_mut(
        &mut self,
        rect: Rect,
        mut f: impl FnMut(i32, i32, &mut [u8]),
    ) -> Result<(), TileError> {
        if rect.is_empty() {
            return Ok(());
        }
        self.prepare_rect(rect)?;
        let ps = self.pixel_size();
        let offset = self.offset;
        for part in tile_parts(self.store_rect(rect)) {
            let Some(data) = self.store.writable_data(part.index) else {
                continue;
            };
            for dy in 0..part.local.height {
                let start = local_offset(part.local.x, part.local.y + dy, ps);
                let end = start + part.local.width as usize * ps;
                let y = part.origin.y + dy + offset.y;
                for (i, px) in data[start..end].chunks_exact_mut(ps).enumerate() {
                    f(part.origin.x + i as i32 + offset.x, y, px);
                }
            }
        }
        Ok(())
    }

    /// Copy `rect` from `src` (same coordinates). Whole tiles are shared
    /// when both devices are aligned; partial tiles are copied.
    pub fn copy_rect_from(&mut self, src: &PaintDevice, rect: Rect) -> Result<(), TileError> {
        if rect.is_empty() {
            return Ok(());
        }
        debug_assert_eq!(self.color_space, src.color_space);
        if self.offset != src.offset || self.pixel_size() != src.pixel_size() {
            let bytes = src.read_bytes(rect);
            return self.write_bytes(rect, &bytes);
        }

        let store_rect = self.store_rect(rect);
        let (full, partial): (Vec<TilePart>, Vec<TilePart>) = tile_parts(store_rect)
            .partition(|part| part.local == Rect::new(0, 0, TILE_SIZE, TILE_SIZE));

        let partial_indices: Vec<TileIndex> = partial.iter().map(|part| part.index).collect();
        self.store.prepare_tiles(&partial_indices)?;
        self.invalidate_bounds();

        for part in &full {
            let tile = src.store.tile(part.index).clone();
            self.store.share_tile(part.index, &tile);
        }

        let ps = self.pixel_size();
        for part in &partial {
            let source = src.store.tile(part.index).data();
            let Some(data) = self.store.writable_data(part.index) else {
                continue;
            };
            for dy in 0..part.local.height {
                let start = local_offset(part.local.x, part.local.y + dy, ps);
                let end = start + part.local.width as usize * ps;
                data[start..end].copy_from_slice(&source[start..end]);
            }
        }
        Ok(())
    }

    /// Copy `rect` so that `self(p) == src(p - shift)` for every `p` in `rect`
    pub fn copy_translated_from(
        &mut self,
        src: &PaintDevice,
        rect: Rect,
        shift: IVec2,
    ) -> Result<(), TileError> {
        if shift == IVec2::ZERO {
            return self.copy_rect_from(src, rect);
        }
        let bytes = src.read_bytes(rect.translated(-shift.x, -shift.y));
        self.write_bytes(rect, &bytes)
    }

    /// Pixel-wise equality over the union of both extents
    pub fn content_eq(&self, other: &PaintDevice) -> bool {
        if self.color_space != other.color_space || self.default_pixel() != other.default_pixel() {
            return false;
        }
        let area = self.extent() | other.extent();
        self.read_bytes(area) == other.read_bytes(area)
    }

    /// Open a memento transaction on the underlying tile store
    pub fn begin_transaction(&mut self) {
        self.store.begin_transaction();
    }

    pub fn in_transaction(&self) -> bool {
        self.store.in_transaction()
    }

    pub fn end_transaction(&mut self) -> Option<Memento> {
        self.store.commit_transaction()
    }

    pub fn rollback(&mut self, memento: &Memento) {
        self.store.rollback(memento);
        self.invalidate_bounds();
    }

    pub fn rollforward(&mut self, memento: &Memento) {
        self.store.rollforward(memento);
        self.invalidate_bounds();
    }

    /// Image-space rect covered by a memento recorded on this device
    pub fn memento_rect(&self, memento: &Memento) -> Rect {
        memento.extent().rect().translated_by(self.offset)
    }
}

impl fmt::Debug for PaintDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaintDevice")
            .field("color_space", &self.color_space)
            .field("offset", &self.offset)
            .field("extent", &self.extent())
            .field("tiles", &self.store.tile_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: [u8; 4] = [255, 0, 0, 255];

    #[test]
    fn test_fill_extent_and_exact_bounds() {
        let mut device = PaintDevice::new(ColorSpace::Rgba8);
        device.fill(Rect::new(10, 10, 130, 130), &RED).unwrap();
        assert_eq!(device.extent(), Rect::new(0, 0, 192, 192));
        assert_eq!(device.exact_bounds(), Rect::new(10, 10, 130, 130));
    }

    #[test]
    fn test_fill_with_default_pixel_still_extends() {
        let mut device = PaintDevice::new(ColorSpace::Rgba8);
        device.fill(Rect::new(70, 0, 4, 4), &[0, 0, 0, 0]).unwrap();
        assert_eq!(device.extent(), Rect::new(64, 0, 64, 64));
        assert!(device.exact_bounds().is_empty());
    }

    #[test]
    fn test_extent_grows_monotonically_until_clear() {
        let mut device = PaintDevice::new(ColorSpace::Alpha8);
        let mut written = Rect::EMPTY;
        for rect in [
            Rect::new(0, 0, 5, 5),
            Rect::new(-100, 40, 10, 10),
            Rect::new(300, 300, 1, 1),
            Rect::new(2, 2, 1, 1),
        ] {
            let before = device.extent();
            device.fill(rect, &[9]).unwrap();
            written |= rect;
            assert!(device.extent().contains(&written.aligned_to(TILE_SIZE)));
            assert!(device.extent().contains(&before));
        }
        device.clear();
        assert_eq!(device.extent(), Rect::EMPTY);
    }

    #[test]
    fn test_read_write_bytes() {
        let mut device = PaintDevice::new(ColorSpace::Alpha8);
        let rect = Rect::new(60, 60, 8, 2);
        let bytes: Vec<u8> = (0..16).collect();
        device.write_bytes(rect, &bytes).unwrap();
        assert_eq!(device.read_bytes(rect), bytes);
        assert_eq!(device.pixel(63, 61), &[11]);
        assert_eq!(device.pixel(0, 0), &[0]);
        assert!(matches!(
            device.write_bytes(rect, &bytes[..3]),
            Err(TileError::SizeMismatch { expected: 16, actual: 3 })
        ));
    }

    #[test]
    fn test_offset_moves_content_without_touching_tiles() {
        let mut device = PaintDevice::new(ColorSpace::Rgba8);
        device.set_pixel(1, 1, &RED).unwrap();
        let tiles = device.tile_store().tile_count();
        device.set_x(100);
        device.set_y(-5);
        assert_eq!(device.pixel(101, -4), &RED);
        assert_eq!(device.extent(), Rect::new(100, -5, 64, 64));
        assert_eq!(device.exact_bounds(), Rect::new(101, -4, 1, 1));
        assert_eq!(device.tile_store().tile_count(), tiles);
    }

    #[test]
    fn test_rough_clone_shares_then_diverges() {
        let mut source = PaintDevice::new(ColorSpace::Rgba8);
        source.fill(Rect::new(0, 0, 64, 64), &RED).unwrap();
        let mut a = source.clone();
        let b = source.clone();
        let index = TileIndex::new(0, 0);
        assert!(a.tile_store().tile(index).ptr_eq(b.tile_store().tile(index)));

        a.set_pixel(3, 3, &[0, 0, 255, 255]).unwrap();
        assert!(!a.tile_store().tile(index).ptr_eq(b.tile_store().tile(index)));
        assert_eq!(b.pixel(3, 3), &RED);
        assert_eq!(a.pixel(3, 3), &[0, 0, 255, 255]);
        assert!(b.content_eq(&source));
        assert!(!a.content_eq(&source));
    }

    #[test]
    fn test_fill_fails_cleanly_when_pool_exhausted() {
        let pool = TilePool::with_limit(2);
        let mut device = PaintDevice::with_pool(ColorSpace::Rgba8, pool.clone());
        device.fill(Rect::new(0, 0, 10, 10), &RED).unwrap();
        let before = device.clone();
        let err = device.fill(Rect::new(0, 0, 200, 10), &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, TileError::OutOfMemory { .. }));
        assert!(device.content_eq(&before));
        assert_eq!(device.extent(), Rect::new(0, 0, 64, 64));
    }

    #[test]
    fn test_copy_rect_shares_whole_tiles() {
        let mut src = PaintDevice::new(ColorSpace::Rgba8);
        src.fill(Rect::new(0, 0, 128, 64), &RED).unwrap();
        let mut dst = PaintDevice::new(ColorSpace::Rgba8);
        dst.copy_rect_from(&src, Rect::new(0, 0, 100, 64)).unwrap();
        let full = TileIndex::new(0, 0);
        assert!(dst.tile_store().tile(full).ptr_eq(src.tile_store().tile(full)));
        assert_eq!(dst.pixel(99, 10), &RED);
        assert_eq!(dst.pixel(100, 10), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_copy_translated() {
        let mut src = PaintDevice::new(ColorSpace::Alpha8);
        src.set_pixel(5, 5, &[77]).unwrap();
        let mut dst = PaintDevice::new(ColorSpace::Alpha8);
        dst.copy_translated_from(&src, Rect::new(0, 0, 64, 64), IVec2::new(10, 20))
            .unwrap();
        assert_eq!(dst.pixel(15, 25), &[77]);
        assert_eq!(dst.exact_bounds(), Rect::new(15, 25, 1, 1));
    }

    #[test]
    fn test_transaction_rollback_restores_content() {
        let mut device = PaintDevice::new(ColorSpace::Rgba8);
        device.fill(Rect::new(0, 0, 10, 10), &RED).unwrap();
        let before = device.clone();
        device.begin_transaction();
        device.fill(Rect::new(5, 5, 100, 10), &[0, 255, 0, 255]).unwrap();
        let memento = device.end_transaction().unwrap();
        assert_eq!(device.memento_rect(&memento), Rect::new(0, 0, 128, 64));

        device.rollback(&memento);
        assert!(device.content_eq(&before));
        assert_eq!(device.extent(), before.extent());
        device.rollforward(&memento);
        assert_eq!(device.pixel(100, 10), &[0, 255, 0, 255]);
    }
}
