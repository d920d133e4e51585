//! Copy-on-write tile storage for paint devices
//!
//! A [`TileStore`] is a sparse hash grid of [`Tile`]s. Tiles share their
//! pixel buffers through `Arc`; the only place a buffer is ever copied is
//! [`TileStore::ensure_writable`] (or its region form
//! [`TileStore::prepare_writable`]). A tile that still points at the store's
//! default buffer is a "lazy default tile" and owns no memory.

mod memento;
mod pool;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::constants::{TILE_PIXELS, TILE_SIZE};
use crate::geometry::Rect;

pub use memento::Memento;
pub use pool::TilePool;

use memento::MementoBuilder;

/// Errors raised by tile storage
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TileError {
    #[error("tile pool exhausted: requested {requested} tiles, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("pixel buffer holds {actual} bytes, region needs {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Column/row address of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileIndex {
    pub col: i32,
    pub row: i32,
}

impl TileIndex {
    pub const fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }

    /// The tile containing pixel `(x, y)` in store coordinates
    #[inline]
    pub fn containing(x: i32, y: i32) -> Self {
        Self {
            col: x.div_euclid(TILE_SIZE),
            row: y.div_euclid(TILE_SIZE),
        }
    }

    /// Pixel rect covered by this tile
    pub fn rect(&self) -> Rect {
        let size = TILE_SIZE as i64;
        let left = self.col as i64 * size;
        let top = self.row as i64 * size;
        Rect::from_edges(left, top, left + size, top + size)
    }
}

/// Every tile index overlapping `rect`, row by row
pub fn tiles_in_rect(rect: Rect) -> impl Iterator<Item = TileIndex> {
    let (cols, rows) = if rect.is_empty() {
        (1..=0, 1..=0)
    } else {
        let last_x = (rect.right() - 1).min(i32::MAX as i64) as i32;
        let last_y = (rect.bottom() - 1).min(i32::MAX as i64) as i32;
        let first = TileIndex::containing(rect.x, rect.y);
        let last = TileIndex::containing(last_x, last_y);
        (first.col..=last.col, first.row..=last.row)
    };
    rows.flat_map(move |row| cols.clone().map(move |col| TileIndex { col, row }))
}

/// Bounding box of touched tile indices.
///
/// Starts at the `i32::MAX`/`i32::MIN` sentinels, which read as empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileExtent {
    min_col: i32,
    min_row: i32,
    max_col: i32,
    max_row: i32,
}

impl Default for TileExtent {
    fn default() -> Self {
        Self {
            min_col: i32::MAX,
            min_row: i32::MAX,
            max_col: i32::MIN,
            max_row: i32::MIN,
        }
    }
}

impl TileExtent {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min_col > self.max_col || self.min_row > self.max_row
    }

    /// Widen the box to include `index`
    #[inline]
    pub fn update(&mut self, index: TileIndex) {
        self.min_col = self.min_col.min(index.col);
        self.min_row = self.min_row.min(index.row);
        self.max_col = self.max_col.max(index.col);
        self.max_row = self.max_row.max(index.row);
    }

    pub fn contains(&self, index: TileIndex) -> bool {
        !self.is_empty()
            && (self.min_col..=self.max_col).contains(&index.col)
            && (self.min_row..=self.max_row).contains(&index.row)
    }

    /// Tile-aligned pixel rect, zero-sized when empty
    pub fn rect(&self) -> Rect {
        if self.is_empty() {
            return Rect::EMPTY;
        }
        let size = TILE_SIZE as i64;
        Rect::from_edges(
            self.min_col as i64 * size,
            self.min_row as i64 * size,
            (self.max_col as i64 + 1) * size,
            (self.max_row as i64 + 1) * size,
        )
    }
}

pub(crate) struct TileBuffer {
    data: Box<[u8]>,
    pool: Option<TilePool>,
}

impl Drop for TileBuffer {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            pool.release(1);
        }
    }
}

/// A fixed-size block of pixels with a shared, reference-counted payload
#[derive(Clone)]
pub struct Tile {
    buffer: Arc<TileBuffer>,
}

impl Tile {
    fn filled(pixel: &[u8]) -> Self {
        Self {
            buffer: Arc::new(TileBuffer {
                data: pixel.repeat(TILE_PIXELS).into_boxed_slice(),
                pool: None,
            }),
        }
    }

    /// Private copy of `data`; the pool slot must already be reserved
    fn reserved_copy(data: &[u8], pool: &TilePool) -> Self {
        Self {
            buffer: Arc::new(TileBuffer {
                data: data.into(),
                pool: Some(pool.clone()),
            }),
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buffer.data
    }

    /// True when both tiles point at the same buffer
    #[inline]
    pub fn ptr_eq(&self, other: &Tile) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Number of holders of this tile's buffer
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buffer)
    }

    /// True when the buffer has a pool slot, i.e. it is not a default buffer
    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.buffer.pool.is_some()
    }

    #[inline]
    fn is_private(&self) -> bool {
        self.is_allocated() && Arc::strong_count(&self.buffer) == 1
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("ref_count", &self.ref_count())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

/// Sparse tile grid with a default pixel and memento support
pub struct TileStore {
    tiles: HashMap<TileIndex, Tile>,
    default_tile: Tile,
    pixel_size: usize,
    extent: TileExtent,
    pool: TilePool,
    transaction: Option<MementoBuilder>,
}

impl TileStore {
    /// Create an empty store whose untouched pixels read as `default_pixel`
    pub fn new(default_pixel: &[u8], pool: TilePool) -> Self {
        Self {
            tiles: HashMap::new(),
            default_tile: Tile::filled(default_pixel),
            pixel_size: default_pixel.len(),
            extent: TileExtent::default(),
            pool,
            transaction: None,
        }
    }

    #[inline]
    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    #[inline]
    pub fn pool(&self) -> &TilePool {
        &self.pool
    }

    /// Bytes per tile row
    #[inline]
    pub fn row_stride(&self) -> usize {
        TILE_SIZE as usize * self.pixel_size
    }

    #[inline]
    pub fn default_pixel(&self) -> &[u8] {
        &self.default_tile.data()[..self.pixel_size]
    }

    /// Change the pixel untouched regions read as
    pub fn set_default_pixel(&mut self, pixel: &[u8]) {
        debug_assert_eq!(pixel.len(), self.pixel_size);
        let new_default = Tile::filled(pixel);
        if let Some(builder) = self.transaction.as_mut() {
            builder.record_default(&self.default_tile);
        }
        self.default_tile = new_default;
    }

    #[inline]
    pub fn extent(&self) -> TileExtent {
        self.extent
    }

    #[inline]
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    #[inline]
    pub fn contains(&self, index: TileIndex) -> bool {
        self.tiles.contains_key(&index)
    }

    /// The stored tile at `index`, if any
    #[inline]
    pub fn get(&self, index: TileIndex) -> Option<&Tile> {
        self.tiles.get(&index)
    }

    /// Read access to a tile; absent tiles read as the default tile and are
    /// never created.
    #[inline]
    pub fn tile(&self, index: TileIndex) -> &Tile {
        self.tiles.get(&index).unwrap_or(&self.default_tile)
    }

    #[inline]
    pub fn is_default_tile(&self, tile: &Tile) -> bool {
        tile.ptr_eq(&self.default_tile)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TileIndex, &Tile)> {
        self.tiles.iter()
    }

    /// Create the lazy default tile at `index` if absent and widen the extent.
    ///
    /// No pixel memory is allocated here.
    pub fn touch(&mut self, index: TileIndex) {
        if let Some(builder) = self.transaction.as_mut() {
            builder.record(index, self.tiles.get(&index));
        }
        if !self.tiles.contains_key(&index) {
            self.tiles.insert(index, self.default_tile.clone());
        }
        self.extent.update(index);
    }

    /// True when writing to `index` would not copy
    pub fn is_writable(&self, index: TileIndex) -> bool {
        self.tiles.get(&index).is_some_and(Tile::is_private)
    }

    /// Copy-on-write boundary for a single tile.
    ///
    /// Shared and lazy default tiles get a private copy from the pool; private
    /// tiles are returned as-is.
    pub fn ensure_writable(&mut self, index: TileIndex) -> Result<&mut [u8], TileError> {
        self.prepare_tiles(&[index])?;
        Ok(self.writable_data(index).unwrap_or_default())
    }

    /// Make every tile overlapping `rect` (store coordinates) writable, or
    /// fail without changing anything.
    pub fn prepare_writable(&mut self, rect: Rect) -> Result<(), TileError> {
        let indices: Vec<TileIndex> = tiles_in_rect(rect).collect();
        self.prepare_tiles(&indices)
    }

    pub(crate) fn prepare_tiles(&mut self, indices: &[TileIndex]) -> Result<(), TileError> {
        // Recording into an open transaction shares the current buffer, so it
        // has to happen before counting the copies needed.
        if let Some(builder) = self.transaction.as_mut() {
            for index in indices {
                builder.record(*index, self.tiles.get(index));
            }
        }
        let needed = indices.iter().filter(|i| !self.is_writable(**i)).count();
        self.pool.acquire(needed)?;
        if needed > 1 {
            trace!("Reserved {} private tiles", needed);
        }
        for index in indices {
            self.touch(*index);
            self.make_private(*index);
        }
        Ok(())
    }

    /// Replace a shared buffer with a private copy. The pool slot for the copy
    /// must already be reserved.
    fn make_private(&mut self, index: TileIndex) {
        let pool = self.pool.clone();
        if let Some(tile) = self.tiles.get_mut(&index) {
            if !tile.is_private() {
                *tile = Tile::reserved_copy(tile.data(), &pool);
            }
        }
    }

    /// Mutable bytes of a tile that is already private
    pub(crate) fn writable_data(&mut self, index: TileIndex) -> Option<&mut [u8]> {
        let tile = self.tiles.get_mut(&index)?;
        if tile.buffer.pool.is_none() {
            return None;
        }
        Arc::get_mut(&mut tile.buffer).map(|buffer| &mut buffer.data[..])
    }

    /// Put `tile` at `index`, sharing its buffer
    pub(crate) fn share_tile(&mut self, index: TileIndex, tile: &Tile) {
        self.touch(index);
        self.tiles.insert(index, tile.clone());
    }

    /// Drop every tile and reset the extent to the empty sentinel
    pub fn clear(&mut self) {
        if let Some(builder) = self.transaction.as_mut() {
            for (index, tile) in &self.tiles {
                builder.record(*index, Some(tile));
            }
        }
        self.tiles.clear();
        self.extent = TileExtent::default();
    }

    fn recalculate_extent(&mut self) {
        let mut extent = TileExtent::default();
        for index in self.tiles.keys() {
            extent.update(*index);
        }
        self.extent = extent;
    }

    pub fn begin_transaction(&mut self) {
        if self.transaction.is_some() {
            tracing::warn!("Tile transaction already open, continuing the existing one");
            return;
        }
        self.transaction = Some(MementoBuilder::default());
    }

    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Close the open transaction and return its memento
    pub fn commit_transaction(&mut self) -> Option<Memento> {
        let builder = self.transaction.take()?;
        Some(builder.finish(&self.tiles, &self.default_tile))
    }

    /// Restore the state the memento was recorded from
    pub fn rollback(&mut self, memento: &Memento) {
        memento.apply(&mut self.tiles, &mut self.default_tile, false);
        self.recalculate_extent();
    }

    /// Re-apply the state the memento was committed with
    pub fn rollforward(&mut self, memento: &Memento) {
        memento.apply(&mut self.tiles, &mut self.default_tile, true);
        self.recalculate_extent();
    }
}

impl Clone for TileStore {
    /// Rough clone: tiles are shared, an open transaction is not carried over
    fn clone(&self) -> Self {
        Self {
            tiles: self.tiles.clone(),
            default_tile: self.default_tile.clone(),
            pixel_size: self.pixel_size,
            extent: self.extent,
            pool: self.pool.clone(),
            transaction: None,
        }
    }
}

impl fmt::Debug for TileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileStore")
            .field("tiles", &self.tiles.len())
            .field("extent", &self.extent.rect())
            .field("pixel_size", &self.pixel_size)
            .field("in_transaction", &self.transaction.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TileStore {
        TileStore::new(&[0, 0, 0, 0], TilePool::unlimited())
    }

    #[test]
    fn test_empty_extent_is_zero_sized() {
        let store = store();
        assert!(store.extent().is_empty());
        assert_eq!(store.extent().rect(), Rect::EMPTY);
    }

    #[test]
    fn test_read_never_creates() {
        let store = store();
        let tile = store.tile(TileIndex::new(3, 4));
        assert!(store.is_default_tile(tile));
        assert_eq!(store.tile_count(), 0);
    }

    #[test]
    fn test_touch_creates_lazy_tile_without_memory() {
        let mut store = store();
        store.touch(TileIndex::new(1, 1));
        assert_eq!(store.tile_count(), 1);
        assert_eq!(store.pool().allocated_tiles(), 0);
        assert_eq!(store.extent().rect(), Rect::new(64, 64, 64, 64));
    }

    #[test]
    fn test_ensure_writable_splits_shared_tiles() {
        let mut store = store();
        store.ensure_writable(TileIndex::new(0, 0)).unwrap()[0] = 7;
        let snapshot = store.clone();
        assert!(store.tile(TileIndex::new(0, 0)).ptr_eq(snapshot.tile(TileIndex::new(0, 0))));

        store.ensure_writable(TileIndex::new(0, 0)).unwrap()[0] = 9;
        assert!(!store.tile(TileIndex::new(0, 0)).ptr_eq(snapshot.tile(TileIndex::new(0, 0))));
        assert_eq!(snapshot.tile(TileIndex::new(0, 0)).data()[0], 7);
        assert_eq!(store.tile(TileIndex::new(0, 0)).data()[0], 9);
        assert_eq!(store.pool().allocated_tiles(), 2);
    }

    #[test]
    fn test_private_tile_is_not_copied_again() {
        let mut store = store();
        store.ensure_writable(TileIndex::new(0, 0)).unwrap();
        store.ensure_writable(TileIndex::new(0, 0)).unwrap();
        assert_eq!(store.pool().allocated_tiles(), 1);
    }

    #[test]
    fn test_extreme_indices_do_not_overflow() {
        let mut store = store();
        let low = TileIndex::containing(i32::MIN, i32::MIN);
        let high = TileIndex::containing(i32::MAX, i32::MAX);
        store.touch(low);
        store.touch(high);
        let rect = store.extent().rect();
        assert_eq!(rect.x, i32::MIN);
        assert_eq!(high.rect().right(), i32::MAX as i64 + 1);
        assert_eq!(tiles_in_rect(Rect::new(i32::MAX - 1, 0, 1, 1)).count(), 1);
    }

    #[test]
    fn test_prepare_writable_is_all_or_nothing() {
        let mut store = TileStore::new(&[0], TilePool::with_limit(3));
        let err = store.prepare_writable(Rect::new(0, 0, 128, 128)).unwrap_err();
        assert!(matches!(err, TileError::OutOfMemory { requested: 4, .. }));
        assert_eq!(store.tile_count(), 0);
        assert!(store.extent().is_empty());

        store.prepare_writable(Rect::new(0, 0, 64, 128)).unwrap();
        assert_eq!(store.pool().allocated_tiles(), 2);
    }

    #[test]
    fn test_dropping_store_releases_pool() {
        let pool = TilePool::unlimited();
        {
            let mut store = TileStore::new(&[0], pool.clone());
            store.prepare_writable(Rect::new(0, 0, 200, 10)).unwrap();
            assert_eq!(pool.allocated_tiles(), 4);
        }
        assert_eq!(pool.allocated_tiles(), 0);
    }

    #[test]
    fn test_clear_resets_extent() {
        let mut store = store();
        store.touch(TileIndex::new(5, 5));
        store.clear();
        assert!(store.extent().is_empty());
        assert_eq!(store.tile_count(), 0);
    }
}
