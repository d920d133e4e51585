//! Tile memory accounting

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::TileError;

struct PoolInner {
    limit: Option<usize>,
    allocated: AtomicUsize,
}

/// Accounts every private tile buffer of an image.
///
/// Cloning a pool yields another handle to the same counter. A pool with a
/// limit refuses reservations that would exceed it, which is how memory
/// pressure is modelled.
#[derive(Clone)]
pub struct TilePool {
    inner: Arc<PoolInner>,
}

impl TilePool {
    /// A pool without a tile limit
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// A pool that holds at most `tiles` private buffers
    pub fn with_limit(tiles: usize) -> Self {
        Self::new(Some(tiles))
    }

    pub fn new(limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                limit,
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    #[inline]
    pub fn limit(&self) -> Option<usize> {
        self.inner.limit
    }

    /// Number of private tile buffers currently alive
    #[inline]
    pub fn allocated_tiles(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    /// Reserve `count` tiles at once, or none of them
    pub(crate) fn acquire(&self, count: usize) -> Result<(), TileError> {
        if count == 0 {
            return Ok(());
        }
        let limit = self.inner.limit;
        self.inner
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(count)?;
                match limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .map(|_| ())
            .map_err(|current| TileError::OutOfMemory {
                requested: count,
                available: limit.map_or(usize::MAX, |limit| limit.saturating_sub(current)),
            })
    }

    pub(crate) fn release(&self, count: usize) {
        self.inner.allocated.fetch_sub(count, Ordering::AcqRel);
    }

    #[inline]
    pub fn same_pool(&self, other: &TilePool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for TilePool {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Debug for TilePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TilePool")
            .field("limit", &self.inner.limit)
            .field("allocated", &self.allocated_tiles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_all_or_nothing() {
        let pool = TilePool::with_limit(4);
        pool.acquire(3).unwrap();
        let err = pool.acquire(2).unwrap_err();
        assert!(matches!(
            err,
            TileError::OutOfMemory {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(pool.allocated_tiles(), 3);
        pool.release(3);
        assert_eq!(pool.allocated_tiles(), 0);
    }

    #[test]
    fn test_clones_share_counter() {
        let pool = TilePool::unlimited();
        let other = pool.clone();
        other.acquire(5).unwrap();
        assert_eq!(pool.allocated_tiles(), 5);
        assert!(pool.same_pool(&other));
    }
}
