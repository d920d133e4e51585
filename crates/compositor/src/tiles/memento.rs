//! Tile-level diffs used by undo

use std::collections::HashMap;
use std::fmt;

use super::{Tile, TileExtent, TileIndex};

/// Collects the pre-change state of every tile touched during a transaction
#[derive(Default)]
pub(crate) struct MementoBuilder {
    old_tiles: HashMap<TileIndex, Option<Tile>>,
    order: Vec<TileIndex>,
    extent: TileExtent,
    old_default: Option<Tile>,
}

impl MementoBuilder {
    /// Record `current` as the old state of `index` unless already recorded
    pub(crate) fn record(&mut self, index: TileIndex, current: Option<&Tile>) {
        if self.old_tiles.contains_key(&index) {
            return;
        }
        self.old_tiles.insert(index, current.cloned());
        self.order.push(index);
        self.extent.update(index);
    }

    pub(crate) fn record_default(&mut self, current: &Tile) {
        if self.old_default.is_none() {
            self.old_default = Some(current.clone());
        }
    }

    pub(crate) fn finish(
        mut self,
        tiles: &HashMap<TileIndex, Tile>,
        default_tile: &Tile,
    ) -> Memento {
        let items = self
            .order
            .iter()
            .map(|index| MementoItem {
                index: *index,
                old: self.old_tiles.remove(index).flatten(),
                new: tiles.get(index).cloned(),
            })
            .collect();
        Memento {
            items,
            extent: self.extent,
            default_change: self
                .old_default
                .map(|old| (old, default_tile.clone())),
        }
    }
}

#[derive(Clone)]
struct MementoItem {
    index: TileIndex,
    old: Option<Tile>,
    new: Option<Tile>,
}

/// Old and new tiles of one transaction, plus the running extent of the
/// touched tile indices.
///
/// Both sides hold shared references to tile buffers, so a memento costs one
/// private copy per tile that was actually modified, never a full image copy.
#[derive(Clone)]
pub struct Memento {
    items: Vec<MementoItem>,
    extent: TileExtent,
    default_change: Option<(Tile, Tile)>,
}

impl Memento {
    /// Bounding box of the tiles this memento covers
    #[inline]
    pub fn extent(&self) -> TileExtent {
        self.extent
    }

    #[inline]
    pub fn tile_count(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn changes_default_pixel(&self) -> bool {
        self.default_change.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.default_change.is_none()
    }

    /// Write the old (`forward == false`) or new side back into a tile map
    pub(crate) fn apply(
        &self,
        tiles: &mut HashMap<TileIndex, Tile>,
        default_tile: &mut Tile,
        forward: bool,
    ) {
        if let Some((old, new)) = &self.default_change {
            *default_tile = if forward { new.clone() } else { old.clone() };
        }
        for item in &self.items {
            let state = if forward { &item.new } else { &item.old };
            match state {
                Some(tile) => {
                    tiles.insert(item.index, tile.clone());
                }
                None => {
                    tiles.remove(&item.index);
                }
            }
        }
    }
}

impl fmt::Debug for Memento {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memento")
            .field("tiles", &self.items.len())
            .field("extent", &self.extent.rect())
            .field("default_change", &self.default_change.is_some())
            .finish()
    }
}
