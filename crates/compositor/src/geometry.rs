//! Integer rectangles in image space

use glam::IVec2;
use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Axis-aligned integer rectangle. Right and bottom edges are exclusive.
///
/// A rect with non-positive width or height is empty. All edge arithmetic is
/// carried out in `i64` and clamped back, so rects touching the far ends of
/// the `i32` range never overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

fn clamp_i32(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

impl Rect {
    pub const EMPTY: Rect = Rect::new(0, 0, 0, 0);

    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a rect from its edges, right and bottom exclusive
    pub fn from_edges(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        if right <= left || bottom <= top {
            return Self::EMPTY;
        }
        let x = clamp_i32(left);
        let y = clamp_i32(top);
        Self {
            x,
            y,
            width: clamp_i32(right - x as i64),
            height: clamp_i32(bottom - y as i64),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    #[inline]
    pub fn left(&self) -> i64 {
        self.x as i64
    }

    #[inline]
    pub fn top(&self) -> i64 {
        self.y as i64
    }

    /// Exclusive right edge
    #[inline]
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    /// Exclusive bottom edge
    #[inline]
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    #[inline]
    pub fn top_left(&self) -> IVec2 {
        IVec2::new(self.x, self.y)
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        !self.is_empty()
            && (x as i64) >= self.left()
            && (x as i64) < self.right()
            && (y as i64) >= self.top()
            && (y as i64) < self.bottom()
    }

    /// True when `other` lies entirely inside this rect. Empty rects are
    /// contained in everything.
    pub fn contains(&self, other: &Rect) -> bool {
        if other.is_empty() {
            return true;
        }
        !self.is_empty()
            && other.left() >= self.left()
            && other.right() <= self.right()
            && other.top() >= self.top()
            && other.bottom() <= self.bottom()
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersected(other).is_empty()
    }

    pub fn intersected(&self, other: &Rect) -> Rect {
        if self.is_empty() || other.is_empty() {
            return Self::EMPTY;
        }
        Self::from_edges(
            self.left().max(other.left()),
            self.top().max(other.top()),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        )
    }

    pub fn united(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Self::from_edges(
            self.left().min(other.left()),
            self.top().min(other.top()),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Rect {
        if self.is_empty() {
            return *self;
        }
        Self::from_edges(
            self.left() + dx as i64,
            self.top() + dy as i64,
            self.right() + dx as i64,
            self.bottom() + dy as i64,
        )
    }

    #[inline]
    pub fn translated_by(&self, offset: IVec2) -> Rect {
        self.translated(offset.x, offset.y)
    }

    /// Move each edge independently: left/top by `dl`/`dt`, right/bottom by `dr`/`db`
    pub fn adjusted(&self, dl: i32, dt: i32, dr: i32, db: i32) -> Rect {
        if self.is_empty() {
            return *self;
        }
        Self::from_edges(
            self.left() + dl as i64,
            self.top() + dt as i64,
            self.right() + dr as i64,
            self.bottom() + db as i64,
        )
    }

    /// Grow the rect by `radius` on every side
    #[inline]
    pub fn grown(&self, radius: i32) -> Rect {
        self.adjusted(-radius, -radius, radius, radius)
    }

    /// Smallest rect aligned to a grid of `step` that contains this rect
    pub fn aligned_to(&self, step: i32) -> Rect {
        if self.is_empty() {
            return *self;
        }
        let step = step as i64;
        Self::from_edges(
            self.left().div_euclid(step) * step,
            self.top().div_euclid(step) * step,
            (self.right() + step - 1).div_euclid(step) * step,
            (self.bottom() + step - 1).div_euclid(step) * step,
        )
    }

    /// Iterate over every `(x, y)` inside the rect, row by row
    pub fn points(&self) -> impl Iterator<Item = (i32, i32)> + use<> {
        let rect = *self;
        let (rows, cols) = if rect.is_empty() {
            (0..0, 0..0)
        } else {
            (rect.y..clamp_i32(rect.bottom()), rect.x..clamp_i32(rect.right()))
        };
        rows.flat_map(move |y| cols.clone().map(move |x| (x, y)))
    }
}

impl BitOr for Rect {
    type Output = Rect;

    fn bitor(self, rhs: Rect) -> Rect {
        self.united(&rhs)
    }
}

impl BitOrAssign for Rect {
    fn bitor_assign(&mut self, rhs: Rect) {
        *self = self.united(&rhs);
    }
}

impl BitAnd for Rect {
    type Output = Rect;

    fn bitand(self, rhs: Rect) -> Rect {
        self.intersected(&rhs)
    }
}
