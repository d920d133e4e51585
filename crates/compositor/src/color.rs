//! Color space descriptors and per-channel enable flags

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Pixel layout of a paint device.
///
/// Colour management is out of scope; a color space only describes how many
/// bytes and channels a pixel has and where its alpha lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColorSpace {
    /// 8-bit RGBA, non-premultiplied
    #[default]
    Rgba8 = 0,
    /// Single 8-bit alpha channel, used by selections and masks
    Alpha8 = 1,
}

impl ColorSpace {
    /// Bytes per pixel
    #[inline]
    pub const fn pixel_size(self) -> usize {
        match self {
            ColorSpace::Rgba8 => 4,
            ColorSpace::Alpha8 => 1,
        }
    }

    #[inline]
    pub const fn channel_count(self) -> usize {
        match self {
            ColorSpace::Rgba8 => 4,
            ColorSpace::Alpha8 => 1,
        }
    }

    /// Byte offset of the alpha channel inside a pixel
    #[inline]
    pub const fn alpha_pos(self) -> usize {
        match self {
            ColorSpace::Rgba8 => 3,
            ColorSpace::Alpha8 => 0,
        }
    }

    /// The fully transparent pixel of this color space
    pub fn transparent(self) -> Vec<u8> {
        vec![0; self.pixel_size()]
    }

    /// Opacity of a pixel in this color space
    #[inline]
    pub fn opacity(self, pixel: &[u8]) -> u8 {
        pixel[self.alpha_pos()]
    }
}

/// Per-channel enable bitset.
///
/// An empty set of flags means "every channel enabled", the common case that
/// needs no per-channel work at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelFlags {
    bits: u32,
    len: u8,
}

impl ChannelFlags {
    /// Flags with every channel enabled
    pub const ALL: ChannelFlags = ChannelFlags { bits: 0, len: 0 };

    /// Explicit flags, one entry per channel
    pub fn from_slice(enabled: &[bool]) -> Self {
        let mut bits = 0;
        for (i, on) in enabled.iter().enumerate().take(32) {
            if *on {
                bits |= 1 << i;
            }
        }
        Self {
            bits,
            len: enabled.len().min(32) as u8,
        }
    }

    /// Every channel of `color_space` enabled except alpha (alpha lock)
    pub fn alpha_locked(color_space: ColorSpace) -> Self {
        let enabled: Vec<bool> = (0..color_space.channel_count())
            .map(|i| i != color_space.alpha_pos())
            .collect();
        Self::from_slice(&enabled)
    }

    #[inline]
    pub fn is_all(&self) -> bool {
        self.len == 0 || self.bits as u64 == (1u64 << self.len) - 1
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_enabled(&self, channel: usize) -> bool {
        self.len == 0 || (channel < self.len as usize && self.bits & (1 << channel) != 0)
    }

    /// Intersection of two flag sets; used when aggregating through
    /// pass-through parents.
    pub fn merged(&self, other: &ChannelFlags) -> ChannelFlags {
        match (self.len, other.len) {
            (0, _) => *other,
            (_, 0) => *self,
            (a, b) if a == b => ChannelFlags {
                bits: self.bits & other.bits,
                len: a,
            },
            _ => {
                warn!(
                    "Merging channel flags of different sizes ({} vs {}), keeping the first",
                    self.len, other.len
                );
                *self
            }
        }
    }

    /// Flags usable with `color_space`.
    ///
    /// A size mismatch is an invariant violation: it asserts in debug builds
    /// and falls back to all channels enabled otherwise.
    pub fn normalized_for(&self, color_space: ColorSpace) -> ChannelFlags {
        if self.len == 0 || self.len as usize == color_space.channel_count() {
            return *self;
        }
        debug_assert!(
            false,
            "channel flags of size {} used with {} channels",
            self.len,
            color_space.channel_count()
        );
        warn!(
            "Channel flags of size {} do not match {:?}, enabling all channels",
            self.len, color_space
        );
        ChannelFlags::ALL
    }
}
