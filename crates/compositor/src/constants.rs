/// Width and height of a tile in pixels.
pub const TILE_SIZE: i32 = 64;

/// Number of pixels in one tile.
pub const TILE_PIXELS: usize = (TILE_SIZE * TILE_SIZE) as usize;

/// Fully opaque opacity value.
pub const OPACITY_OPAQUE: u8 = 255;

/// Fully transparent opacity value.
pub const OPACITY_TRANSPARENT: u8 = 0;

/// Pixel size of the largest supported color space, in bytes.
pub const MAX_PIXEL_SIZE: usize = 4;
