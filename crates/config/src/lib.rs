//! Shared configuration for impasto
//!
//! This crate provides the single source of truth for image dimensions,
//! tile memory limits, undo depth and scheduler tuning used by the
//! compositing core. Every struct deserializes with defaults for missing
//! fields, so partial JSON documents are valid.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default image width in pixels
pub const DEFAULT_WIDTH: u32 = 1920;

/// Default image height in pixels
pub const DEFAULT_HEIGHT: u32 = 1080;

/// Default number of undo steps kept on the undo stack
pub const DEFAULT_UNDO_LIMIT: usize = 50;

/// Default update:stroke interleaving ratio of the scheduler
pub const DEFAULT_BALANCING_RATIO: u32 = 100;

/// Default name of the scheduler worker thread
pub const DEFAULT_WORKER_NAME: &str = "impasto-stroke-worker";

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid image size {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },

    #[error("balancing ratio must be at least 1")]
    InvalidBalancingRatio,
}

/// Image-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Image width in pixels (the crop rect of every update)
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Maximum number of private tiles alive at once, `None` for unlimited
    pub tile_memory_limit: Option<usize>,
    /// Maximum depth of the undo stack
    pub undo_limit: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            tile_memory_limit: None,
            undo_limit: DEFAULT_UNDO_LIMIT,
        }
    }
}

impl ImageConfig {
    /// Create an image config with the given dimensions
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    /// Builder-style tile memory limit
    pub fn with_tile_memory_limit(mut self, tiles: usize) -> Self {
        self.tile_memory_limit = Some(tiles);
        self
    }

    /// Builder-style undo limit
    pub fn with_undo_limit(mut self, limit: usize) -> Self {
        self.undo_limit = limit;
        self
    }

    /// Image width as i32, saturating for absurd sizes
    pub fn width_i32(&self) -> i32 {
        i32::try_from(self.width).unwrap_or(i32::MAX)
    }

    /// Image height as i32, saturating for absurd sizes
    pub fn height_i32(&self) -> i32 {
        i32::try_from(self.height).unwrap_or(i32::MAX)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidImageSize {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

/// Stroke scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How many queued updates may run before one stroke job is let through
    pub balancing_ratio: u32,
    /// Name given to the background worker thread
    pub worker_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            balancing_ratio: DEFAULT_BALANCING_RATIO,
            worker_name: DEFAULT_WORKER_NAME.to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Balancing ratio clamped to at least one
    pub fn effective_ratio(&self) -> u32 {
        self.balancing_ratio.max(1)
    }
}

/// Complete configuration of the compositing core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub image: ImageConfig,
    pub scheduler: SchedulerConfig,
}

impl CoreConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check values that serde cannot reject on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.image.validate()?;
        if self.scheduler.balancing_ratio == 0 {
            return Err(ConfigError::InvalidBalancingRatio);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.image.width, DEFAULT_WIDTH);
        assert_eq!(config.image.height, DEFAULT_HEIGHT);
        assert_eq!(config.image.tile_memory_limit, None);
        assert_eq!(config.scheduler.balancing_ratio, DEFAULT_BALANCING_RATIO);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            CoreConfig::from_json_str(r#"{ "image": { "width": 640, "height": 480 } }"#).unwrap();
        assert_eq!(config.image.width, 640);
        assert_eq!(config.image.height, 480);
        assert_eq!(config.image.undo_limit, DEFAULT_UNDO_LIMIT);
        assert_eq!(config.scheduler.worker_name, DEFAULT_WORKER_NAME);
    }

    #[test]
    fn test_json_roundtrip_keeps_limits() {
        let mut config = CoreConfig::default();
        config.image = ImageConfig::new(256, 256).with_tile_memory_limit(12);
        let json = config.to_json_string().unwrap();
        assert_eq!(CoreConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_zero_sized_image() {
        let err = CoreConfig::from_json_str(r#"{ "image": { "width": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidImageSize { width: 0, .. }));
    }

    #[test]
    fn test_rejects_zero_ratio() {
        let err = CoreConfig::from_json_str(r#"{ "scheduler": { "balancing_ratio": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBalancingRatio));
        assert_eq!(SchedulerConfig { balancing_ratio: 0, ..Default::default() }.effective_ratio(), 1);
    }
}
