//! ShadowFS configuration

use serde::{Deserialize, Serialize};

use crate::background::CleanupConfig;
use crate::codec;
use crate::error::{Result, ShadowError};
use crate::fanout::FanoutConfig;

/// Settings for one shadowfs mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Longest physical name the backend accepts; longer logical names are split.
    pub max_filename_len: usize,
    /// Backend directory holding the physical segments.
    pub remote_path: String,
    /// Attach thumbnail references to listed files lacking one.
    pub thumbnail: bool,
    /// Directory (relative to each listed directory) holding pre-generated thumbnails.
    pub thumbnail_dir: String,
    /// Thumbnail file extension.
    pub thumbnail_ext: String,
    /// Show entries whose logical name starts with `hidden_prefix`.
    pub show_hidden: bool,
    pub hidden_prefix: String,
    /// Name prefix of clash index marker entries.
    pub clash_marker_prefix: String,
    pub fanout: FanoutConfig,
    pub cleanup: CleanupConfig,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            max_filename_len: 64,
            remote_path: "/".to_string(),
            thumbnail: false,
            thumbnail_dir: ".thumbnails".to_string(),
            thumbnail_ext: "webp".to_string(),
            show_hidden: true,
            hidden_prefix: ".".to_string(),
            clash_marker_prefix: ".sd_nindex_".to_string(),
            fanout: FanoutConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl ShadowConfig {
    /// Config with the given backend root and defaults elsewhere.
    pub fn new(remote_path: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ShadowConfig = toml::from_str(text).map_err(|e| ShadowError::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.remote_path.starts_with('/') {
            return Err(ShadowError::Config {
                reason: format!("remote_path must be absolute, got {:?}", self.remote_path),
            });
        }
        let min = codec::min_segment_len(0);
        if self.max_filename_len < min {
            return Err(ShadowError::Config {
                reason: format!("max_filename_len {} is below the minimum of {}", self.max_filename_len, min),
            });
        }
        if self.fanout.retry.max_attempts == 0 || self.cleanup.retry.max_attempts == 0 {
            return Err(ShadowError::Config {
                reason: "retry max_attempts must be at least 1".to_string(),
            });
        }
        if self.hidden_prefix.is_empty() {
            return Err(ShadowError::Config {
                reason: "hidden_prefix must not be empty".to_string(),
            });
        }
        if self.clash_marker_prefix.is_empty() {
            return Err(ShadowError::Config {
                reason: "clash_marker_prefix must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
