//! Configuration structs for the bitstream, decoder, display, and overlay
//! stages.
//!
//! Every section implements `Default` and is `#[serde(default)]`, so a JSON
//! file only needs to name the values it changes.

use serde::{Deserialize, Serialize};

use crate::codec::VideoCodec;
use crate::color::PixelFormat;
use crate::error::ConfigError;

/// Default framebuffer cache capacity (per scanout path).
pub const DEFAULT_FB_CACHE_CAPACITY: usize = 8;

/// Default bounded wait for the overlay worker to exit.
pub const DEFAULT_OVERLAY_SHUTDOWN_MS: u64 = 100;

/// Top-level player configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub bitstream: BitstreamConfig,
    pub decoder: DecoderConfig,
    pub display: DisplayConfig,
    pub overlay: OverlayConfig,
}

impl PlayerConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.display.framebuffer_cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "display.framebuffer_cache_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        if self.overlay.framebuffer_cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "overlay.framebuffer_cache_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        if self.decoder.invalid_data_log_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "decoder.invalid_data_log_interval",
                reason: "must be > 0".to_string(),
            });
        }
        if self.display.device_path.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "display.device_path",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Access-unit reconstruction settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitstreamConfig {
    /// Finalize the pending access unit at the end of every packet.
    ///
    /// Container samples carry exactly one access unit, so this is on by
    /// default. Turn it off for raw Annex-B input read in arbitrary chunks
    /// of whole NAL units.
    pub finalize_on_packet_end: bool,
}

impl Default for BitstreamConfig {
    fn default() -> Self {
        Self {
            finalize_on_packet_end: true,
        }
    }
}

/// Decoder session settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub codec: VideoCodec,
    /// Output formats in order of preference. The first one the decoder
    /// offers wins; otherwise the decoder's first offer is used.
    pub preferred_formats: Vec<PixelFormat>,
    /// Log one diagnostic per this many consecutive invalid-data refusals.
    pub invalid_data_log_interval: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            preferred_formats: vec![PixelFormat::Nv12, PixelFormat::Yuv420p],
            invalid_data_log_interval: 30,
        }
    }
}

/// Primary-plane scanout settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// DRM card node.
    pub device_path: String,
    pub framebuffer_cache_capacity: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/dri/card0".to_string(),
            framebuffer_cache_capacity: DEFAULT_FB_CACHE_CAPACITY,
        }
    }
}

/// Overlay-plane (zero-copy video) settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub enabled: bool,
    /// Bounded wait for the overlay worker on shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
    pub framebuffer_cache_capacity: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            shutdown_timeout_ms: DEFAULT_OVERLAY_SHUTDOWN_MS,
            framebuffer_cache_capacity: DEFAULT_FB_CACHE_CAPACITY,
        }
    }
}
