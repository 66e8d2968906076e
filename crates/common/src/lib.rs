//! `pj-common` — Shared types, errors, and configuration for the scanout
//! playback core.
//!
//! Every other crate in the workspace depends on this one. It defines:
//!
//! - **Types**: `TimeCode`, `Resolution`, `Rect` (newtypes for safety)
//! - **Packets**: `VideoPacket`, `DecodedPicture`, `PicturePlane` (data flow types)
//! - **Formats**: `VideoCodec`, `PixelFormat`
//! - **Errors**: `BitstreamError`, `DecodeError`, `DisplayError`, `ConfigError` (thiserror-based)
//! - **Config**: `PlayerConfig` and its per-stage sections (serde-based)

pub mod codec;
pub mod color;
pub mod config;
pub mod error;
pub mod packet;
pub mod types;

// Re-export commonly used items at crate root
pub use codec::VideoCodec;
pub use color::PixelFormat;
pub use config::{BitstreamConfig, DecoderConfig, DisplayConfig, OverlayConfig, PlayerConfig};
pub use error::{BitstreamError, ConfigError, DecodeError, DisplayError};
pub use packet::{DecodedPicture, PicturePlane, VideoPacket};
pub use types::{Rect, Resolution, TimeCode};
