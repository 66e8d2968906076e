//! Pixel formats exchanged with the decoder and the display controller.

use serde::{Deserialize, Serialize};

/// Pixel format of a decoded picture or a scanout buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// NV12: Y plane + interleaved UV at half resolution (HW decoder output).
    Nv12,
    /// I420: Y, U and V planes, chroma at half resolution.
    Yuv420p,
    /// P010: 10-bit NV12 variant (HDR content).
    P010,
    /// 32-bit RGB, unused alpha byte (primary plane scanout).
    Xrgb8888,
    /// 32-bit RGB with alpha.
    Argb8888,
}

impl PixelFormat {
    /// DRM fourcc code used when registering a framebuffer of this format.
    pub fn drm_fourcc(self) -> u32 {
        let code = match self {
            Self::Nv12 => *b"NV12",
            Self::Yuv420p => *b"YU12",
            Self::P010 => *b"P010",
            Self::Xrgb8888 => *b"XR24",
            Self::Argb8888 => *b"AR24",
        };
        u32::from_le_bytes(code)
    }
}
