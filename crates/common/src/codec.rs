//! Video codec identifiers.

use serde::{Deserialize, Serialize};

/// Video codec identifier.
///
/// Only the two codecs the appliance's hardware decoder accepts are modelled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
}

impl VideoCodec {
    /// Human-readable codec name (for display/logging).
    pub fn display_name(self) -> &'static str {
        match self {
            Self::H264 => "H.264/AVC",
            Self::H265 => "H.265/HEVC",
        }
    }

    /// Whether access units for this codec are rebuilt from individual NAL
    /// units before they reach the decoder.
    ///
    /// H.265 packets are forwarded as the container delivered them.
    pub fn reconstructs_access_units(self) -> bool {
        matches!(self, Self::H264)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_display() {
        assert_eq!(VideoCodec::H264.display_name(), "H.264/AVC");
        assert_eq!(VideoCodec::H265.display_name(), "H.265/HEVC");
    }

    #[test]
    fn only_h264_is_reconstructed() {
        assert!(VideoCodec::H264.reconstructs_access_units());
        assert!(!VideoCodec::H265.reconstructs_access_units());
    }
}
