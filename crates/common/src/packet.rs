//! Encoded packets (demuxer output) and decoded pictures (decoder output).

use crate::codec::VideoCodec;
use crate::color::PixelFormat;
use crate::types::{Resolution, TimeCode};

/// Video packet as delivered by the container layer.
///
/// `data` is Annex-B (start-code delimited) once the bitstream pre-filter
/// has run. A packet may carry several NAL units and, for raw elementary
/// streams, more than one access unit.
#[derive(Clone, Debug)]
pub struct VideoPacket {
    pub data: Vec<u8>,
    /// Presentation timestamp, if the container supplied one.
    pub pts: Option<TimeCode>,
    /// Decode timestamp, if the container supplied one.
    pub dts: Option<TimeCode>,
    /// Container keyframe marker.
    pub is_keyframe: bool,
    pub codec: VideoCodec,
}

impl VideoPacket {
    /// A packet without timing information (raw elementary stream input).
    pub fn untimed(data: Vec<u8>, codec: VideoCodec) -> Self {
        Self {
            data,
            pts: None,
            dts: None,
            is_keyframe: false,
            codec,
        }
    }
}

/// One plane of a decoded picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PicturePlane {
    pub data: Vec<u8>,
    /// Row stride in bytes (may exceed the visible width).
    pub stride: u32,
}

/// A decoded picture in host memory, handed to the rendering stage.
#[derive(Clone, Debug)]
pub struct DecodedPicture {
    pub planes: Vec<PicturePlane>,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub pts: Option<TimeCode>,
    /// Whether the picture came from an IDR access unit.
    pub is_keyframe: bool,
}

impl DecodedPicture {
    /// Total bytes across all planes.
    pub fn byte_size(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }
}
