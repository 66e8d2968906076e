//! Central error types for the playback core (thiserror-based).

use thiserror::Error;

use crate::codec::VideoCodec;
use crate::color::PixelFormat;

/// Bitstream parsing errors (slice headers, AVCC records).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("Bit reader ran past the end of {len} bytes")]
    EndOfData { len: usize },

    #[error("Invalid Exp-Golomb code: more than {leading_zeros} leading zero bits")]
    InvalidExpGolomb { leading_zeros: u32 },

    #[error("Unexpected avcC version: {0}")]
    UnsupportedAvccVersion(u8),

    #[error("Truncated data: expected {expected} bytes, got {got}")]
    TruncatedData { expected: usize, got: usize },

    #[error("Empty NAL unit")]
    EmptyNal,
}

/// Decoder boundary errors.
///
/// Transient refusals (busy, invalid data) are not errors; they are reported
/// through the decoder's push outcome instead.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Decoder open failed for {codec:?}: {reason}")]
    CodecOpen { codec: VideoCodec, reason: String },

    #[error("No usable output format among {offered:?}")]
    NoUsableFormat { offered: Vec<PixelFormat> },

    #[error("Decoder failed: {0}")]
    Backend(String),

    #[error("Decoder already reached end of stream")]
    EndOfStream,

    #[error("Bitstream error: {0}")]
    Bitstream(#[from] BitstreamError),
}

/// Display kernel boundary errors.
#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Failed to open display device {path}: {source}")]
    DeviceOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No connected display output")]
    NoConnectedOutput,

    #[error("Mode query failed: {0}")]
    ModeQuery(String),

    #[error("Could not acquire exclusive display ownership: {0}")]
    MasterAcquire(String),

    #[error("Display not initialized")]
    NotInitialized,

    #[error("Framebuffer registration failed for buffer {buffer}: {reason}")]
    FramebufferRegistration { buffer: u64, reason: String },

    #[error("Mode set failed on framebuffer {fb}: {reason}")]
    ModeSet { fb: u32, reason: String },

    #[error("Page flip queue failed on framebuffer {fb}: {reason}")]
    PageFlip { fb: u32, reason: String },

    #[error("Plane configuration failed on framebuffer {fb}: {reason}")]
    PlaneConfig { fb: u32, reason: String },

    #[error("Flip event poll failed: {0}")]
    EventPoll(#[from] std::io::Error),

    #[error("Failed to start overlay worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Configuration loading/validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_error_message() {
        assert_eq!(
            DisplayError::NoConnectedOutput.to_string(),
            "No connected display output"
        );
    }

    #[test]
    fn bitstream_error_nests_in_decode_error() {
        let err: DecodeError = BitstreamError::EmptyNal.into();
        assert_eq!(err.to_string(), "Bitstream error: Empty NAL unit");
    }
}
