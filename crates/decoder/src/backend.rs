//! Decoder boundary.
//!
//! Any codec that accepts compressed units through `push` and hands back
//! pictures through `pull` can sit behind [`VideoDecoder`].

use pj_common::{DecodeError, DecodedPicture, PixelFormat, TimeCode, VideoCodec};

/// One push into the decoder.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DecoderInput<'a> {
    /// One access unit (H.264) or packet (H.265), Annex-B.
    Data {
        data: &'a [u8],
        pts: Option<TimeCode>,
        dts: Option<TimeCode>,
        is_keyframe: bool,
    },
    /// Empty push: flush buffered pictures out of the decoder.
    Drain,
}

impl DecoderInput<'_> {
    pub fn is_drain(&self) -> bool {
        matches!(self, Self::Drain)
    }
}

/// Result of a push the decoder did not fail on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Output must be drained first; push the same input again later.
    Busy,
    /// The decoder rejected the input as malformed. Expected occasionally
    /// (partial access units) and never fatal.
    InvalidData,
}

/// Result of a pull the decoder did not fail on.
#[derive(Clone, Debug)]
pub enum PullOutcome {
    Picture(DecodedPicture),
    NeedMoreInput,
    /// Every picture has been drained after a [`DecoderInput::Drain`].
    EndOfStream,
}

/// Push/pull video decoder.
///
/// `Err` from any method is fatal for the session. Transient refusals are
/// reported as [`PushOutcome`] values instead.
pub trait VideoDecoder: Send {
    /// The codec this decoder handles.
    fn codec(&self) -> VideoCodec;

    /// Output formats the decoder can produce, best first.
    fn offered_formats(&self) -> Vec<PixelFormat>;

    /// Open the codec with the negotiated output format.
    fn open(&mut self, format: PixelFormat) -> Result<(), DecodeError>;

    fn push(&mut self, input: DecoderInput<'_>) -> Result<PushOutcome, DecodeError>;

    fn pull(&mut self) -> Result<PullOutcome, DecodeError>;

    /// Discard buffered input and output (seek/restart).
    fn flush(&mut self) -> Result<(), DecodeError>;
}

impl<D: VideoDecoder + ?Sized> VideoDecoder for Box<D> {
    fn codec(&self) -> VideoCodec {
        (**self).codec()
    }

    fn offered_formats(&self) -> Vec<PixelFormat> {
        (**self).offered_formats()
    }

    fn open(&mut self, format: PixelFormat) -> Result<(), DecodeError> {
        (**self).open(format)
    }

    fn push(&mut self, input: DecoderInput<'_>) -> Result<PushOutcome, DecodeError> {
        (**self).push(input)
    }

    fn pull(&mut self) -> Result<PullOutcome, DecodeError> {
        (**self).pull()
    }

    fn flush(&mut self) -> Result<(), DecodeError> {
        (**self).flush()
    }
}
