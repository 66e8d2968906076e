//! `pj-decoder` — Decode feeding.
//!
//! Drives an external push/pull video decoder with access units rebuilt by
//! `pj-bitstream`, and drains decoded pictures for the render stage.
//!
//! # Architecture
//!
//! The decoder itself is a black box behind the [`VideoDecoder`] trait:
//! a hardware codec, a software fallback or a test fake. The
//! [`DecodeFeeder`] owns the bitstream pre-filter, the access-unit
//! accumulator and the IDR gate, and turns the decoder's refusal codes into
//! retry/skip decisions so the caller only sees pictures.
//!
//! ## Module Overview
//!
//! - [`backend`] — Decoder boundary trait and its push/pull outcomes
//! - [`negotiate`] — Output pixel format selection
//! - [`throttle`] — Rate limiting for repeated diagnostics
//! - [`feeder`] — The decode feeder
//!
//! ## Usage
//!
//! ```ignore
//! use pj_decoder::{DecodeFeeder, DecodeStep};
//!
//! let mut feeder = DecodeFeeder::new(decoder, &config.decoder, &config.bitstream, &extradata)?;
//! feeder.submit_packet(&packet)?;
//! while let DecodeStep::Picture(picture) = feeder.decode_step()? {
//!     render(&picture);
//! }
//! ```

pub mod backend;
pub mod feeder;
pub mod negotiate;
pub mod throttle;

pub use backend::{DecoderInput, PullOutcome, PushOutcome, VideoDecoder};
pub use feeder::{DecodeFeeder, DecodeStep, FeederStats};
pub use negotiate::negotiate_format;
pub use throttle::LogThrottle;
