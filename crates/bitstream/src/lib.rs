//! `pj-bitstream` — H.264 access-unit reconstruction.
//!
//! Turns container packets into access units the hardware decoder will
//! accept: one picture per unit, parameter sets in front of the first IDR,
//! nothing before the first IDR.
//!
//! ## Module Overview
//!
//! - [`bit_reader`] — Exp-Golomb bit reader and RBSP unescaping, used to read
//!   `first_mb_in_slice`.
//! - [`nal`] — NAL unit types and a zero-copy Annex-B splitter.
//! - [`avcc`] — AVCC (length-prefixed) to Annex-B pre-filter.
//! - [`access_unit`] — access units and the accumulator that decides picture
//!   boundaries.
//! - [`gate`] — IDR gate, parameter-set header cache, canonical reordering.
//!
//! ## Usage
//!
//! ```ignore
//! use pj_bitstream::{AccessUnitAccumulator, GateVerdict, IdrGate};
//!
//! let mut accumulator = AccessUnitAccumulator::new(true);
//! let mut gate = IdrGate::new();
//! for unit in accumulator.push_packet(&packet) {
//!     if let GateVerdict::Forward(unit) = gate.admit(unit) {
//!         decoder.push(&unit);
//!     }
//! }
//! ```

pub mod access_unit;
pub mod avcc;
pub mod bit_reader;
pub mod gate;
pub mod nal;

pub use access_unit::{AccessUnit, AccessUnitAccumulator, NalCategories};
pub use avcc::{AnnexBFilter, AvccConfig};
pub use bit_reader::{first_mb_in_slice, unescape_rbsp, BitReader};
pub use gate::{DropReason, GateStats, GateVerdict, IdrGate};
pub use nal::{H264NalType, NalSplitter, NalView, ANNEXB_START_CODE};
