//! `pj-player` — Playback session orchestration.
//!
//! Wires a packet source, the decode feeder, a renderer and the display
//! paths into one sequential loop:
//!
//! ```text
//! read packet → reconstruct → feed/drain → render → present
//!                                                  ├─ primary plane (page flip)
//!                                                  └─ overlay plane (worker)
//! ```
//!
//! Decoder, display device, renderer and packet source are external
//! collaborators, reached through traits.
//!
//! ## Module Overview
//!
//! - [`config`] — Loading `PlayerConfig` from JSON files
//! - [`session`] — The playback session and its collaborator traits
//! - [`telemetry`] — `tracing` subscriber setup

pub mod config;
pub mod session;
pub mod telemetry;

pub use session::{
    FrameRenderer, PacketSource, PlaybackSession, RenderedFrame, SessionStats, SessionStep,
};
