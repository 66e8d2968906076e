//! `pj-display` — Direct scanout through the kernel mode-setting API.
//!
//! # Architecture
//!
//! The primary plane is driven by the [`DisplayScheduler`]: one synchronous
//! mode-set on the first frame, then asynchronous page flips with at most
//! one outstanding. Frames produced faster than vsync are skipped instead
//! of queued, so the decode loop never blocks on the display.
//!
//! The optional overlay plane is driven by an [`OverlayPath`] whose
//! [`OverlayCommitter`] worker performs the slow plane-configuration call
//! off the main loop. Producers only ever touch a single-slot mailbox.
//!
//! Kernel access goes through the [`KmsDevice`] and [`PlaneCommit`] traits;
//! rendered buffers are handed back through [`RenderSurface`].
//!
//! ## Module Overview
//!
//! - [`kms`] — Kernel boundary traits and buffer/framebuffer types
//! - [`fb_cache`] — Bounded buffer → framebuffer id table
//! - [`scheduler`] — Primary-plane page-flip state machine
//! - [`overlay`] — Overlay mailbox, worker, and overlay path

pub mod fb_cache;
pub mod kms;
pub mod overlay;
pub mod scheduler;

pub use fb_cache::FramebufferCache;
pub use kms::{
    BufferId, DisplayMode, DmaBufFrame, FlipEvent, FramebufferDesc, FramebufferId, KmsDevice,
    OutputConfig, PlaneCommit, PlaneLayout, PlaneUpdate, RenderSurface, ScanoutBuffer,
};
pub use overlay::{OverlayCommitter, OverlayPath, OverlayStats, ShutdownOutcome};
pub use scheduler::{DisplayScheduler, PresentOutcome, ScanoutState, SchedulerStats};
