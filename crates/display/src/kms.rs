//! Kernel mode-setting boundary.
//!
//! The traits here are the only place the playback core touches the
//! display driver. A production build backs them with DRM ioctls on a
//! card node; tests back them with recording fakes.

use std::time::Duration;

use pj_common::{DisplayError, PixelFormat, Rect, Resolution};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identity of an external buffer object (GEM handle or dma-buf inode).
///
/// Two buffers with the same id are the same memory; the framebuffer
/// caches key on it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Kernel framebuffer object id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

impl std::fmt::Display for FramebufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fb:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Layout of one plane of a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    /// GEM handle of the memory holding this plane.
    pub handle: u32,
    pub pitch: u32,
    pub offset: u32,
}

/// Everything the kernel needs to create a framebuffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub resolution: Resolution,
    pub fourcc: u32,
    pub planes: Vec<PlaneLayout>,
}

/// A composited, ready-to-scan-out buffer lent by the renderer.
///
/// Not `Clone`: every buffer handed to the display is given back to the
/// [`RenderSurface`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct ScanoutBuffer {
    pub id: BufferId,
    pub handle: u32,
    pub resolution: Resolution,
    pub pitch: u32,
    pub format: PixelFormat,
}

impl ScanoutBuffer {
    pub fn framebuffer_desc(&self) -> FramebufferDesc {
        FramebufferDesc {
            resolution: self.resolution,
            fourcc: self.format.drm_fourcc(),
            planes: vec![PlaneLayout {
                handle: self.handle,
                pitch: self.pitch,
                offset: 0,
            }],
        }
    }
}

/// A decoded frame exported for zero-copy scanout on the overlay plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmaBufFrame {
    pub id: BufferId,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub planes: Vec<PlaneLayout>,
}

impl DmaBufFrame {
    pub fn framebuffer_desc(&self) -> FramebufferDesc {
        FramebufferDesc {
            resolution: self.resolution,
            fourcc: self.format.drm_fourcc(),
            planes: self.planes.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Output description
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayMode {
    pub name: String,
    pub resolution: Resolution,
    pub refresh_hz: u32,
}

/// The connector/CRTC pair playback drives, with its preferred mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputConfig {
    pub connector_id: u32,
    pub crtc_id: u32,
    pub mode: DisplayMode,
}

/// A completed page flip.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlipEvent {
    pub crtc_id: u32,
    pub sequence: u32,
    /// Vblank timestamp as reported by the kernel.
    pub timestamp: Duration,
}

/// One overlay-plane configuration request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlaneUpdate {
    pub fb: FramebufferId,
    /// Destination on the CRTC.
    pub dest: Rect,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A display device opened for exclusive (master) access.
pub trait KmsDevice {
    /// Enumerate connectors/encoders/CRTCs, acquire master and pick the
    /// connected output's preferred mode.
    ///
    /// # Errors
    /// `DeviceOpen`, `NoConnectedOutput`, `MasterAcquire`, `ModeQuery`.
    fn open_output(&mut self) -> Result<OutputConfig, DisplayError>;

    fn add_framebuffer(&mut self, desc: &FramebufferDesc) -> Result<FramebufferId, DisplayError>;

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<(), DisplayError>;

    /// Synchronous mode-set scanning out `fb`.
    fn set_crtc(&mut self, output: &OutputConfig, fb: FramebufferId) -> Result<(), DisplayError>;

    /// Queue an asynchronous flip to `fb`; completion arrives through
    /// [`KmsDevice::poll_flip_event`].
    fn queue_page_flip(
        &mut self,
        output: &OutputConfig,
        fb: FramebufferId,
    ) -> Result<(), DisplayError>;

    /// Wait up to `timeout` for one flip completion. A zero timeout never
    /// blocks.
    fn poll_flip_event(&mut self, timeout: Duration) -> Result<Option<FlipEvent>, DisplayError>;

    /// Give up exclusive ownership.
    fn drop_master(&mut self) -> Result<(), DisplayError>;
}

/// The renderer side that owns scanout buffers.
pub trait RenderSurface {
    /// Give a buffer back for reuse.
    fn release(&mut self, buffer: ScanoutBuffer);

    /// Tear the rendering surface down.
    fn destroy(&mut self);
}

/// Overlay-plane configuration, called from the overlay worker only.
pub trait PlaneCommit: Send {
    fn set_plane(&mut self, update: &PlaneUpdate) -> Result<(), DisplayError>;
}

impl<P: PlaneCommit + ?Sized> PlaneCommit for Box<P> {
    fn set_plane(&mut self, update: &PlaneUpdate) -> Result<(), DisplayError> {
        (**self).set_plane(update)
    }
}
