//! Primary-plane page-flip scheduling.
//!
//! ## States
//!
//! ```text
//! Uninitialized --initialize()--> ModeNotSet --present() ok--> Steady { flip_pending }
//! ```
//!
//! - `ModeNotSet`: the first presented buffer goes through a synchronous
//!   mode-set and becomes `current`.
//! - `Steady`: every `present()` first polls the flip event source with a
//!   zero timeout and processes at most one completion. If a flip is still
//!   outstanding the new buffer is released at once and the call reports
//!   [`PresentOutcome::Skipped`]; otherwise a flip to it is queued and it
//!   becomes `next`.
//! - A completion releases the old `current` and promotes `next`.
//!
//! At most one flip is ever outstanding, and no framebuffer is removed while
//! `current` or `next` refers to it.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use pj_common::{DisplayConfig, DisplayError};

use crate::fb_cache::FramebufferCache;
use crate::kms::{FlipEvent, FramebufferId, KmsDevice, OutputConfig, RenderSurface, ScanoutBuffer};

/// How long teardown waits for an outstanding flip before removing its
/// framebuffer anyway.
const TEARDOWN_FLIP_WAIT: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanoutState {
    Uninitialized,
    ModeNotSet,
    Steady { flip_pending: bool },
    TornDown,
}

/// What `present()` did with the buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    /// First frame: mode-set done, the buffer is on screen.
    ModeSet,
    /// Page flip queued; the buffer is `next`.
    FlipQueued,
    /// A flip was still pending; the buffer was released unused.
    Skipped,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Buffers that reached the screen path (mode-set or queued flip).
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub flips_completed: u64,
}

// ---------------------------------------------------------------------------
// Scanout slots
// ---------------------------------------------------------------------------

/// A buffer on (or about to be on) screen, with its framebuffer.
#[derive(Debug)]
struct ScanoutSlot {
    buffer: ScanoutBuffer,
    fb: FramebufferId,
    /// The framebuffer belongs to the cache and outlives the slot.
    cached: bool,
}

// ---------------------------------------------------------------------------
// DisplayScheduler
// ---------------------------------------------------------------------------

/// Double-buffered scanout on the primary plane.
///
/// Main-loop only; nothing here is shared with another thread.
pub struct DisplayScheduler<K: KmsDevice, S: RenderSurface> {
    device: K,
    surface: S,
    output: Option<OutputConfig>,
    mode_set_done: bool,
    current: Option<ScanoutSlot>,
    next: Option<ScanoutSlot>,
    fb_cache: FramebufferCache,
    mode_set_error_logged: bool,
    flip_error_logged: bool,
    torn_down: bool,
    stats: SchedulerStats,
}

impl<K: KmsDevice, S: RenderSurface> std::fmt::Debug for DisplayScheduler<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayScheduler")
            .field("state", &self.state())
            .field("current", &self.current.as_ref().map(|s| s.fb))
            .field("next", &self.next.as_ref().map(|s| s.fb))
            .field("cached_framebuffers", &self.fb_cache.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<K: KmsDevice, S: RenderSurface> DisplayScheduler<K, S> {
    pub fn new(device: K, surface: S, config: &DisplayConfig) -> Self {
        Self {
            device,
            surface,
            output: None,
            mode_set_done: false,
            current: None,
            next: None,
            fb_cache: FramebufferCache::new(config.framebuffer_cache_capacity),
            mode_set_error_logged: false,
            flip_error_logged: false,
            torn_down: false,
            stats: SchedulerStats::default(),
        }
    }

    /// Open the output: find the connected display, take ownership and
    /// query its preferred mode.
    ///
    /// # Errors
    /// Any failure is fatal for the session.
    pub fn initialize(&mut self) -> Result<OutputConfig, DisplayError> {
        if self.torn_down {
            return Err(DisplayError::NotInitialized);
        }
        if let Some(output) = &self.output {
            return Ok(output.clone());
        }

        let output = self.device.open_output()?;
        if output.mode.resolution.is_empty() {
            if let Err(e) = self.device.drop_master() {
                debug!(error = %e, "Failed to drop display master");
            }
            return Err(DisplayError::ModeQuery(format!(
                "preferred mode {} has no visible area",
                output.mode.name
            )));
        }
        info!(
            connector = output.connector_id,
            crtc = output.crtc_id,
            mode = %output.mode.name,
            resolution = %output.mode.resolution,
            refresh_hz = output.mode.refresh_hz,
            "Display output opened"
        );
        self.output = Some(output.clone());
        Ok(output)
    }

    /// Put `buffer` on screen, or skip it if a flip is still outstanding.
    ///
    /// The buffer is always either kept (as `current`/`next`) or released
    /// back to the surface before this returns, including on error.
    pub fn present(&mut self, buffer: ScanoutBuffer) -> Result<PresentOutcome, DisplayError> {
        let Some(output) = self.output.clone().filter(|_| !self.torn_down) else {
            self.surface.release(buffer);
            return Err(DisplayError::NotInitialized);
        };

        if self.mode_set_done {
            if let Err(e) = self.poll_completion(Duration::ZERO) {
                self.surface.release(buffer);
                return Err(e);
            }
            if self.next.is_some() {
                self.stats.frames_skipped += 1;
                trace!(buffer = buffer.id.0, "Flip pending, skipping frame");
                self.surface.release(buffer);
                return Ok(PresentOutcome::Skipped);
            }
        }

        let (fb, cached) = match self.resolve_framebuffer(&buffer) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.surface.release(buffer);
                return Err(e);
            }
        };

        if self.mode_set_done {
            self.queue_flip(&output, ScanoutSlot { buffer, fb, cached })
        } else {
            self.mode_set(&output, ScanoutSlot { buffer, fb, cached })
        }
    }

    /// Block up to `timeout` for the outstanding flip to complete.
    ///
    /// Returns `true` when no flip is pending afterwards.
    pub fn wait_for_flip(&mut self, timeout: Duration) -> Result<bool, DisplayError> {
        if self.next.is_some() {
            self.poll_completion(timeout)?;
        }
        Ok(self.next.is_none())
    }

    /// Release everything and give up the display. Safe to call more than
    /// once; also runs on drop.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if self.next.is_some() {
            match self.poll_completion(TEARDOWN_FLIP_WAIT) {
                Ok(_) if self.next.is_none() => {}
                Ok(_) => debug!("Flip still pending at teardown"),
                Err(e) => debug!(error = %e, "Flip wait failed at teardown"),
            }
        }

        let mut removed = HashSet::new();
        for slot in [self.current.take(), self.next.take()].into_iter().flatten() {
            if !slot.cached && removed.insert(slot.fb) {
                self.remove_framebuffer(slot.fb);
            }
            self.surface.release(slot.buffer);
        }
        for fb in self.fb_cache.invalidate() {
            if removed.insert(fb) {
                self.remove_framebuffer(fb);
            }
        }

        self.surface.destroy();

        if self.output.take().is_some() {
            if let Err(e) = self.device.drop_master() {
                warn!(error = %e, "Failed to drop display master");
            }
        }
        self.mode_set_done = false;

        info!(
            presented = self.stats.frames_presented,
            skipped = self.stats.frames_skipped,
            flips = self.stats.flips_completed,
            framebuffers_removed = removed.len(),
            "Display torn down"
        );
    }

    pub fn state(&self) -> ScanoutState {
        if self.torn_down {
            ScanoutState::TornDown
        } else if self.output.is_none() {
            ScanoutState::Uninitialized
        } else if !self.mode_set_done {
            ScanoutState::ModeNotSet
        } else {
            ScanoutState::Steady {
                flip_pending: self.next.is_some(),
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn output(&self) -> Option<&OutputConfig> {
        self.output.as_ref()
    }

    /// Framebuffer currently on screen.
    pub fn current_framebuffer(&self) -> Option<FramebufferId> {
        self.current.as_ref().map(|slot| slot.fb)
    }

    /// Framebuffer of the outstanding flip.
    pub fn pending_framebuffer(&self) -> Option<FramebufferId> {
        self.next.as_ref().map(|slot| slot.fb)
    }

    pub fn device(&self) -> &K {
        &self.device
    }

    /// The device, for the overlay path that shares it.
    pub fn device_mut(&mut self) -> &mut K {
        &mut self.device
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn resolve_framebuffer(
        &mut self,
        buffer: &ScanoutBuffer,
    ) -> Result<(FramebufferId, bool), DisplayError> {
        if let Some(fb) = self.fb_cache.get(buffer.id) {
            return Ok((fb, true));
        }
        let fb = self.device.add_framebuffer(&buffer.framebuffer_desc())?;
        let cached = self.fb_cache.insert(buffer.id, fb);
        debug!(buffer = buffer.id.0, fb = fb.0, cached, "Framebuffer registered");
        Ok((fb, cached))
    }

    fn mode_set(
        &mut self,
        output: &OutputConfig,
        slot: ScanoutSlot,
    ) -> Result<PresentOutcome, DisplayError> {
        match self.device.set_crtc(output, slot.fb) {
            Ok(()) => {
                info!(fb = slot.fb.0, mode = %output.mode.name, "Mode set");
                self.mode_set_done = true;
                self.mode_set_error_logged = false;
                self.stats.frames_presented += 1;
                if let Some(old) = self.current.replace(slot) {
                    self.retire(old);
                }
                Ok(PresentOutcome::ModeSet)
            }
            Err(e) => {
                if !self.mode_set_error_logged {
                    error!(fb = slot.fb.0, error = %e, "Mode set failed");
                    self.mode_set_error_logged = true;
                }
                self.retire(slot);
                Err(e)
            }
        }
    }

    fn queue_flip(
        &mut self,
        output: &OutputConfig,
        slot: ScanoutSlot,
    ) -> Result<PresentOutcome, DisplayError> {
        match self.device.queue_page_flip(output, slot.fb) {
            Ok(()) => {
                trace!(fb = slot.fb.0, "Page flip queued");
                self.flip_error_logged = false;
                self.stats.frames_presented += 1;
                self.next = Some(slot);
                Ok(PresentOutcome::FlipQueued)
            }
            Err(e) => {
                if self.flip_error_logged {
                    debug!(fb = slot.fb.0, error = %e, "Page flip queue failed again");
                } else {
                    warn!(fb = slot.fb.0, error = %e, "Page flip queue failed");
                    self.flip_error_logged = true;
                }
                self.retire(slot);
                Err(e)
            }
        }
    }

    /// Poll once; a completion promotes `next` to `current`.
    fn poll_completion(&mut self, timeout: Duration) -> Result<bool, DisplayError> {
        match self.device.poll_flip_event(timeout)? {
            Some(event) => {
                self.complete_flip(event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn complete_flip(&mut self, event: FlipEvent) {
        let Some(next) = self.next.take() else {
            debug!(sequence = event.sequence, "Flip event without a pending flip");
            return;
        };
        trace!(fb = next.fb.0, sequence = event.sequence, "Page flip completed");
        self.stats.flips_completed += 1;
        if let Some(old) = self.current.replace(next) {
            self.retire(old);
        }
    }

    /// Hand a slot's buffer back, removing its framebuffer unless the cache
    /// owns it or the new `current` still scans it out.
    fn retire(&mut self, slot: ScanoutSlot) {
        let in_use = self.current_framebuffer() == Some(slot.fb)
            || self.pending_framebuffer() == Some(slot.fb);
        if !slot.cached && !in_use {
            self.remove_framebuffer(slot.fb);
        }
        self.surface.release(slot.buffer);
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) {
        if let Err(e) = self.device.remove_framebuffer(fb) {
            warn!(fb = fb.0, error = %e, "Failed to remove framebuffer");
        }
    }
}

impl<K: KmsDevice, S: RenderSurface> Drop for DisplayScheduler<K, S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use pj_common::{PixelFormat, Resolution};

    use crate::kms::{BufferId, DisplayMode, FramebufferDesc};

    // ── Fakes ──

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        AddFb(u32),
        RemoveFb(FramebufferId),
        SetCrtc(FramebufferId),
        Flip(FramebufferId),
        DropMaster,
        Release(BufferId),
        Destroy,
    }

    type Log = Rc<RefCell<Vec<Call>>>;

    #[derive(Default)]
    struct FakeDevice {
        log: Log,
        next_fb: u32,
        queued_flips: u32,
        ready_events: u32,
        set_crtc_failures: u32,
        fail_flip: bool,
        fail_add: bool,
        empty_mode: bool,
        polls: usize,
    }

    impl FakeDevice {
        /// Vblank: every queued flip completes.
        fn vblank(&mut self) {
            self.ready_events += self.queued_flips;
            self.queued_flips = 0;
        }
    }

    impl KmsDevice for FakeDevice {
        fn open_output(&mut self) -> Result<OutputConfig, DisplayError> {
            Ok(OutputConfig {
                connector_id: 31,
                crtc_id: 41,
                mode: DisplayMode {
                    name: "1920x1080".into(),
                    resolution: if self.empty_mode {
                        Resolution::new(0, 0)
                    } else {
                        Resolution::HD
                    },
                    refresh_hz: 60,
                },
            })
        }

        fn add_framebuffer(&mut self, desc: &FramebufferDesc) -> Result<FramebufferId, DisplayError> {
            let handle = desc.planes[0].handle;
            if self.fail_add {
                return Err(DisplayError::FramebufferRegistration {
                    buffer: handle as u64,
                    reason: "ENOMEM".into(),
                });
            }
            self.log.borrow_mut().push(Call::AddFb(handle));
            self.next_fb += 1;
            Ok(FramebufferId(100 + self.next_fb))
        }

        fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<(), DisplayError> {
            self.log.borrow_mut().push(Call::RemoveFb(fb));
            Ok(())
        }

        fn set_crtc(&mut self, _output: &OutputConfig, fb: FramebufferId) -> Result<(), DisplayError> {
            if self.set_crtc_failures > 0 {
                self.set_crtc_failures -= 1;
                return Err(DisplayError::ModeSet {
                    fb: fb.0,
                    reason: "EINVAL".into(),
                });
            }
            self.log.borrow_mut().push(Call::SetCrtc(fb));
            Ok(())
        }

        fn queue_page_flip(
            &mut self,
            _output: &OutputConfig,
            fb: FramebufferId,
        ) -> Result<(), DisplayError> {
            if self.fail_flip {
                return Err(DisplayError::PageFlip {
                    fb: fb.0,
                    reason: "EBUSY".into(),
                });
            }
            self.log.borrow_mut().push(Call::Flip(fb));
            self.queued_flips += 1;
            Ok(())
        }

        fn poll_flip_event(&mut self, _timeout: Duration) -> Result<Option<FlipEvent>, DisplayError> {
            self.polls += 1;
            if self.ready_events == 0 {
                return Ok(None);
            }
            self.ready_events -= 1;
            Ok(Some(FlipEvent {
                crtc_id: 41,
                sequence: self.polls as u32,
                timestamp: Duration::ZERO,
            }))
        }

        fn drop_master(&mut self) -> Result<(), DisplayError> {
            self.log.borrow_mut().push(Call::DropMaster);
            Ok(())
        }
    }

    struct FakeSurface {
        log: Log,
    }

    impl RenderSurface for FakeSurface {
        fn release(&mut self, buffer: ScanoutBuffer) {
            self.log.borrow_mut().push(Call::Release(buffer.id));
        }

        fn destroy(&mut self) {
            self.log.borrow_mut().push(Call::Destroy);
        }
    }

    // ── Helpers ──

    fn buffer(id: u64) -> ScanoutBuffer {
        ScanoutBuffer {
            id: BufferId(id),
            handle: id as u32,
            resolution: Resolution::HD,
            pitch: 1920 * 4,
            format: PixelFormat::Xrgb8888,
        }
    }

    fn scheduler_with(
        capacity: usize,
    ) -> (DisplayScheduler<FakeDevice, FakeSurface>, Log) {
        let log = Log::default();
        let device = FakeDevice {
            log: log.clone(),
            ..Default::default()
        };
        let surface = FakeSurface { log: log.clone() };
        let config = DisplayConfig {
            framebuffer_cache_capacity: capacity,
            ..Default::default()
        };
        (DisplayScheduler::new(device, surface, &config), log)
    }

    fn ready_scheduler() -> (DisplayScheduler<FakeDevice, FakeSurface>, Log) {
        let (mut scheduler, log) = scheduler_with(8);
        scheduler.initialize().unwrap();
        (scheduler, log)
    }

    fn count(log: &Log, pred: impl Fn(&Call) -> bool) -> usize {
        log.borrow().iter().filter(|c| pred(c)).count()
    }

    // ── Tests ──

    #[test]
    fn present_before_initialize_releases_buffer() {
        let (mut scheduler, log) = scheduler_with(8);
        assert_eq!(scheduler.state(), ScanoutState::Uninitialized);
        let err = scheduler.present(buffer(1)).unwrap_err();
        assert!(matches!(err, DisplayError::NotInitialized));
        assert_eq!(*log.borrow(), vec![Call::Release(BufferId(1))]);
    }

    #[test]
    fn empty_preferred_mode_fails_initialize() {
        let log = Log::default();
        let device = FakeDevice {
            log: log.clone(),
            empty_mode: true,
            ..Default::default()
        };
        let surface = FakeSurface { log: log.clone() };
        let mut scheduler = DisplayScheduler::new(device, surface, &DisplayConfig::default());

        assert!(matches!(scheduler.initialize(), Err(DisplayError::ModeQuery(_))));
        assert_eq!(scheduler.state(), ScanoutState::Uninitialized);
        assert_eq!(*log.borrow(), vec![Call::DropMaster]);
    }

    #[test]
    fn first_present_sets_mode() {
        let (mut scheduler, log) = ready_scheduler();
        assert_eq!(scheduler.state(), ScanoutState::ModeNotSet);

        assert_eq!(scheduler.present(buffer(1)).unwrap(), PresentOutcome::ModeSet);
        assert_eq!(
            scheduler.state(),
            ScanoutState::Steady {
                flip_pending: false
            }
        );
        assert_eq!(scheduler.current_framebuffer(), Some(FramebufferId(101)));
        assert_eq!(
            *log.borrow(),
            vec![Call::AddFb(1), Call::SetCrtc(FramebufferId(101))]
        );
    }

    #[test]
    fn second_present_queues_flip() {
        let (mut scheduler, log) = ready_scheduler();
        scheduler.present(buffer(1)).unwrap();
        assert_eq!(scheduler.present(buffer(2)).unwrap(), PresentOutcome::FlipQueued);
        assert_eq!(
            scheduler.state(),
            ScanoutState::Steady { flip_pending: true }
        );
        assert_eq!(scheduler.pending_framebuffer(), Some(FramebufferId(102)));
        assert_eq!(count(&log, |c| matches!(c, Call::Flip(_))), 1);
    }

    #[test]
    fn pending_flip_skips_without_second_flip() {
        let (mut scheduler, log) = ready_scheduler();
        scheduler.present(buffer(1)).unwrap();
        scheduler.present(buffer(2)).unwrap();

        for _ in 0..3 {
            assert_eq!(scheduler.present(buffer(3)).unwrap(), PresentOutcome::Skipped);
        }
        assert_eq!(count(&log, |c| matches!(c, Call::Flip(_))), 1);
        assert_eq!(count(&log, |c| *c == Call::Release(BufferId(3))), 3);
        assert_eq!(scheduler.current_framebuffer(), Some(FramebufferId(101)));
        assert_eq!(scheduler.pending_framebuffer(), Some(FramebufferId(102)));
        assert_eq!(scheduler.stats().frames_skipped, 3);
        // Skipped buffers are never registered.
        assert_eq!(count(&log, |c| matches!(c, Call::AddFb(_))), 2);
    }

    #[test]
    fn same_buffer_twice_while_pending_released_twice() {
        let (mut scheduler, log) = ready_scheduler();
        scheduler.present(buffer(1)).unwrap();
        scheduler.present(buffer(2)).unwrap();

        scheduler.present(buffer(2)).unwrap();
        scheduler.present(buffer(2)).unwrap();
        assert_eq!(count(&log, |c| *c == Call::Release(BufferId(2))), 2);
        assert_eq!(scheduler.current_framebuffer(), Some(FramebufferId(101)));
        assert_eq!(scheduler.pending_framebuffer(), Some(FramebufferId(102)));
    }

    #[test]
    fn completion_promotes_next_and_releases_current() {
        let (mut scheduler, log) = ready_scheduler();
        scheduler.present(buffer(1)).unwrap();
        scheduler.present(buffer(2)).unwrap();

        scheduler.device_mut().vblank();
        assert_eq!(scheduler.present(buffer(3)).unwrap(), PresentOutcome::FlipQueued);

        assert_eq!(scheduler.current_framebuffer(), Some(FramebufferId(102)));
        assert_eq!(scheduler.pending_framebuffer(), Some(FramebufferId(103)));
        assert_eq!(count(&log, |c| *c == Call::Release(BufferId(1))), 1);
        assert_eq!(scheduler.stats().flips_completed, 1);
        // Cached framebuffers stay registered.
        assert_eq!(count(&log, |c| matches!(c, Call::RemoveFb(_))), 0);
    }

    #[test]
    fn recycled_buffers_register_once() {
        let (mut scheduler, log) = ready_scheduler();
        scheduler.present(buffer(1)).unwrap();
        for id in [2, 1, 2, 1] {
            scheduler.device_mut().vblank();
            assert_eq!(scheduler.present(buffer(id)).unwrap(), PresentOutcome::FlipQueued);
        }
        assert_eq!(count(&log, |c| matches!(c, Call::AddFb(_))), 2);
    }

    #[test]
    fn uncached_framebuffer_removed_on_retire() {
        let (mut scheduler, log) = scheduler_with(1);
        scheduler.initialize().unwrap();
        scheduler.present(buffer(1)).unwrap(); // cached as fb 101
        scheduler.present(buffer(2)).unwrap(); // fb 102, cache full
        scheduler.device_mut().vblank();
        scheduler.present(buffer(3)).unwrap(); // fb 103, retires buffer 1
        scheduler.device_mut().vblank();
        scheduler.present(buffer(1)).unwrap(); // retires buffer 2

        assert_eq!(count(&log, |c| *c == Call::RemoveFb(FramebufferId(102))), 1);
        assert_eq!(count(&log, |c| *c == Call::RemoveFb(FramebufferId(101))), 0);
    }

    #[test]
    fn mode_set_failure_releases_and_retries() {
        let (mut scheduler, log) = ready_scheduler();
        scheduler.device_mut().set_crtc_failures = 2;

        for id in [1, 2] {
            let err = scheduler.present(buffer(id)).unwrap_err();
            assert!(matches!(err, DisplayError::ModeSet { .. }));
            assert_eq!(scheduler.state(), ScanoutState::ModeNotSet);
        }
        assert_eq!(count(&log, |c| matches!(c, Call::Release(_))), 2);

        assert_eq!(scheduler.present(buffer(3)).unwrap(), PresentOutcome::ModeSet);
        assert_eq!(scheduler.current_framebuffer(), Some(FramebufferId(103)));
    }

    #[test]
    fn flip_failure_leaves_state_alone() {
        let (mut scheduler, log) = ready_scheduler();
        scheduler.present(buffer(1)).unwrap();
        scheduler.device_mut().fail_flip = true;

        let err = scheduler.present(buffer(2)).unwrap_err();
        assert!(matches!(err, DisplayError::PageFlip { .. }));
        assert_eq!(
            scheduler.state(),
            ScanoutState::Steady {
                flip_pending: false
            }
        );
        assert_eq!(scheduler.current_framebuffer(), Some(FramebufferId(101)));
        assert_eq!(count(&log, |c| *c == Call::Release(BufferId(2))), 1);

        scheduler.device_mut().fail_flip = false;
        assert_eq!(scheduler.present(buffer(2)).unwrap(), PresentOutcome::FlipQueued);
    }

    #[test]
    fn registration_failure_releases_buffer() {
        let (mut scheduler, log) = ready_scheduler();
        scheduler.device_mut().fail_add = true;
        let err = scheduler.present(buffer(9)).unwrap_err();
        assert!(matches!(err, DisplayError::FramebufferRegistration { .. }));
        assert_eq!(*log.borrow(), vec![Call::Release(BufferId(9))]);
        assert_eq!(scheduler.state(), ScanoutState::ModeNotSet);
    }

    #[test]
    fn wait_for_flip_drains_pending() {
        let (mut scheduler, _log) = ready_scheduler();
        scheduler.present(buffer(1)).unwrap();
        assert!(scheduler.wait_for_flip(Duration::from_millis(16)).unwrap());

        scheduler.present(buffer(2)).unwrap();
        assert!(!scheduler.wait_for_flip(Duration::from_millis(16)).unwrap());
        scheduler.device_mut().vblank();
        assert!(scheduler.wait_for_flip(Duration::from_millis(16)).unwrap());
        assert_eq!(scheduler.current_framebuffer(), Some(FramebufferId(102)));
    }

    #[test]
    fn teardown_releases_everything_once() {
        let (mut scheduler, log) = scheduler_with(1);
        scheduler.initialize().unwrap();
        scheduler.present(buffer(1)).unwrap(); // cached fb 101
        scheduler.present(buffer(2)).unwrap(); // uncached fb 102, pending

        scheduler.teardown();
        scheduler.teardown();
        assert_eq!(scheduler.state(), ScanoutState::TornDown);

        let calls = log.borrow().clone();
        let tail: Vec<Call> = calls.into_iter().skip_while(|c| !matches!(c, Call::Release(_))).collect();
        assert_eq!(
            tail,
            vec![
                Call::Release(BufferId(1)),
                Call::RemoveFb(FramebufferId(102)),
                Call::Release(BufferId(2)),
                Call::RemoveFb(FramebufferId(101)),
                Call::Destroy,
                Call::DropMaster,
            ]
        );
    }

    #[test]
    fn present_after_teardown_is_rejected() {
        let (mut scheduler, log) = ready_scheduler();
        scheduler.teardown();
        assert!(matches!(
            scheduler.present(buffer(4)),
            Err(DisplayError::NotInitialized)
        ));
        assert_eq!(count(&log, |c| *c == Call::Release(BufferId(4))), 1);
    }

    #[test]
    fn drop_runs_teardown() {
        let (mut scheduler, log) = ready_scheduler();
        scheduler.present(buffer(1)).unwrap();
        drop(scheduler);

        let calls = log.borrow();
        assert!(calls.contains(&Call::Release(BufferId(1))));
        assert!(calls.contains(&Call::RemoveFb(FramebufferId(101))));
        assert_eq!(calls.last(), Some(&Call::DropMaster));
    }
}
