//! Playback session: one sequential decode/render/present loop.
//!
//! Each [`PlaybackSession::step`] does one decode step. A picture goes to
//! the renderer, and the rendered frame is routed by origin: composited
//! buffers to the primary-plane scheduler, zero-copy frames to the overlay
//! path. When the decoder wants input, the next packet is read from the
//! source.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use pj_common::{DecodedPicture, DisplayError, PlayerConfig, Rect, VideoPacket};
use pj_decoder::{DecodeFeeder, DecodeStep, FeederStats, VideoDecoder};
use pj_display::{
    DisplayScheduler, DmaBufFrame, FramebufferId, KmsDevice, OutputConfig, OverlayPath,
    OverlayStats, PlaneCommit, PresentOutcome, RenderSurface, ScanoutBuffer, SchedulerStats,
};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Container-level packet source (demuxer or elementary-stream reader).
pub trait PacketSource {
    /// The next packet, or `None` at end of stream.
    fn next_packet(&mut self) -> Result<Option<VideoPacket>>;

    /// Codec configuration record of the video track (avcC for MP4-style
    /// H.264). Empty for elementary streams.
    fn extradata(&self) -> &[u8] {
        &[]
    }
}

/// What the renderer produced for one picture.
#[derive(Debug)]
pub enum RenderedFrame {
    /// Composited into a scanout buffer for the primary plane.
    Composited(ScanoutBuffer),
    /// Exported as-is for the overlay plane.
    ZeroCopy(DmaBufFrame),
}

/// Turns decoded pictures into presentable buffers.
pub trait FrameRenderer {
    fn render(&mut self, picture: &DecodedPicture) -> Result<RenderedFrame>;
}

// ---------------------------------------------------------------------------
// Session types
// ---------------------------------------------------------------------------

/// What one [`PlaybackSession::step`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStep {
    Presented(PresentOutcome),
    OverlayPresented(FramebufferId),
    /// The frame could not be shown; the session continues.
    FrameDropped,
    /// The decoder needed input (a packet may have been read).
    NeedInput,
    Finished,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub decoder: FeederStats,
    pub display: SchedulerStats,
    pub overlay: Option<OverlayStats>,
    /// Frames lost to transient present errors or a missing overlay.
    pub frames_dropped: u64,
}

// ---------------------------------------------------------------------------
// PlaybackSession
// ---------------------------------------------------------------------------

pub struct PlaybackSession<D, K, S, R>
where
    D: VideoDecoder,
    K: KmsDevice,
    S: RenderSurface,
    R: FrameRenderer,
{
    feeder: DecodeFeeder<D>,
    scheduler: DisplayScheduler<K, S>,
    overlay: Option<OverlayPath>,
    renderer: R,
    output: OutputConfig,
    /// The source returned `None`; it is not read again until a seek.
    source_exhausted: bool,
    zero_copy_warned: bool,
    frames_dropped: u64,
    torn_down: bool,
}

impl<D, K, S, R> std::fmt::Debug for PlaybackSession<D, K, S, R>
where
    D: VideoDecoder,
    K: KmsDevice,
    S: RenderSurface,
    R: FrameRenderer,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("feeder", &self.feeder)
            .field("scheduler", &self.scheduler)
            .field("overlay", &self.overlay.is_some())
            .field("frames_dropped", &self.frames_dropped)
            .finish()
    }
}

impl<D, K, S, R> PlaybackSession<D, K, S, R>
where
    D: VideoDecoder,
    K: KmsDevice,
    S: RenderSurface,
    R: FrameRenderer,
{
    /// Open decoder and display. Any failure here is fatal for the session.
    ///
    /// The overlay path starts only when the config enables it and a plane
    /// is supplied. The header cache is seeded from `source`'s extradata.
    pub fn open<P: PacketSource>(
        config: &PlayerConfig,
        decoder: D,
        device: K,
        surface: S,
        renderer: R,
        overlay_plane: Option<Box<dyn PlaneCommit>>,
        source: &P,
    ) -> Result<Self> {
        config.validate().context("Invalid player config")?;

        let feeder = DecodeFeeder::new(
            decoder,
            &config.decoder,
            &config.bitstream,
            source.extradata(),
        )
        .with_context(|| format!("Failed to open {} decoder", config.decoder.codec.display_name()))?;

        let mut scheduler = DisplayScheduler::new(device, surface, &config.display);
        let output = scheduler
            .initialize()
            .with_context(|| format!("Failed to open display {}", config.display.device_path))?;

        let overlay = match (config.overlay.enabled, overlay_plane) {
            (true, Some(plane)) => Some(
                OverlayPath::new(plane, &config.overlay).context("Failed to start overlay path")?,
            ),
            (true, None) => {
                warn!("Overlay enabled but no overlay plane available");
                None
            }
            (false, _) => None,
        };

        info!(
            codec = feeder.codec().display_name(),
            format = ?feeder.format(),
            mode = %output.mode.name,
            overlay = overlay.is_some(),
            "Playback session opened"
        );

        Ok(Self {
            feeder,
            scheduler,
            overlay,
            renderer,
            output,
            source_exhausted: false,
            zero_copy_warned: false,
            frames_dropped: 0,
            torn_down: false,
        })
    }

    /// One decode step, plus render/present or a packet read.
    pub fn step<P: PacketSource>(&mut self, source: &mut P) -> Result<SessionStep> {
        match self.feeder.decode_step().context("Decoder failed")? {
            DecodeStep::Picture(picture) => self.present_picture(&picture),
            DecodeStep::EndOfStream => Ok(SessionStep::Finished),
            DecodeStep::NeedInput => {
                if !self.feeder.has_pending_input() && !self.source_exhausted {
                    match source.next_packet().context("Failed to read packet")? {
                        Some(packet) => {
                            self.feeder
                                .submit_packet(&packet)
                                .context("Failed to submit packet")?;
                        }
                        None => {
                            self.source_exhausted = true;
                            self.feeder.end_of_stream();
                        }
                    }
                }
                Ok(SessionStep::NeedInput)
            }
        }
    }

    /// Step until the decoder reports end of stream.
    pub fn run<P: PacketSource>(&mut self, source: &mut P) -> Result<SessionStats> {
        while self.step(source)? != SessionStep::Finished {}
        let stats = self.stats();
        info!(
            pictures = stats.decoder.pictures,
            presented = stats.display.frames_presented,
            skipped = stats.display.frames_skipped,
            dropped = stats.frames_dropped,
            "Playback finished"
        );
        Ok(stats)
    }

    /// Restart decoding after the caller repositioned the source.
    pub fn seek(&mut self) -> Result<()> {
        self.feeder
            .reset_for_seek()
            .context("Failed to reset decoder for seek")?;
        self.source_exhausted = false;
        Ok(())
    }

    /// Stop the overlay worker and release display resources. Idempotent;
    /// also runs on drop.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(overlay) = &mut self.overlay {
            overlay.teardown(self.scheduler.device_mut());
        }
        self.scheduler.teardown();
        debug!("Playback session torn down");
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            decoder: self.feeder.stats(),
            display: self.scheduler.stats(),
            overlay: self.overlay.as_ref().map(|o| o.committer().stats()),
            frames_dropped: self.frames_dropped,
        }
    }

    pub fn output(&self) -> &OutputConfig {
        &self.output
    }

    pub fn scheduler(&self) -> &DisplayScheduler<K, S> {
        &self.scheduler
    }

    pub fn feeder(&self) -> &DecodeFeeder<D> {
        &self.feeder
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn present_picture(&mut self, picture: &DecodedPicture) -> Result<SessionStep> {
        let frame = self.renderer.render(picture).context("Render failed")?;
        match frame {
            RenderedFrame::Composited(buffer) => match self.scheduler.present(buffer) {
                Ok(outcome) => Ok(SessionStep::Presented(outcome)),
                Err(e) if is_transient(&e) => {
                    self.frames_dropped += 1;
                    Ok(SessionStep::FrameDropped)
                }
                Err(e) => Err(e).context("Display failed"),
            },
            RenderedFrame::ZeroCopy(frame) => {
                let Some(overlay) = &mut self.overlay else {
                    if !self.zero_copy_warned {
                        warn!("Zero-copy frame without an overlay path, dropping");
                        self.zero_copy_warned = true;
                    }
                    self.frames_dropped += 1;
                    return Ok(SessionStep::FrameDropped);
                };
                let dest = Rect::full(self.output.mode.resolution);
                match overlay.present(self.scheduler.device_mut(), &frame, dest) {
                    Ok(fb) => Ok(SessionStep::OverlayPresented(fb)),
                    Err(e) if is_transient(&e) => {
                        debug!(error = %e, "Overlay frame dropped");
                        self.frames_dropped += 1;
                        Ok(SessionStep::FrameDropped)
                    }
                    Err(e) => Err(e).context("Overlay failed"),
                }
            }
        }
    }
}

impl<D, K, S, R> Drop for PlaybackSession<D, K, S, R>
where
    D: VideoDecoder,
    K: KmsDevice,
    S: RenderSurface,
    R: FrameRenderer,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Errors that cost one frame but not the session. The scheduler has
/// already logged them (once) and released the buffer.
fn is_transient(error: &DisplayError) -> bool {
    matches!(
        error,
        DisplayError::ModeSet { .. }
            | DisplayError::PageFlip { .. }
            | DisplayError::FramebufferRegistration { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use pj_common::{DecodeError, PicturePlane, PixelFormat, Resolution, TimeCode, VideoCodec};
    use pj_decoder::{DecoderInput, PullOutcome, PushOutcome};
    use pj_display::{
        BufferId, DisplayMode, FlipEvent, FramebufferDesc, PlaneLayout, PlaneUpdate,
    };

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80];
    const IDR: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21];
    const P_SLICE: &[u8] = &[0, 0, 0, 1, 0x41, 0x9a, 0x02, 0x03];

    fn packet(parts: &[&[u8]], pts: f64) -> VideoPacket {
        VideoPacket {
            data: parts.concat(),
            pts: Some(TimeCode::from_secs(pts)),
            dts: Some(TimeCode::from_secs(pts)),
            is_keyframe: parts.contains(&IDR),
            codec: VideoCodec::H264,
        }
    }

    /// One keyframe with its parameter sets, then `count - 1` P frames.
    fn gop(count: usize) -> Vec<VideoPacket> {
        (0..count)
            .map(|i| {
                if i == 0 {
                    packet(&[SPS, PPS, IDR], 0.0)
                } else {
                    packet(&[P_SLICE], i as f64 / 30.0)
                }
            })
            .collect()
    }

    // ── Fakes ──

    struct VecSource(VecDeque<VideoPacket>);

    impl PacketSource for VecSource {
        fn next_packet(&mut self) -> Result<Option<VideoPacket>> {
            Ok(self.0.pop_front())
        }
    }

    /// One picture per accepted unit, end of stream after a drain.
    #[derive(Default)]
    struct EchoDecoder {
        ready: VecDeque<Option<TimeCode>>,
        drained: bool,
    }

    impl VideoDecoder for EchoDecoder {
        fn codec(&self) -> VideoCodec {
            VideoCodec::H264
        }

        fn offered_formats(&self) -> Vec<PixelFormat> {
            vec![PixelFormat::Nv12]
        }

        fn open(&mut self, _format: PixelFormat) -> std::result::Result<(), DecodeError> {
            Ok(())
        }

        fn push(&mut self, input: DecoderInput<'_>) -> std::result::Result<PushOutcome, DecodeError> {
            match input {
                DecoderInput::Data { pts, .. } => self.ready.push_back(pts),
                DecoderInput::Drain => self.drained = true,
            }
            Ok(PushOutcome::Accepted)
        }

        fn pull(&mut self) -> std::result::Result<PullOutcome, DecodeError> {
            match self.ready.pop_front() {
                Some(pts) => Ok(PullOutcome::Picture(DecodedPicture {
                    planes: vec![PicturePlane {
                        data: vec![0; 16],
                        stride: 4,
                    }],
                    resolution: Resolution::new(4, 4),
                    format: PixelFormat::Nv12,
                    pts,
                    is_keyframe: false,
                })),
                None if self.drained => Ok(PullOutcome::EndOfStream),
                None => Ok(PullOutcome::NeedMoreInput),
            }
        }

        fn flush(&mut self) -> std::result::Result<(), DecodeError> {
            self.ready.clear();
            self.drained = false;
            Ok(())
        }
    }

    #[derive(Default)]
    struct DeviceLog {
        no_output: bool,
        fail_flips: u32,
        next_fb: u32,
        added: u32,
        removed: u32,
        flip_pending: bool,
        master_dropped: bool,
    }

    /// Flips complete by the next poll.
    struct FakeDevice(Rc<RefCell<DeviceLog>>);

    impl KmsDevice for FakeDevice {
        fn open_output(&mut self) -> std::result::Result<OutputConfig, DisplayError> {
            if self.0.borrow().no_output {
                return Err(DisplayError::NoConnectedOutput);
            }
            Ok(OutputConfig {
                connector_id: 1,
                crtc_id: 2,
                mode: DisplayMode {
                    name: "1920x1080".into(),
                    resolution: Resolution::HD,
                    refresh_hz: 60,
                },
            })
        }

        fn add_framebuffer(&mut self, _desc: &FramebufferDesc) -> std::result::Result<FramebufferId, DisplayError> {
            let mut log = self.0.borrow_mut();
            log.next_fb += 1;
            log.added += 1;
            Ok(FramebufferId(log.next_fb))
        }

        fn remove_framebuffer(&mut self, _fb: FramebufferId) -> std::result::Result<(), DisplayError> {
            self.0.borrow_mut().removed += 1;
            Ok(())
        }

        fn set_crtc(&mut self, _output: &OutputConfig, _fb: FramebufferId) -> std::result::Result<(), DisplayError> {
            Ok(())
        }

        fn queue_page_flip(&mut self, _output: &OutputConfig, fb: FramebufferId) -> std::result::Result<(), DisplayError> {
            let mut log = self.0.borrow_mut();
            if log.fail_flips > 0 {
                log.fail_flips -= 1;
                return Err(DisplayError::PageFlip {
                    fb: fb.0,
                    reason: "EBUSY".into(),
                });
            }
            log.flip_pending = true;
            Ok(())
        }

        fn poll_flip_event(&mut self, _timeout: Duration) -> std::result::Result<Option<FlipEvent>, DisplayError> {
            let mut log = self.0.borrow_mut();
            if !std::mem::take(&mut log.flip_pending) {
                return Ok(None);
            }
            Ok(Some(FlipEvent {
                crtc_id: 2,
                sequence: 1,
                timestamp: Duration::ZERO,
            }))
        }

        fn drop_master(&mut self) -> std::result::Result<(), DisplayError> {
            self.0.borrow_mut().master_dropped = true;
            Ok(())
        }
    }

    /// Buffers lent minus buffers returned.
    type Outstanding = Rc<RefCell<i64>>;

    struct CountingSurface(Outstanding);

    impl RenderSurface for CountingSurface {
        fn release(&mut self, _buffer: ScanoutBuffer) {
            *self.0.borrow_mut() -= 1;
        }

        fn destroy(&mut self) {}
    }

    /// Cycles through three buffer ids.
    struct FakeRenderer {
        zero_copy: bool,
        frame: u64,
        lent: Outstanding,
    }

    impl FrameRenderer for FakeRenderer {
        fn render(&mut self, _picture: &DecodedPicture) -> Result<RenderedFrame> {
            let id = BufferId(self.frame % 3);
            self.frame += 1;
            if self.zero_copy {
                return Ok(RenderedFrame::ZeroCopy(DmaBufFrame {
                    id,
                    resolution: Resolution::HD,
                    format: PixelFormat::Nv12,
                    planes: vec![PlaneLayout {
                        handle: id.0 as u32,
                        pitch: 1920,
                        offset: 0,
                    }],
                }));
            }
            *self.lent.borrow_mut() += 1;
            Ok(RenderedFrame::Composited(ScanoutBuffer {
                id,
                handle: id.0 as u32,
                resolution: Resolution::HD,
                pitch: 1920 * 4,
                format: PixelFormat::Xrgb8888,
            }))
        }
    }

    struct RecordingPlane(Arc<Mutex<Vec<FramebufferId>>>);

    impl PlaneCommit for RecordingPlane {
        fn set_plane(&mut self, update: &PlaneUpdate) -> std::result::Result<(), DisplayError> {
            self.0.lock().push(update.fb);
            Ok(())
        }
    }

    struct Harness {
        device: Rc<RefCell<DeviceLog>>,
        outstanding: Outstanding,
    }

    type TestSession = PlaybackSession<EchoDecoder, FakeDevice, CountingSurface, FakeRenderer>;

    fn open(
        config: &PlayerConfig,
        zero_copy: bool,
        plane: Option<Box<dyn PlaneCommit>>,
        device_log: DeviceLog,
    ) -> (Result<TestSession>, Harness) {
        let device = Rc::new(RefCell::new(device_log));
        let outstanding = Outstanding::default();
        let session = PlaybackSession::open(
            config,
            EchoDecoder::default(),
            FakeDevice(device.clone()),
            CountingSurface(outstanding.clone()),
            FakeRenderer {
                zero_copy,
                frame: 0,
                lent: outstanding.clone(),
            },
            plane,
            &VecSource(VecDeque::new()),
        );
        (session, Harness { device, outstanding })
    }

    // ── Tests ──

    #[test]
    fn run_presents_every_picture_and_returns_every_buffer() {
        let (session, harness) = open(&PlayerConfig::default(), false, None, DeviceLog::default());
        let mut session = session.unwrap();

        let stats = session.run(&mut VecSource(gop(6).into())).unwrap();
        assert_eq!(stats.decoder.pictures, 6);
        assert_eq!(stats.display.frames_presented + stats.display.frames_skipped, 6);
        assert_eq!(stats.frames_dropped, 0);
        assert!(stats.overlay.is_none());

        drop(session);
        assert_eq!(*harness.outstanding.borrow(), 0);
        let log = harness.device.borrow();
        assert!(log.master_dropped);
        assert_eq!(log.added, log.removed);
    }

    #[test]
    fn finished_is_sticky() {
        let (session, _harness) = open(&PlayerConfig::default(), false, None, DeviceLog::default());
        let mut session = session.unwrap();
        let mut source = VecSource(gop(2).into());

        session.run(&mut source).unwrap();
        assert_eq!(session.step(&mut source).unwrap(), SessionStep::Finished);
    }

    #[test]
    fn flip_failure_drops_one_frame() {
        let device = DeviceLog {
            fail_flips: 1,
            ..Default::default()
        };
        let (session, harness) = open(&PlayerConfig::default(), false, None, device);
        let mut session = session.unwrap();

        let stats = session.run(&mut VecSource(gop(4).into())).unwrap();
        assert_eq!(stats.decoder.pictures, 4);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.display.frames_presented + stats.display.frames_skipped, 3);

        session.teardown();
        assert_eq!(*harness.outstanding.borrow(), 0);
    }

    #[test]
    fn zero_copy_without_overlay_is_dropped() {
        let (session, _harness) = open(&PlayerConfig::default(), true, None, DeviceLog::default());
        let mut session = session.unwrap();

        let stats = session.run(&mut VecSource(gop(3).into())).unwrap();
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(stats.display.frames_presented, 0);
    }

    #[test]
    fn zero_copy_goes_to_overlay_plane() {
        let mut config = PlayerConfig::default();
        config.overlay.enabled = true;
        let committed = Arc::new(Mutex::new(Vec::new()));
        let plane: Box<dyn PlaneCommit> = Box::new(RecordingPlane(committed.clone()));
        let (session, harness) = open(&config, true, Some(plane), DeviceLog::default());
        let mut session = session.unwrap();

        let stats = session.run(&mut VecSource(gop(5).into())).unwrap();
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(stats.overlay.map(|o| o.submitted), Some(5));

        session.teardown();
        // Three distinct dma-bufs, each registered once and removed once.
        let log = harness.device.borrow();
        assert_eq!(log.added, 3);
        assert_eq!(log.removed, 3);
        assert!(committed.lock().iter().all(|fb| (1..=3).contains(&fb.0)));
    }

    #[test]
    fn overlay_enabled_without_plane_runs_primary_only() {
        let mut config = PlayerConfig::default();
        config.overlay.enabled = true;
        let (session, _harness) = open(&config, false, None, DeviceLog::default());
        let mut session = session.unwrap();

        let stats = session.run(&mut VecSource(gop(2).into())).unwrap();
        assert!(stats.overlay.is_none());
        assert_eq!(stats.decoder.pictures, 2);
    }

    #[test]
    fn open_reports_display_failure_with_device_path() {
        let device = DeviceLog {
            no_output: true,
            ..Default::default()
        };
        let (session, _harness) = open(&PlayerConfig::default(), false, None, device);
        let err = session.unwrap_err();
        assert_eq!(err.to_string(), "Failed to open display /dev/dri/card0");
        assert!(matches!(
            err.downcast_ref::<DisplayError>(),
            Some(DisplayError::NoConnectedOutput)
        ));
    }

    #[test]
    fn open_rejects_invalid_config() {
        let mut config = PlayerConfig::default();
        config.display.framebuffer_cache_capacity = 0;
        let (session, harness) = open(&config, false, None, DeviceLog::default());
        assert_eq!(session.unwrap_err().to_string(), "Invalid player config");
        assert!(!harness.device.borrow().master_dropped);
    }

    #[test]
    fn seek_restarts_after_end_of_stream() {
        let (session, _harness) = open(&PlayerConfig::default(), false, None, DeviceLog::default());
        let mut session = session.unwrap();

        session.run(&mut VecSource(gop(3).into())).unwrap();
        session.seek().unwrap();
        let stats = session.run(&mut VecSource(gop(4).into())).unwrap();
        assert_eq!(stats.decoder.pictures, 7);
    }

    #[test]
    fn teardown_is_idempotent() {
        let (session, harness) = open(&PlayerConfig::default(), false, None, DeviceLog::default());
        let mut session = session.unwrap();
        session.run(&mut VecSource(gop(3).into())).unwrap();

        session.teardown();
        let removed = harness.device.borrow().removed;
        session.teardown();
        drop(session);
        assert_eq!(harness.device.borrow().removed, removed);
    }
}
