//! Decode feeder: container packets in, decoded pictures out.
//!
//! ## Feed/drain protocol
//!
//! Each [`DecodeFeeder::decode_step`] makes at most one push and exactly one
//! pull:
//!
//! - `Busy` keeps the unit at the head of the queue; it is pushed again on
//!   the next step and never dropped.
//! - `InvalidData` drops the unit and bumps a consecutive-failure counter.
//!   Only a throttled warning is logged; the session carries on.
//! - A pulled picture is the step's success signal.
//! - End of stream from the decoder is terminal until
//!   [`DecodeFeeder::reset_for_seek`].
//!
//! H.264 goes through access-unit reconstruction and the IDR gate. H.265
//! packets are passed through whole, gated on the container keyframe flag.

use std::collections::VecDeque;

use tracing::{debug, info, trace, warn};

use pj_bitstream::{AccessUnit, AccessUnitAccumulator, AnnexBFilter, GateStats, GateVerdict, IdrGate};
use pj_common::{
    BitstreamConfig, DecodeError, DecodedPicture, DecoderConfig, PixelFormat, TimeCode,
    VideoCodec, VideoPacket,
};

use crate::backend::{DecoderInput, PullOutcome, PushOutcome, VideoDecoder};
use crate::negotiate::negotiate_format;
use crate::throttle::LogThrottle;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Result of one [`DecodeFeeder::decode_step`].
#[derive(Clone, Debug)]
pub enum DecodeStep {
    Picture(DecodedPicture),
    /// No picture this step. Call again if
    /// [`DecodeFeeder::has_pending_input`], otherwise submit more packets.
    NeedInput,
    EndOfStream,
}

/// Counters for one session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FeederStats {
    pub packets_submitted: u64,
    /// Units accepted by the decoder.
    pub units_fed: u64,
    pub busy_retries: u64,
    pub invalid_data: u64,
    pub pictures: u64,
    /// H.265 packets dropped while waiting for a keyframe.
    pub passthrough_dropped: u64,
    pub gate: GateStats,
}

// ---------------------------------------------------------------------------
// Queue entries
// ---------------------------------------------------------------------------

/// A unit waiting to be pushed.
#[derive(Debug)]
struct PendingUnit {
    data: Vec<u8>,
    pts: Option<TimeCode>,
    dts: Option<TimeCode>,
    is_keyframe: bool,
}

impl PendingUnit {
    fn as_input(&self) -> DecoderInput<'_> {
        DecoderInput::Data {
            data: &self.data,
            pts: self.pts,
            dts: self.dts,
            is_keyframe: self.is_keyframe,
        }
    }
}

impl From<AccessUnit> for PendingUnit {
    fn from(unit: AccessUnit) -> Self {
        Self {
            data: unit.data,
            pts: unit.pts,
            dts: unit.dts,
            is_keyframe: unit.is_keyframe,
        }
    }
}

impl From<&VideoPacket> for PendingUnit {
    fn from(packet: &VideoPacket) -> Self {
        Self {
            data: packet.data.clone(),
            pts: packet.pts,
            dts: packet.dts,
            is_keyframe: packet.is_keyframe,
        }
    }
}

/// Codec-specific front end.
#[derive(Debug)]
enum Ingest {
    /// H.264: pre-filter, accumulate, gate.
    Reconstruct {
        filter: AnnexBFilter,
        accumulator: AccessUnitAccumulator,
        gate: IdrGate,
        /// SPS/PPS from the avcC record, re-seeded after a seek.
        extradata_sets: Option<Vec<u8>>,
    },
    /// H.265: whole packets, starting at the first keyframe.
    Passthrough { keyframe_seen: bool },
}

// ---------------------------------------------------------------------------
// DecodeFeeder
// ---------------------------------------------------------------------------

/// Owns the reconstruction pipeline and drives one decoder.
pub struct DecodeFeeder<D: VideoDecoder> {
    decoder: D,
    codec: VideoCodec,
    format: PixelFormat,
    ingest: Ingest,
    queue: VecDeque<PendingUnit>,
    /// Caller announced end of input.
    eos_requested: bool,
    drain_sent: bool,
    /// Decoder reported end of stream.
    at_eos: bool,
    consecutive_invalid: u64,
    invalid_throttle: LogThrottle,
    stats: FeederStats,
}

impl<D: VideoDecoder> std::fmt::Debug for DecodeFeeder<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeFeeder")
            .field("codec", &self.codec)
            .field("format", &self.format)
            .field("queued", &self.queue.len())
            .field("eos_requested", &self.eos_requested)
            .field("at_eos", &self.at_eos)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<D: VideoDecoder> DecodeFeeder<D> {
    /// Negotiate the output format, open the decoder and set up ingest.
    ///
    /// `extradata` is the track's codec configuration (avcC for MP4-style
    /// H.264, empty for elementary streams). Out-of-band parameter sets it
    /// carries seed the header cache.
    ///
    /// # Errors
    /// `CodecOpen` if the decoder handles a different codec than configured
    /// or fails to open, `NoUsableFormat` if it offers no output format,
    /// `Bitstream` if the extradata cannot be parsed.
    pub fn new(
        mut decoder: D,
        config: &DecoderConfig,
        bitstream: &BitstreamConfig,
        extradata: &[u8],
    ) -> Result<Self, DecodeError> {
        let codec = config.codec;
        if decoder.codec() != codec {
            return Err(DecodeError::CodecOpen {
                codec,
                reason: format!("decoder handles {}", decoder.codec().display_name()),
            });
        }

        let offered = decoder.offered_formats();
        let format = negotiate_format(&offered, &config.preferred_formats)
            .ok_or(DecodeError::NoUsableFormat { offered })?;
        decoder.open(format)?;

        let ingest = if codec.reconstructs_access_units() {
            let filter = AnnexBFilter::from_extradata(extradata)?;
            let mut gate = IdrGate::new();
            let extradata_sets = filter.parameter_sets();
            if let Some(parameter_sets) = &extradata_sets {
                gate.seed_parameter_sets(parameter_sets.clone());
            }
            Ingest::Reconstruct {
                filter,
                accumulator: AccessUnitAccumulator::new(bitstream.finalize_on_packet_end),
                gate,
                extradata_sets,
            }
        } else {
            Ingest::Passthrough {
                keyframe_seen: false,
            }
        };

        info!(
            codec = codec.display_name(),
            format = ?format,
            extradata_len = extradata.len(),
            "Decode feeder opened"
        );

        Ok(Self {
            decoder,
            codec,
            format,
            ingest,
            queue: VecDeque::new(),
            eos_requested: false,
            drain_sent: false,
            at_eos: false,
            consecutive_invalid: 0,
            invalid_throttle: LogThrottle::new(config.invalid_data_log_interval),
            stats: FeederStats::default(),
        })
    }

    /// Hand one container packet to the feeder.
    ///
    /// Returns how many units became ready for the decoder.
    ///
    /// # Errors
    /// `EndOfStream` once end of input has been announced or reached.
    pub fn submit_packet(&mut self, packet: &VideoPacket) -> Result<usize, DecodeError> {
        if self.eos_requested || self.at_eos {
            return Err(DecodeError::EndOfStream);
        }
        self.stats.packets_submitted += 1;
        let before = self.queue.len();

        match &mut self.ingest {
            Ingest::Reconstruct {
                filter,
                accumulator,
                gate,
                ..
            } => {
                let units = match filter {
                    AnnexBFilter::Passthrough => accumulator.push_packet(packet),
                    AnnexBFilter::Avcc(_) => accumulator.push_packet(&VideoPacket {
                        data: filter.filter(&packet.data),
                        pts: packet.pts,
                        dts: packet.dts,
                        is_keyframe: packet.is_keyframe,
                        codec: packet.codec,
                    }),
                };
                for unit in units {
                    admit(gate, &mut self.queue, unit);
                }
            }
            Ingest::Passthrough { keyframe_seen } => {
                if !*keyframe_seen {
                    if !packet.is_keyframe {
                        self.stats.passthrough_dropped += 1;
                        trace!(len = packet.data.len(), "Dropping packet before first keyframe");
                        return Ok(0);
                    }
                    *keyframe_seen = true;
                    debug!("First keyframe packet, passthrough open");
                }
                self.queue.push_back(PendingUnit::from(packet));
            }
        }

        Ok(self.queue.len() - before)
    }

    /// Announce end of input.
    ///
    /// Whatever the accumulator still holds is finalized and queued. Once
    /// the queue is empty a drain push is sent and the remaining pictures
    /// come out of subsequent steps until `EndOfStream`.
    pub fn end_of_stream(&mut self) {
        if self.eos_requested {
            return;
        }
        if let Ingest::Reconstruct {
            accumulator, gate, ..
        } = &mut self.ingest
        {
            if let Some(unit) = accumulator.finish() {
                admit(gate, &mut self.queue, unit);
            }
        }
        self.eos_requested = true;
        debug!(queued = self.queue.len(), "End of input");
    }

    /// One push attempt and one pull.
    pub fn decode_step(&mut self) -> Result<DecodeStep, DecodeError> {
        if self.at_eos {
            return Ok(DecodeStep::EndOfStream);
        }

        self.feed_one()?;

        match self.decoder.pull()? {
            PullOutcome::Picture(picture) => {
                self.stats.pictures += 1;
                trace!(pts = ?picture.pts, bytes = picture.byte_size(), "Picture drained");
                Ok(DecodeStep::Picture(picture))
            }
            PullOutcome::NeedMoreInput => Ok(DecodeStep::NeedInput),
            PullOutcome::EndOfStream => {
                self.at_eos = true;
                info!(
                    pictures = self.stats.pictures,
                    units_fed = self.stats.units_fed,
                    "Decoder reached end of stream"
                );
                Ok(DecodeStep::EndOfStream)
            }
        }
    }

    /// Restart after a seek: flush the decoder and reset reconstruction and
    /// gating. The header cache is kept, and refilled from the extradata
    /// if the first IDR consumed it.
    pub fn reset_for_seek(&mut self) -> Result<(), DecodeError> {
        self.decoder.flush()?;

        match &mut self.ingest {
            Ingest::Reconstruct {
                accumulator,
                gate,
                extradata_sets,
                ..
            } => {
                accumulator.reset();
                gate.reset();
                // Container samples never repeat the headers; the first IDR
                // after the seek needs them again.
                if let Some(parameter_sets) = extradata_sets.as_ref().filter(|_| gate.cached().is_none()) {
                    gate.seed_parameter_sets(parameter_sets.clone());
                }
            }
            Ingest::Passthrough { keyframe_seen } => *keyframe_seen = false,
        }

        let discarded = self.queue.len();
        self.queue.clear();
        self.eos_requested = false;
        self.drain_sent = false;
        self.at_eos = false;
        self.consecutive_invalid = 0;
        self.invalid_throttle.reset();

        debug!(discarded, "Decode feeder reset for seek");
        Ok(())
    }

    /// Units are queued, or a drain push is still owed.
    pub fn has_pending_input(&self) -> bool {
        !self.queue.is_empty() || (self.eos_requested && !self.drain_sent)
    }

    pub fn is_at_eos(&self) -> bool {
        self.at_eos
    }

    /// The output format chosen at construction.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn stats(&self) -> FeederStats {
        let gate = match &self.ingest {
            Ingest::Reconstruct { gate, .. } => gate.stats(),
            Ingest::Passthrough { .. } => GateStats::default(),
        };
        FeederStats { gate, ..self.stats }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn feed_one(&mut self) -> Result<(), DecodeError> {
        if let Some(unit) = self.queue.front() {
            match self.decoder.push(unit.as_input())? {
                PushOutcome::Accepted => {
                    self.queue.pop_front();
                    self.stats.units_fed += 1;
                    self.consecutive_invalid = 0;
                    self.invalid_throttle.reset();
                }
                PushOutcome::Busy => {
                    self.stats.busy_retries += 1;
                    trace!(queued = self.queue.len(), "Decoder busy, retrying unit next step");
                }
                PushOutcome::InvalidData => {
                    let len = unit.data.len();
                    self.queue.pop_front();
                    self.stats.invalid_data += 1;
                    self.consecutive_invalid += 1;
                    if let Some(suppressed) = self.invalid_throttle.hit() {
                        warn!(
                            len,
                            consecutive = self.consecutive_invalid,
                            suppressed,
                            "Decoder rejected access unit as invalid data"
                        );
                    }
                }
            }
        } else if self.eos_requested && !self.drain_sent {
            match self.decoder.push(DecoderInput::Drain)? {
                PushOutcome::Busy => {
                    self.stats.busy_retries += 1;
                }
                PushOutcome::Accepted | PushOutcome::InvalidData => {
                    self.drain_sent = true;
                    debug!("Drain sent to decoder");
                }
            }
        }
        Ok(())
    }
}

fn admit(gate: &mut IdrGate, queue: &mut VecDeque<PendingUnit>, unit: AccessUnit) {
    match gate.admit(unit) {
        GateVerdict::Forward(unit) => queue.push_back(PendingUnit::from(unit)),
        GateVerdict::Cached => {}
        GateVerdict::Dropped(reason) => {
            trace!(reason = ?reason, "Access unit dropped by gate");
        }
    }
}
