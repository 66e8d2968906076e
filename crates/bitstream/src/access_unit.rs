//! Access units and the accumulator that finds picture boundaries.
//!
//! ## Boundary rules
//!
//! - An AUD always opens a new unit; if slice data is held, the held unit is
//!   finalized first.
//! - SPS, PPS and SEI are appended without finalizing.
//! - A slice finalizes the held unit only when slice data is held, its
//!   `first_mb_in_slice` is zero, and no AUD was seen for the held unit.
//!   AUDs are authoritative: once one has been seen, slice headers are not
//!   consulted until the next AUD.
//! - Everything else is appended.
//!
//! In packet mode the held unit is also finalized when a packet ends.

use tracing::trace;

use pj_common::{TimeCode, VideoPacket};

use crate::bit_reader::first_mb_in_slice;
use crate::nal::{H264NalType, NalSplitter, NalView};

/// Which NAL categories an access unit contains.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NalCategories {
    pub aud: bool,
    pub sps: bool,
    pub pps: bool,
    pub sei: bool,
    pub idr: bool,
    pub slice: bool,
}

impl NalCategories {
    /// Record one NAL unit.
    pub fn record(&mut self, nal_type: H264NalType) {
        match nal_type {
            H264NalType::Aud => self.aud = true,
            H264NalType::Sps => self.sps = true,
            H264NalType::Pps => self.pps = true,
            H264NalType::Sei => self.sei = true,
            H264NalType::Idr => self.idr = true,
            t if t.is_non_idr_slice() => self.slice = true,
            _ => {}
        }
    }

    /// Parameter sets but no coded picture.
    pub fn is_parameter_set_only(&self) -> bool {
        (self.sps || self.pps) && !self.idr && !self.slice
    }

    /// Both SPS and PPS are present.
    pub fn has_parameter_sets(&self) -> bool {
        self.sps && self.pps
    }

    /// Any coded slice, IDR or not.
    pub fn has_picture(&self) -> bool {
        self.idr || self.slice
    }

    fn merge(&mut self, other: NalCategories) {
        self.aud |= other.aud;
        self.sps |= other.sps;
        self.pps |= other.pps;
        self.sei |= other.sei;
        self.idr |= other.idr;
        self.slice |= other.slice;
    }
}

/// One finalized access unit, Annex-B encoded.
///
/// Owns its bytes; never aliases the accumulator's working buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub pts: Option<TimeCode>,
    pub dts: Option<TimeCode>,
    /// Keyframe marker handed to the decoder.
    pub is_keyframe: bool,
    pub categories: NalCategories,
}

impl AccessUnit {
    /// Build a unit from Annex-B bytes, classifying its NAL units.
    pub fn from_annexb(data: Vec<u8>, pts: Option<TimeCode>, dts: Option<TimeCode>) -> Self {
        let mut categories = NalCategories::default();
        for view in NalSplitter::new(&data) {
            categories.record(view.nal_type);
        }
        Self {
            data,
            pts,
            dts,
            is_keyframe: categories.idr,
            categories,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_parameter_set_only(&self) -> bool {
        self.categories.is_parameter_set_only()
    }

    pub fn has_idr(&self) -> bool {
        self.categories.idr
    }

    /// NAL units of this unit, in stored order.
    pub fn nals(&self) -> NalSplitter<'_> {
        NalSplitter::new(&self.data)
    }

    /// `self` followed by `unit`, keeping `unit`'s timing.
    pub fn prepend_to(self, unit: AccessUnit) -> AccessUnit {
        let mut data = Vec::with_capacity(self.data.len() + unit.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&unit.data);
        let mut categories = self.categories;
        categories.merge(unit.categories);
        AccessUnit {
            data,
            pts: unit.pts,
            dts: unit.dts,
            is_keyframe: unit.is_keyframe,
            categories,
        }
    }

    /// Whether the NAL order is already acceptable: the unit opens with its
    /// AUD (if it has one) and the remaining NAL units never step back in
    /// rank. Extra AUDs are ignored.
    pub fn is_canonical_order(&self) -> bool {
        let mut views = self.nals().peekable();
        if self.categories.aud {
            match views.peek() {
                Some(v) if v.nal_type == H264NalType::Aud => {}
                _ => return false,
            }
        }
        let mut last_rank = 0;
        for view in views.filter(|v| v.nal_type != H264NalType::Aud) {
            let rank = view.nal_type.canonical_rank();
            if rank < last_rank {
                return false;
            }
            last_rank = rank;
        }
        true
    }

    /// Rewrite the NAL order to AUD, SPS, PPS, SEI, IDR slices, others.
    ///
    /// Units already in canonical order are returned untouched. Otherwise
    /// the sort is stable and moves whole views, so the byte length is
    /// unchanged.
    pub fn into_canonical_order(self) -> AccessUnit {
        if self.is_canonical_order() {
            return self;
        }

        let mut views: Vec<NalView> = self.nals().collect();
        views.sort_by_key(|v| v.nal_type.canonical_rank());

        let mut data = Vec::with_capacity(self.data.len());
        for view in &views {
            data.extend_from_slice(view.bytes(&self.data));
        }
        debug_assert_eq!(data.len(), self.data.len());

        AccessUnit { data, ..self }
    }
}

/// Timing carried from the packet that contributed a NAL unit.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PacketTiming {
    pub pts: Option<TimeCode>,
    pub dts: Option<TimeCode>,
    pub is_keyframe: bool,
}

impl From<&VideoPacket> for PacketTiming {
    fn from(packet: &VideoPacket) -> Self {
        Self {
            pts: packet.pts,
            dts: packet.dts,
            is_keyframe: packet.is_keyframe,
        }
    }
}

/// Builds access units out of a stream of NAL units.
#[derive(Debug)]
pub struct AccessUnitAccumulator {
    /// Working buffer, reused across units.
    buf: Vec<u8>,
    categories: NalCategories,
    timing: PacketTiming,
    finalize_on_packet_end: bool,
    units_emitted: u64,
}

impl AccessUnitAccumulator {
    /// Initial working-buffer capacity.
    const INITIAL_CAPACITY: usize = 256 * 1024;

    pub fn new(finalize_on_packet_end: bool) -> Self {
        Self {
            buf: Vec::with_capacity(Self::INITIAL_CAPACITY),
            categories: NalCategories::default(),
            timing: PacketTiming::default(),
            finalize_on_packet_end,
            units_emitted: 0,
        }
    }

    /// Split `packet` into NAL units and accumulate them.
    ///
    /// Returns every unit finalized along the way, in stream order.
    pub fn push_packet(&mut self, packet: &VideoPacket) -> Vec<AccessUnit> {
        let timing = PacketTiming::from(packet);
        let mut finished = Vec::new();

        for view in NalSplitter::new(&packet.data) {
            if let Some(unit) = self.push_nal(&packet.data, view, timing) {
                finished.push(unit);
            }
        }

        if self.finalize_on_packet_end {
            finished.extend(self.finalize());
        }
        finished
    }

    /// Accumulate one NAL unit located by `view` inside `buf`.
    ///
    /// Returns the previous unit if this NAL unit starts a new one.
    pub fn push_nal(
        &mut self,
        buf: &[u8],
        view: NalView,
        timing: PacketTiming,
    ) -> Option<AccessUnit> {
        let finished = if self.starts_new_unit(buf, view) {
            self.finalize()
        } else {
            None
        };

        if self.buf.is_empty() {
            self.timing = timing;
        } else {
            self.timing.is_keyframe |= timing.is_keyframe;
        }

        self.buf.extend_from_slice(view.bytes(buf));
        self.categories.record(view.nal_type);
        finished
    }

    /// Finalize whatever is held (end of stream).
    pub fn finish(&mut self) -> Option<AccessUnit> {
        self.finalize()
    }

    /// Discard the held unit (seek/restart).
    pub fn reset(&mut self) {
        self.buf.clear();
        self.categories = NalCategories::default();
        self.timing = PacketTiming::default();
    }

    /// Bytes currently held.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn units_emitted(&self) -> u64 {
        self.units_emitted
    }

    fn starts_new_unit(&self, buf: &[u8], view: NalView) -> bool {
        let held_slice = self.categories.has_picture();
        match view.nal_type {
            H264NalType::Aud => held_slice,
            t if t.is_slice() => {
                if !held_slice || self.categories.aud {
                    return false;
                }
                match first_mb_in_slice(view.payload(buf)) {
                    Ok(first_mb) => first_mb == 0,
                    Err(e) => {
                        trace!(error = %e, "Unreadable slice header, treating as continuation");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    fn finalize(&mut self) -> Option<AccessUnit> {
        if self.buf.is_empty() {
            return None;
        }

        let unit = AccessUnit {
            data: self.buf.clone(),
            pts: self.timing.pts,
            dts: self.timing.dts,
            is_keyframe: self.timing.is_keyframe,
            categories: self.categories,
        };

        self.buf.clear();
        self.categories = NalCategories::default();
        self.timing = PacketTiming::default();
        self.units_emitted += 1;

        trace!(
            len = unit.len(),
            idr = unit.categories.idr,
            slice = unit.categories.slice,
            "Access unit finalized"
        );
        Some(unit)
    }
}
