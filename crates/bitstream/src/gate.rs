//! IDR gate and parameter-set header cache.
//!
//! Hardware decoders of this class reject a stream that does not start at an
//! IDR with its parameter sets in front. The gate drops everything until
//! the first IDR-bearing unit, completes that unit's parameter sets from
//! the cache, and rewrites its NAL order once.

use tracing::{debug, info, warn};

use crate::access_unit::AccessUnit;

/// Why the gate dropped a unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// No IDR has been accepted yet and this unit has none.
    AwaitingIdr,
    /// First IDR unit without SPS/PPS and nothing cached to complete it.
    MissingParameterSets,
}

/// Outcome of [`IdrGate::admit`].
#[derive(Clone, Debug, PartialEq)]
pub enum GateVerdict {
    /// Hand this unit to the decoder.
    Forward(AccessUnit),
    /// Parameter-set-only unit, held in the header cache.
    Cached,
    Dropped(DropReason),
}

/// Counters for the gate, reported in session statistics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GateStats {
    pub forwarded: u64,
    pub cached: u64,
    pub dropped_awaiting_idr: u64,
    pub dropped_missing_parameter_sets: u64,
    /// Units that went out with the header cache prefixed.
    pub prefixed: u64,
}

/// Gate state for one playback session.
#[derive(Debug, Default)]
pub struct IdrGate {
    /// At most one parameter-set-only unit.
    cache: Option<AccessUnit>,
    first_idr_found: bool,
    first_au_reordered: bool,
    stats: GateStats,
}

impl IdrGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what happens to one finalized access unit.
    ///
    /// Parameter-set-only units are never forwarded alone, even after the
    /// gate opens: they are cached and prefixed to the next forwarded unit.
    pub fn admit(&mut self, unit: AccessUnit) -> GateVerdict {
        if unit.is_parameter_set_only() {
            debug!(len = unit.len(), "Caching parameter-set-only access unit");
            self.cache = Some(unit);
            self.stats.cached += 1;
            return GateVerdict::Cached;
        }

        let mut unit = if self.first_idr_found {
            self.with_cache_prefix(unit)
        } else {
            match self.open_with(unit) {
                Ok(unit) => unit,
                Err(reason) => {
                    match reason {
                        DropReason::AwaitingIdr => self.stats.dropped_awaiting_idr += 1,
                        DropReason::MissingParameterSets => {
                            self.stats.dropped_missing_parameter_sets += 1
                        }
                    }
                    return GateVerdict::Dropped(reason);
                }
            }
        };

        if unit.has_idr() {
            unit.is_keyframe = true;
        }
        self.stats.forwarded += 1;
        GateVerdict::Forward(unit)
    }

    /// Seed the cache with out-of-band parameter sets (Annex-B bytes, as
    /// produced from container extradata).
    ///
    /// Ignored unless the bytes form a parameter-set-only unit.
    pub fn seed_parameter_sets(&mut self, annexb: Vec<u8>) {
        let unit = AccessUnit::from_annexb(annexb, None, None);
        if unit.is_parameter_set_only() {
            debug!(len = unit.len(), "Header cache seeded from extradata");
            self.cache = Some(unit);
        } else {
            debug!("Extradata holds no parameter sets, header cache not seeded");
        }
    }

    /// Restart gating after a seek. The header cache survives: parameter
    /// sets stay valid across a seek within the same stream.
    pub fn reset(&mut self) {
        self.first_idr_found = false;
        self.first_au_reordered = false;
    }

    /// Whether the first IDR has been accepted.
    pub fn is_open(&self) -> bool {
        self.first_idr_found
    }

    pub fn cached(&self) -> Option<&AccessUnit> {
        self.cache.as_ref()
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }

    /// Gate still closed: accept only a complete IDR unit.
    fn open_with(&mut self, unit: AccessUnit) -> Result<AccessUnit, DropReason> {
        if !unit.has_idr() {
            return Err(DropReason::AwaitingIdr);
        }

        let unit = if unit.categories.has_parameter_sets() {
            // Gating completes; an older cache is now stale.
            self.cache = None;
            unit
        } else {
            match self.cache.take() {
                Some(cache) => {
                    self.stats.prefixed += 1;
                    cache.prepend_to(unit)
                }
                None => {
                    warn!(
                        len = unit.len(),
                        "IDR access unit without SPS/PPS and no cached parameter sets, dropping"
                    );
                    return Err(DropReason::MissingParameterSets);
                }
            }
        };

        self.first_idr_found = true;
        let unit = if self.first_au_reordered {
            unit
        } else {
            self.first_au_reordered = true;
            unit.into_canonical_order()
        };
        info!(len = unit.len(), pts = ?unit.pts, "First IDR accepted, gate open");
        Ok(unit)
    }

    /// Gate open: a parameter-set update cached since the last forwarded
    /// unit rides in front of the next one.
    fn with_cache_prefix(&mut self, unit: AccessUnit) -> AccessUnit {
        match self.cache.take() {
            Some(cache) => {
                debug!(len = cache.len(), "Prefixing parameter-set update");
                self.stats.prefixed += 1;
                cache.prepend_to(unit)
            }
            None => unit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pj_common::TimeCode;

    const AUD: &[u8] = &[0, 0, 0, 1, 0x09, 0xF0];
    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80];
    const SEI: &[u8] = &[0, 0, 0, 1, 0x06, 0x05, 0x01, 0x80];
    const IDR: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21];
    const P: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x02];

    fn unit(nals: &[&[u8]]) -> AccessUnit {
        AccessUnit::from_annexb(nals.concat(), None, None)
    }

    fn forwarded(verdict: GateVerdict) -> AccessUnit {
        match verdict {
            GateVerdict::Forward(unit) => unit,
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn non_idr_units_dropped_before_first_idr() {
        let mut gate = IdrGate::new();
        for _ in 0..5 {
            assert_eq!(
                gate.admit(unit(&[AUD, P])),
                GateVerdict::Dropped(DropReason::AwaitingIdr)
            );
        }
        assert!(!gate.is_open());
        assert_eq!(gate.stats().forwarded, 0);
        assert_eq!(gate.stats().dropped_awaiting_idr, 5);
    }

    #[test]
    fn complete_idr_opens_gate() {
        let mut gate = IdrGate::new();
        let out = forwarded(gate.admit(unit(&[AUD, SPS, PPS, IDR])));
        assert_eq!(out.data, [AUD, SPS, PPS, IDR].concat());
        assert!(out.is_keyframe);
        assert!(gate.is_open());
    }

    #[test]
    fn cached_parameter_sets_prefix_first_idr() {
        let mut gate = IdrGate::new();
        assert_eq!(gate.admit(unit(&[SPS, PPS])), GateVerdict::Cached);
        assert!(gate.cached().is_some());

        let out = forwarded(gate.admit(unit(&[IDR])));
        assert_eq!(out.data, [SPS, PPS, IDR].concat());
        assert!(gate.cached().is_none());
        assert_eq!(gate.stats().prefixed, 1);
    }

    #[test]
    fn newer_cache_replaces_older() {
        let mut gate = IdrGate::new();
        gate.admit(unit(&[SPS]));
        gate.admit(unit(&[SPS, PPS]));
        let out = forwarded(gate.admit(unit(&[IDR])));
        assert_eq!(out.data, [SPS, PPS, IDR].concat());
    }

    #[test]
    fn idr_without_parameter_sets_or_cache_is_dropped() {
        let mut gate = IdrGate::new();
        assert_eq!(
            gate.admit(unit(&[AUD, IDR])),
            GateVerdict::Dropped(DropReason::MissingParameterSets)
        );
        assert!(!gate.is_open());

        // A later complete IDR still opens the gate.
        assert!(matches!(
            gate.admit(unit(&[SPS, PPS, IDR])),
            GateVerdict::Forward(_)
        ));
    }

    #[test]
    fn first_idr_unit_reordered_once() {
        let mut gate = IdrGate::new();
        let out = forwarded(gate.admit(unit(&[SEI, IDR, PPS, SPS, AUD])));
        assert_eq!(out.data, [AUD, SPS, PPS, SEI, IDR].concat());

        // Later IDR units pass as they are.
        let later = forwarded(gate.admit(unit(&[SEI, IDR, PPS, SPS])));
        assert_eq!(later.data, [SEI, IDR, PPS, SPS].concat());
    }

    #[test]
    fn units_forward_unconditionally_after_open() {
        let mut gate = IdrGate::new();
        forwarded(gate.admit(unit(&[SPS, PPS, IDR])));
        let out = forwarded(gate.admit(unit(&[P])));
        assert_eq!(out.data, P);
        assert!(!out.is_keyframe);
    }

    #[test]
    fn keyframe_forced_on_idr_units() {
        let mut gate = IdrGate::new();
        forwarded(gate.admit(unit(&[SPS, PPS, IDR])));
        let mut idr = unit(&[IDR]);
        idr.is_keyframe = false;
        assert!(forwarded(gate.admit(idr)).is_keyframe);
    }

    #[test]
    fn parameter_set_update_rides_on_next_unit() {
        let mut gate = IdrGate::new();
        forwarded(gate.admit(unit(&[SPS, PPS, IDR])));
        assert_eq!(gate.admit(unit(&[SPS, PPS])), GateVerdict::Cached);

        let mut next = unit(&[IDR]);
        next.pts = Some(TimeCode::from_secs(3.0));
        let out = forwarded(gate.admit(next));
        assert_eq!(out.data, [SPS, PPS, IDR].concat());
        assert_eq!(out.pts, Some(TimeCode::from_secs(3.0)));
        assert!(gate.cached().is_none());
    }

    #[test]
    fn seeded_cache_completes_first_idr() {
        let mut gate = IdrGate::new();
        gate.seed_parameter_sets([SPS, PPS].concat());
        let out = forwarded(gate.admit(unit(&[IDR])));
        assert_eq!(out.data, [SPS, PPS, IDR].concat());
    }

    #[test]
    fn seed_ignores_non_parameter_sets() {
        let mut gate = IdrGate::new();
        gate.seed_parameter_sets(IDR.to_vec());
        assert!(gate.cached().is_none());
    }

    #[test]
    fn reset_closes_gate_and_reorders_again() {
        let mut gate = IdrGate::new();
        forwarded(gate.admit(unit(&[SPS, PPS, IDR])));
        gate.reset();
        assert!(!gate.is_open());
        assert_eq!(
            gate.admit(unit(&[P])),
            GateVerdict::Dropped(DropReason::AwaitingIdr)
        );
        let out = forwarded(gate.admit(unit(&[IDR, SPS, PPS])));
        assert_eq!(out.data, [SPS, PPS, IDR].concat());
    }
}
