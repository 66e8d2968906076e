//! Rate limiting for diagnostics that repeat every frame.

/// Lets one event through, then one of every `interval` after it.
///
/// Owned by whoever emits the diagnostic; there is no shared state.
#[derive(Clone, Debug)]
pub struct LogThrottle {
    interval: u64,
    seen: u64,
    suppressed: u64,
}

impl LogThrottle {
    /// An `interval` of 0 is treated as 1 (log everything).
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            seen: 0,
            suppressed: 0,
        }
    }

    /// Record one event.
    ///
    /// Returns `Some(n)` when this event should be logged, `n` being the
    /// number of events suppressed since the last one that was.
    pub fn hit(&mut self) -> Option<u64> {
        let emit = self.seen % self.interval == 0;
        self.seen += 1;
        if emit {
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }

    /// Total events recorded since the last reset.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn reset(&mut self) {
        self.seen = 0;
        self.suppressed = 0;
    }
}
