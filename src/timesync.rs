//! Clock-offset estimation against the remote authority.
//!
//! Every channel probes its node's clock and keeps a running local-to-remote
//! offset; remote timestamps are converted to local time through it before
//! touching any bucket. The probe cadence is adaptive: once two consecutive
//! probes agree on the offset the interval doubles toward a ceiling, and any
//! channel error drops it back to the floor.

use std::time::Duration;

/// Estimate the local-to-remote clock offset from one probe round trip.
///
/// `apportionment` is the share of the round trip attributed to the outbound
/// leg. It is a heuristic tunable (default 0.5), not a correctness knob: the
/// authority tolerates offsets well inside a validity duration.
pub fn estimate_offset(
    sent_local_ms: u64,
    received_local_ms: u64,
    server_time_ms: u64,
    apportionment: f64,
) -> i64 {
    let rtt = received_local_ms.saturating_sub(sent_local_ms);
    let outbound = (rtt as f64 * apportionment).round() as u64;
    let local_at_server = sent_local_ms.saturating_add(outbound);
    server_time_ms as i64 - local_at_server as i64
}

/// Convert a remote timestamp to local time using the current offset.
pub fn to_local_ms(server_time_ms: u64, offset_ms: i64) -> u64 {
    if offset_ms >= 0 {
        server_time_ms.saturating_sub(offset_ms as u64)
    } else {
        server_time_ms.saturating_add(offset_ms.unsigned_abs())
    }
}

/// Adaptive probe-interval state machine.
#[derive(Debug, Clone)]
pub struct ProbeInterval {
    current: Duration,
    min: Duration,
    max: Duration,
    last_offset: Option<i64>,
}

impl ProbeInterval {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { current: min, min, max: max.max(min), last_offset: None }
    }

    /// The delay before the next probe.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a successful probe. Two consecutive identical offsets mean the
    /// channel's clock view is stable, so the interval grows.
    pub fn observe(&mut self, offset_ms: i64) {
        if self.last_offset == Some(offset_ms) {
            self.current = (self.current * 2).min(self.max);
        }
        self.last_offset = Some(offset_ms);
    }

    /// Any error or reply mismatch invalidates the stability assumption.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.last_offset = None;
    }
}
