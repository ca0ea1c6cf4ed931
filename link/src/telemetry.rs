// RTLINK — TELEMETRY
// Lock-free counters bumped on the datapath (Relaxed; they order nothing) and
// a plain snapshot for reporting. Faults that Relaxed policy swallows end up
// here instead of in an Err.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Telemetry {
    pub frames_queued: AtomicU64,
    pub frames_received: AtomicU64,
    pub records_received: AtomicU64,
    /// Filtered out: wrong addresses/ports, runt payloads.
    pub frames_dropped: AtomicU64,
    pub capture_faults: AtomicU64,
    pub wrong_format: AtomicU64,
    pub kick_errors: AtomicU64,
    pub timeouts: AtomicU64,
}

#[inline(always)]
pub(crate) fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

#[inline(always)]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Count a swallowed fault: the first of its kind is a warning, later ones
/// only show up at debug level.
pub(crate) fn record_fault(counter: &AtomicU64, what: &'static str, detail: &dyn fmt::Display) {
    if bump(counter) == 0 {
        tracing::warn!(what, %detail, "fault ignored under relaxed policy (further ones logged at debug)");
    } else {
        tracing::debug!(what, %detail, "fault ignored");
    }
}

impl Telemetry {
    pub fn snapshot(&self, clock_faults: u64) -> TelemetrySnapshot {
        let ld = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TelemetrySnapshot {
            frames_queued: ld(&self.frames_queued),
            frames_received: ld(&self.frames_received),
            records_received: ld(&self.records_received),
            frames_dropped: ld(&self.frames_dropped),
            capture_faults: ld(&self.capture_faults),
            wrong_format: ld(&self.wrong_format),
            kick_errors: ld(&self.kick_errors),
            timeouts: ld(&self.timeouts),
            clock_faults,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub frames_queued: u64,
    pub frames_received: u64,
    pub records_received: u64,
    pub frames_dropped: u64,
    pub capture_faults: u64,
    pub wrong_format: u64,
    pub kick_errors: u64,
    pub timeouts: u64,
    pub clock_faults: u64,
}

impl TelemetrySnapshot {
    /// Sum of every fault counter.
    pub fn faults(&self) -> u64 {
        self.capture_faults + self.wrong_format + self.kick_errors + self.clock_faults
    }
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TX:{} RX:{} REC:{} DROP:{} CAPFAULT:{} WRONGFMT:{} KICKERR:{} CLKERR:{} TIMEOUT:{}",
            self.frames_queued,
            self.frames_received,
            self.records_received,
            self.frames_dropped,
            self.capture_faults,
            self.wrong_format,
            self.kick_errors,
            self.clock_faults,
            self.timeouts
        )
    }
}
