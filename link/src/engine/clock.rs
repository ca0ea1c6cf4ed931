// RTLINK — SYNCHRONIZED CLOCK
// CLOCK_MONOTONIC in nanoseconds, cached per read, plus the peer-offset and
// one-way-delay estimates the sync exchange maintains.
//
// Estimates are f64 ns so exponential smoothing does not truncate towards zero.
// Synced time = cached local + offset. Nothing here touches the network.

use std::io;

use crate::config::FaultPolicy;
use crate::error::LinkError;

/// Weight of a new RTT/2 sample in the delay estimate.
pub const DELAY_GAIN: f64 = 0.1;
/// Weight of a new offset sample in the offset estimate.
pub const OFFSET_GAIN: f64 = 0.01;

// ============================================================================
// TIME SOURCES
// ============================================================================

/// Where local time comes from. Monotonic, nanoseconds.
pub trait TimeSource: Send {
    fn monotonic_ns(&self) -> io::Result<u64>;
}

/// The kernel's CLOCK_MONOTONIC.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

#[inline(always)]
pub fn clock_ns() -> io::Result<u64> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid, writable timespec.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

impl TimeSource for MonotonicClock {
    #[inline(always)]
    fn monotonic_ns(&self) -> io::Result<u64> {
        clock_ns()
    }
}

// ============================================================================
// SYNC CLOCK
// ============================================================================

pub struct SyncClock {
    source: Box<dyn TimeSource>,
    policy: FaultPolicy,
    local_ns: u64,
    offset_ns: f64,
    delay_ns: f64,
    faults: u64,
}

impl SyncClock {
    pub fn new(policy: FaultPolicy) -> Self {
        Self::with_source(Box::new(MonotonicClock), policy)
    }

    pub fn with_source(source: Box<dyn TimeSource>, policy: FaultPolicy) -> Self {
        SyncClock { source, policy, local_ns: 0, offset_ns: 0.0, delay_ns: 0.0, faults: 0 }
    }

    /// Read the local clock, cache it, return synced time.
    ///
    /// A failed read is an error under Strict; under Relaxed the previous
    /// cached value is reused and counted.
    #[inline]
    pub fn now(&mut self) -> Result<u64, LinkError> {
        match self.source.monotonic_ns() {
            Ok(ns) => self.local_ns = ns,
            Err(e) => match self.policy {
                FaultPolicy::Strict => return Err(LinkError::Clock(e)),
                FaultPolicy::Relaxed => {
                    self.faults += 1;
                    if self.faults == 1 {
                        tracing::warn!(error = %e, "clock_gettime failed, reusing cached time");
                    } else {
                        tracing::debug!(error = %e, "clock_gettime failed");
                    }
                }
            },
        }
        Ok(self.curtime())
    }

    /// Cached local time plus offset. Does not read the clock.
    #[inline(always)]
    pub fn curtime(&self) -> u64 {
        self.local_ns.wrapping_add_signed(self.offset_ns.round() as i64)
    }

    #[inline(always)]
    pub fn local_ns(&self) -> u64 {
        self.local_ns
    }

    #[inline(always)]
    pub fn offset_ns(&self) -> f64 {
        self.offset_ns
    }

    #[inline(always)]
    pub fn delay_ns(&self) -> f64 {
        self.delay_ns
    }

    /// Failed reads swallowed under Relaxed policy.
    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// delay = 0.9 * delay + 0.1 * rtt / 2
    #[inline]
    pub fn update_delay(&mut self, rtt_ns: f64) {
        self.delay_ns = (1.0 - DELAY_GAIN) * self.delay_ns + DELAY_GAIN * rtt_ns / 2.0;
    }

    /// offset = 0.99 * offset + 0.01 * ((peer_ts + delay) - local), against
    /// the cached local reading.
    #[inline]
    pub fn update_offset(&mut self, peer_ts: u64) {
        let sample = (peer_ts as f64 + self.delay_ns) - self.local_ns as f64;
        self.offset_ns = (1.0 - OFFSET_GAIN) * self.offset_ns + OFFSET_GAIN * sample;
    }

    /// Forget both estimates.
    pub fn reset(&mut self) {
        self.offset_ns = 0.0;
        self.delay_ns = 0.0;
    }
}

impl std::fmt::Debug for SyncClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClock")
            .field("local_ns", &self.local_ns)
            .field("offset_ns", &self.offset_ns)
            .field("delay_ns", &self.delay_ns)
            .field("faults", &self.faults)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    use super::TimeSource;

    /// Hand-driven time for tests.
    #[derive(Clone, Default)]
    pub struct ManualTime {
        pub now: Arc<AtomicU64>,
        pub fail: Arc<AtomicBool>,
    }

    impl ManualTime {
        pub fn at(ns: u64) -> Self {
            let t = ManualTime::default();
            t.now.store(ns, Ordering::SeqCst);
            t
        }

        pub fn set(&self, ns: u64) {
            self.now.store(ns, Ordering::SeqCst);
        }

        pub fn advance(&self, ns: u64) {
            self.now.fetch_add(ns, Ordering::SeqCst);
        }
    }

    impl TimeSource for ManualTime {
        fn monotonic_ns(&self) -> io::Result<u64> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            Ok(self.now.load(Ordering::SeqCst))
        }
    }
}
