// RTLINK — CLOCK SYNC ENGINE
// Master/slave round-trip exchange over a SpikeLink.
//
// Master, per iteration: send SYNC{t0 = local, t = synced}, spin for the
// echo, rtt = local_now - t0, smooth delay (rtt/2) and offset, record rtt
// and clock difference. Afterwards one SPIKES record ends the slave's loop.
// Slave: echo every SYNC with its own synced time; stop on anything else.
//
// Statistics skip the first 80% of samples as warm-up. One-way delay is
// taken as rtt/2; asymmetric legs show up as offset error of half their
// difference.

use std::fmt;

use crate::config::Role;
use crate::error::LinkError;
use crate::protocol::wire::{PacketType, SpikeRecord};
use crate::transport::SpikeLink;

/// Share of samples discarded before statistics are taken.
pub const WARMUP_FRACTION: f64 = 0.8;

/// Outcome of a master run. The slave returns the default.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncStatus {
    /// Smoothed one-way delay estimate, ns.
    pub delay: f64,
    /// Stdev of RTT over the trailing window, ns.
    pub delay_stdev: f64,
    /// Smoothed offset estimate (peer minus local), ns.
    pub offset: f64,
    /// Stdev of the clock difference over the trailing window, ns.
    pub offset_stdev: f64,
    pub rtt_mean: f64,
    pub clock_diff_mean: f64,
    /// Samples in the trailing window.
    pub samples: usize,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "End2End Latency [us]: {:>15.9} +/- {:<15.9}", 1e-3 * self.delay, 1e-3 * self.delay_stdev)?;
        writeln!(f, "Clock Offset    [ s]: {:>15.9} +/- {:<15.9}", 1e-9 * self.offset, 1e-9 * self.offset_stdev)
    }
}

/// Population mean and standard deviation. `(0, 0)` for no samples.
pub fn mean_stdev(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Index of the first sample kept for statistics.
pub fn warmup_len(samples: usize) -> usize {
    (samples as f64 * WARMUP_FRACTION) as usize
}

/// Echo loop. Returns once a non-SYNC record arrives.
pub fn run_slave<L: SpikeLink>(link: &mut L) -> Result<SyncStatus, LinkError> {
    let mut echoes = 0u64;
    loop {
        let rec = *link.receive_blocking::<SpikeRecord>()?;
        if !rec.is_sync() {
            link.free_receive();
            break;
        }
        let now = link.clock_mut().now()?;
        link.enqueue(&SpikeRecord::sync(rec.timestamp0, now))?;
        link.flush()?;
        link.free_receive();
        echoes += 1;
    }
    tracing::info!(echoes, "slave sync finished");
    Ok(SyncStatus::default())
}

/// Run `iterations` exchanges, leave the estimates in the link's clock, end
/// the slave's loop and summarize.
pub fn run_master<L: SpikeLink>(link: &mut L, iterations: usize) -> Result<SyncStatus, LinkError> {
    let mut rtt = Vec::with_capacity(iterations);
    let mut clock_diff = Vec::with_capacity(iterations);

    for i in 0..iterations {
        let synced = link.clock_mut().now()?;
        let t0 = link.clock().local_ns();
        link.enqueue(&SpikeRecord::sync(t0, synced))?;
        link.flush()?;

        let echo = loop {
            let rec = *link.receive_blocking::<SpikeRecord>()?;
            let nonce = rec.timestamp0;
            if rec.is_sync() && nonce == t0 {
                break rec;
            }
            tracing::debug!(iteration = i, record = ?rec, "stale record during sync");
            link.free_receive();
        };

        let clock = link.clock_mut();
        clock.now()?;
        let sample = clock.local_ns().saturating_sub(t0) as f64;
        clock.update_delay(sample);
        clock.update_offset(echo.timestamp);
        clock_diff.push(clock.curtime() as f64 - (echo.timestamp as f64 + clock.delay_ns()));
        rtt.push(sample);
        link.free_receive();
    }

    link.enqueue(&SpikeRecord::new(0, 0, 0, PacketType::Spikes))?;
    link.flush()?;

    let skip = warmup_len(rtt.len());
    let (rtt_mean, rtt_stdev) = mean_stdev(&rtt[skip..]);
    let (diff_mean, diff_stdev) = mean_stdev(&clock_diff[skip..]);
    let clock = link.clock();
    let status = SyncStatus {
        delay: clock.delay_ns(),
        delay_stdev: rtt_stdev,
        offset: clock.offset_ns(),
        offset_stdev: diff_stdev,
        rtt_mean,
        clock_diff_mean: diff_mean,
        samples: rtt.len() - skip,
    };
    tracing::info!(
        iterations,
        delay_ns = status.delay,
        offset_ns = status.offset,
        rtt_stdev_ns = status.delay_stdev,
        "master sync finished"
    );
    Ok(status)
}

/// Run the role's side of the exchange.
pub fn sync<L: SpikeLink>(link: &mut L, role: Role, iterations: usize) -> Result<SyncStatus, LinkError> {
    match role {
        Role::Master => run_master(link, iterations),
        Role::Slave => run_slave(link),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::config::FaultPolicy;
    use crate::engine::clock::testing::ManualTime;
    use crate::engine::clock::SyncClock;
    use crate::protocol::wire::Record;

    /// Master-side link whose peer answers instantly in simulated time:
    /// one-way delay `one_way` (+ alternating `jitter`), peer clock ahead by
    /// `peer_offset`.
    struct SimulatedPeer {
        time: ManualTime,
        clock: SyncClock,
        one_way: u64,
        jitter: u64,
        peer_offset: i64,
        sent: u64,
        inbox: VecDeque<SpikeRecord>,
        current: Option<SpikeRecord>,
        terminated: bool,
    }

    impl SimulatedPeer {
        fn new(one_way: u64, jitter: u64, peer_offset: i64) -> Self {
            let time = ManualTime::at(1_000_000_000);
            let clock = SyncClock::with_source(Box::new(time.clone()), FaultPolicy::Strict);
            SimulatedPeer {
                time,
                clock,
                one_way,
                jitter,
                peer_offset,
                sent: 0,
                inbox: VecDeque::new(),
                current: None,
                terminated: false,
            }
        }

        fn leg(&mut self) -> u64 {
            self.sent += 1;
            if self.sent % 2 == 0 {
                self.one_way + self.jitter
            } else {
                self.one_way - self.jitter
            }
        }
    }

    impl SpikeLink for SimulatedPeer {
        fn enqueue<R: Record>(&mut self, record: &R) -> Result<(), LinkError> {
            let rec: SpikeRecord = bytemuck::pod_read_unaligned(bytemuck::bytes_of(record));
            if !rec.is_sync() {
                self.terminated = true;
                return Ok(());
            }
            let out = self.leg();
            self.time.advance(out);
            let peer_now = self.time.now.load(std::sync::atomic::Ordering::SeqCst) as i64 + self.peer_offset;
            self.inbox.push_back(SpikeRecord::sync(rec.timestamp0, peer_now as u64));
            let back = self.leg();
            self.time.advance(back);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), LinkError> {
            Ok(())
        }

        fn receive_blocking<R: Record>(&mut self) -> Result<&R, LinkError> {
            self.current = self.inbox.pop_front();
            let rec = self.current.as_ref().ok_or(LinkError::Timeout { op: "receive" })?;
            Ok(bytemuck::from_bytes(bytemuck::bytes_of(rec)))
        }

        fn free_receive(&mut self) {
            self.current = None;
        }

        fn clock(&self) -> &SyncClock {
            &self.clock
        }

        fn clock_mut(&mut self) -> &mut SyncClock {
            &mut self.clock
        }
    }

    #[test]
    fn stats_helpers() {
        assert_eq!(mean_stdev(&[]), (0.0, 0.0));
        let (m, s) = mean_stdev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(m, 5.0);
        assert_eq!(s, 2.0);
        assert_eq!(warmup_len(10_000), 8_000);
        assert_eq!(warmup_len(5), 4);
    }

    #[test]
    fn master_converges_to_delay_and_offset() {
        const D: u64 = 5_000;
        const O: i64 = 123_456;
        let mut link = SimulatedPeer::new(D, 0, O);
        let status = run_master(&mut link, 10_000).unwrap();

        assert!(link.terminated, "slave loop must be ended");
        assert!((status.delay - D as f64).abs() < 1.0, "{:?}", status);
        assert!((status.offset - O as f64).abs() < 1.0, "{:?}", status);
        assert!((status.rtt_mean - 2.0 * D as f64).abs() < 1e-6);
        assert!(status.clock_diff_mean.abs() < 1.0);
        assert_eq!(status.samples, 2_000);
        assert!(status.delay_stdev < 1e-6);
    }

    #[test]
    fn negative_peer_offset() {
        let mut link = SimulatedPeer::new(2_000, 0, -40_000);
        let status = run_master(&mut link, 5_000).unwrap();
        assert!((status.offset + 40_000.0).abs() < 1.0, "{:?}", status);
    }

    #[test]
    fn stdev_shrinks_with_more_samples() {
        let short = run_master(&mut SimulatedPeer::new(5_000, 0, 1_000_000), 100).unwrap();
        let long = run_master(&mut SimulatedPeer::new(5_000, 0, 1_000_000), 10_000).unwrap();
        assert!(long.offset_stdev < short.offset_stdev, "{} !< {}", long.offset_stdev, short.offset_stdev);
    }

    #[test]
    fn asymmetric_legs_bias_offset_by_half_the_difference() {
        // Outbound 9.5us, return 10.5us: rtt is still constant.
        let status = run_master(&mut SimulatedPeer::new(10_000, 500, 0), 10_000).unwrap();
        assert!((status.delay - 10_000.0).abs() < 1.0, "{:?}", status);
        assert!((status.rtt_mean - 20_000.0).abs() < 1e-6, "{:?}", status);
        assert!(status.delay_stdev < 1e-6, "{:?}", status);
        assert!((status.offset + 500.0).abs() < 1.0, "{:?}", status);
    }

    #[test]
    fn display_two_lines() {
        let status = SyncStatus { delay: 12_345.0, delay_stdev: 10.0, offset: -2.5e9, offset_stdev: 1.0, ..Default::default() };
        let text = status.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("End2End Latency [us]:"));
        assert!(lines[0].contains("12.345000000 +/- 0.010000000"));
        assert!(lines[1].contains("-2.500000000 +/- 0.000000001"));
    }
}
