// RTLINK — RING TRANSPORT
// Zero-copy record transport over a PACKET_MMAP RX/TX ring pair.
//
// TX: claim the slot at the TX cursor once its status is AVAILABLE, write the
// records at TX_DATA_OFFSET + 28, build IPv4/UDP headers in front of them,
// set tp_len, publish with SEND_REQUEST (release). flush() kicks the kernel.
//
// RX: the slot at the RX cursor is ours once its status has USER set
// (acquire). Records are returned as views into the slot; they stay valid
// until free_receive() hands every consumed slot back (KERNEL, release) in
// consumption order.
//
// Single-threaded by contract: one owner drives both rings. The optional
// background kick thread touches nothing but the kick.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{FaultPolicy, LinkConfig};
use crate::engine::clock::SyncClock;
use crate::error::{CaptureFault, LinkError};
use crate::net::{udp_payload, validate_frame, Endpoint, FrameTemplate, MacAddr};
use crate::protocol::wire::{Record, HEADERS_LEN, IP_HDR_LEN, UDP_HDR_LEN};
use crate::ring::loopback::LoopbackWire;
use crate::ring::socket::open_rings;
use crate::ring::{
    page_size, RingCursor, RingRegion, Slot, TxKick, TP_STATUS_AVAILABLE, TP_STATUS_COPY, TP_STATUS_KERNEL,
    TP_STATUS_SEND_REQUEST, TP_STATUS_USER, TP_STATUS_WRONG_FORMAT, TX_DATA_OFFSET,
};
use crate::telemetry::{self, Telemetry, TelemetrySnapshot};

// ============================================================================
// LINK CONTRACT
// ============================================================================

/// What the clock-sync engine needs from a transport.
pub trait SpikeLink {
    fn enqueue<R: Record>(&mut self, record: &R) -> Result<(), LinkError>;
    fn flush(&mut self) -> Result<(), LinkError>;
    fn receive_blocking<R: Record>(&mut self) -> Result<&R, LinkError>;
    fn free_receive(&mut self);
    fn clock(&self) -> &SyncClock;
    fn clock_mut(&mut self) -> &mut SyncClock;
}

// ============================================================================
// SPIN WAIT
// ============================================================================

/// Busy-wait budget. Checks the deadline only every few hundred spins.
pub(crate) struct Spin {
    deadline: Option<Instant>,
    spins: u32,
}

impl Spin {
    const CHECK_EVERY: u32 = 256;

    pub(crate) fn forever() -> Self {
        Spin { deadline: None, spins: 0 }
    }

    pub(crate) fn within(timeout: Duration) -> Self {
        Spin { deadline: Instant::now().checked_add(timeout), spins: 0 }
    }

    /// One spin. `false` once the deadline has passed.
    #[inline(always)]
    pub(crate) fn tick(&mut self) -> bool {
        std::hint::spin_loop();
        let Some(deadline) = self.deadline else {
            return true;
        };
        self.spins = self.spins.wrapping_add(1);
        if self.spins % Self::CHECK_EVERY != 0 {
            return true;
        }
        Instant::now() < deadline
    }
}

// ============================================================================
// RX POLL
// ============================================================================

enum Poll<'a> {
    /// Next slot still belongs to the kernel.
    Empty,
    /// Every slot is consumed and unreleased.
    Backlog,
    /// Consumed a slot that carried nothing for us.
    Dropped,
    /// UDP payload of an accepted datagram.
    Frame(&'a [u8]),
}

struct Ring {
    region: Arc<RingRegion>,
    cursor: RingCursor,
}

impl Ring {
    fn new(region: Arc<RingRegion>) -> Self {
        let cursor = RingCursor::new(region.frame_count());
        Ring { region, cursor }
    }
}

fn capture_fault(slot: &Slot<'_>, status: usize) -> Option<CaptureFault> {
    if status & TP_STATUS_COPY != 0 {
        return Some(CaptureFault::CopyInProgress);
    }
    let (len, snaplen) = (slot.len(), slot.snaplen());
    if len != snaplen {
        return Some(CaptureFault::LengthMismatch { len, snaplen });
    }
    None
}

/// A consumed slot we will not hand to the caller. Released at once if
/// nothing older is outstanding, otherwise with the next free_receive().
fn drop_slot(region: &RingRegion, cursor: &mut RingCursor) {
    if cursor.pending() == 1 {
        if let Some(idx) = cursor.release() {
            region.slot(idx).set_status(TP_STATUS_KERNEL);
        }
    }
}

fn on_fault<'a>(
    fault: CaptureFault,
    slot: usize,
    region: &RingRegion,
    cursor: &mut RingCursor,
    policy: FaultPolicy,
    stats: &Telemetry,
) -> Result<Poll<'a>, LinkError> {
    match policy {
        FaultPolicy::Strict => Err(LinkError::Capture { slot, fault }),
        FaultPolicy::Relaxed => {
            telemetry::record_fault(&stats.capture_faults, "capture", &fault);
            drop_slot(region, cursor);
            Ok(Poll::Dropped)
        }
    }
}

fn poll_rx<'a>(
    region: &'a RingRegion,
    cursor: &mut RingCursor,
    endpoint: &Endpoint,
    policy: FaultPolicy,
    stats: &Telemetry,
) -> Result<Poll<'a>, LinkError> {
    if cursor.is_full() {
        return Ok(Poll::Backlog);
    }
    let slot = region.slot(cursor.index());
    let status = slot.status();
    if status & TP_STATUS_USER == 0 {
        return Ok(Poll::Empty);
    }
    cursor.advance();

    if let Some(fault) = capture_fault(&slot, status) {
        return on_fault(fault, slot.index(), region, cursor, policy, stats);
    }
    let (net, snaplen) = (slot.net_offset(), slot.snaplen());
    // SAFETY: USER status: the kernel left this slot to us until released.
    let Some(frame) = (unsafe { slot.data(net, snaplen as usize) }) else {
        return on_fault(CaptureFault::OutOfSlot { net, snaplen }, slot.index(), region, cursor, policy, stats);
    };

    if !validate_frame(frame, endpoint) {
        telemetry::bump(&stats.frames_dropped);
        tracing::trace!(slot = slot.index(), "foreign frame dropped");
        drop_slot(region, cursor);
        return Ok(Poll::Dropped);
    }
    match udp_payload(frame) {
        Some(n) if HEADERS_LEN + n <= frame.len() => Ok(Poll::Frame(&frame[HEADERS_LEN..HEADERS_LEN + n])),
        n => {
            let fault = CaptureFault::PayloadOverrun {
                udp_len: n.map_or(0, |n| n + UDP_HDR_LEN),
                captured: frame.len() - IP_HDR_LEN,
            };
            on_fault(fault, slot.index(), region, cursor, policy, stats)
        }
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// MTU assumed for in-memory pairs (Ethernet).
pub const ETHERNET_MTU: usize = 1500;

struct Flusher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct RingTransport {
    endpoint: Endpoint,
    rx: Ring,
    tx: Ring,
    kicker: Arc<dyn TxKick>,
    mtu: usize,
    flusher: Option<Flusher>,
    clock: SyncClock,
    policy: FaultPolicy,
    telemetry: Arc<Telemetry>,
    _rx_socket: Option<OwnedFd>,
}

impl RingTransport {
    /// Open both packet rings on `config.iface` for `endpoint`.
    /// Needs CAP_NET_RAW (and CAP_NET_ADMIN for the buffer sizes).
    pub fn open(config: &LinkConfig, endpoint: Endpoint) -> Result<Self, LinkError> {
        config.validate()?;
        let rings = open_rings(&config.iface, config.ring_depth, endpoint.remote_mac)?;
        let mut link = Self::from_parts(
            endpoint,
            Arc::new(rings.rx),
            Arc::new(rings.tx),
            Arc::new(rings.kick),
            rings.mtu,
            config.policy,
        )?;
        link._rx_socket = Some(rings.rx_socket);
        tracing::info!(
            local = %endpoint.local_ip,
            remote = %endpoint.remote_ip,
            sport = endpoint.src_port,
            dport = endpoint.dst_port,
            policy = ?config.policy,
            "transport open"
        );
        Ok(link)
    }

    /// Assemble a transport from already-mapped rings and a kick. Datagrams
    /// are kept within `mtu` bytes.
    pub fn from_parts(
        endpoint: Endpoint,
        rx: Arc<RingRegion>,
        tx: Arc<RingRegion>,
        kicker: Arc<dyn TxKick>,
        mtu: usize,
        policy: FaultPolicy,
    ) -> Result<Self, LinkError> {
        if tx.frame_size() < TX_DATA_OFFSET + HEADERS_LEN {
            return Err(LinkError::Config(format!("tx frame size {} cannot hold headers", tx.frame_size())));
        }
        if mtu < HEADERS_LEN {
            return Err(LinkError::Config(format!("mtu {} cannot hold headers", mtu)));
        }
        Ok(RingTransport {
            endpoint,
            rx: Ring::new(rx),
            tx: Ring::new(tx),
            kicker,
            mtu,
            flusher: None,
            clock: SyncClock::new(policy),
            policy,
            telemetry: Arc::new(Telemetry::default()),
            _rx_socket: None,
        })
    }

    /// Two transports wired back to back in memory, `depth` slots per ring,
    /// Ethernet MTU. `endpoint` is side A; side B gets the mirror image.
    pub fn pair(
        endpoint: Endpoint,
        local_mac: MacAddr,
        depth: usize,
        policy: FaultPolicy,
    ) -> Result<(Self, Self, LoopbackWire), LinkError> {
        let (wire, a, b) = LoopbackWire::new(page_size(), depth)?;
        let left = Self::from_parts(endpoint, a.rx, a.tx, a.kick, ETHERNET_MTU, policy)?;
        let right = Self::from_parts(endpoint.mirrored(local_mac), b.rx, b.tx, b.kick, ETHERNET_MTU, policy)?;
        Ok((left, right, wire))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn depth(&self) -> usize {
        self.rx.cursor.depth()
    }

    pub fn policy(&self) -> FaultPolicy {
        self.policy
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot(self.clock.faults())
    }

    pub fn clock(&self) -> &SyncClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut SyncClock {
        &mut self.clock
    }

    /// Read the clock and return synced time.
    pub fn now(&mut self) -> Result<u64, LinkError> {
        self.clock.now()
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest datagram a TX slot may carry: the slot or the MTU, whichever
    /// is smaller.
    fn max_datagram(&self) -> usize {
        self.mtu.min(self.tx.region.frame_size() - TX_DATA_OFFSET)
    }

    /// Records of type `R` that fit in one datagram.
    pub fn max_records_per_frame<R: Record>(&self) -> usize {
        (self.max_datagram() - HEADERS_LEN) / R::SIZE
    }

    // ------------------------------------------------------------------------
    // TX
    // ------------------------------------------------------------------------

    /// Write `records` as one datagram into the next TX slot.
    fn enqueue_frame<R: Record>(
        &mut self,
        records: &[R],
        template: &FrameTemplate,
        spin: &mut Spin,
    ) -> Result<(), LinkError> {
        if template.frame_len() > self.max_datagram() {
            return Err(LinkError::Config(format!(
                "{} byte datagram exceeds {} (mtu {})",
                template.frame_len(),
                self.max_datagram(),
                self.mtu
            )));
        }
        let region = &*self.tx.region;
        let slot = loop {
            let slot = region.slot(self.tx.cursor.index());
            match slot.status() {
                TP_STATUS_AVAILABLE => break slot,
                TP_STATUS_WRONG_FORMAT => match self.policy {
                    FaultPolicy::Strict => return Err(LinkError::WrongFormat { slot: slot.index() }),
                    FaultPolicy::Relaxed => {
                        telemetry::record_fault(&self.telemetry.wrong_format, "tx wrong format", &slot.index());
                        break slot;
                    }
                },
                _ => {}
            }
            if !spin.tick() {
                telemetry::bump(&self.telemetry.timeouts);
                return Err(LinkError::Timeout { op: "enqueue" });
            }
        };

        let payload: &[u8] = bytemuck::cast_slice(records);
        // SAFETY: AVAILABLE (or reclaimed WRONG_FORMAT) slots belong to us
        // until we publish SEND_REQUEST.
        let frame = unsafe { slot.data_mut(TX_DATA_OFFSET, HEADERS_LEN + payload.len()) }.ok_or_else(|| {
            LinkError::Config(format!("{} payload bytes do not fit a {} byte slot", payload.len(), region.frame_size()))
        })?;
        frame[HEADERS_LEN..].copy_from_slice(payload);
        let len = template.write(frame);
        slot.set_len(len as u32);
        slot.set_status(TP_STATUS_SEND_REQUEST);

        self.tx.cursor.advance();
        self.tx.cursor.release();
        telemetry::bump(&self.telemetry.frames_queued);
        Ok(())
    }

    /// Queue one record as one datagram. Spins while the TX ring is full.
    pub fn enqueue<R: Record>(&mut self, record: &R) -> Result<(), LinkError> {
        let template = FrameTemplate::new(&self.endpoint, R::SIZE);
        self.enqueue_frame(std::slice::from_ref(record), &template, &mut Spin::forever())
    }

    /// Like [`RingTransport::enqueue`], but gives up after `timeout`
    /// without producing a slot.
    pub fn enqueue_timeout<R: Record>(&mut self, record: &R, timeout: Duration) -> Result<(), LinkError> {
        let template = FrameTemplate::new(&self.endpoint, R::SIZE);
        self.enqueue_frame(std::slice::from_ref(record), &template, &mut Spin::within(timeout))
    }

    /// Several records in one datagram.
    pub fn enqueue_packed<R: Record>(&mut self, records: &[R]) -> Result<(), LinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let max = self.max_records_per_frame::<R>();
        if records.len() > max {
            return Err(LinkError::Config(format!("{} records exceed {} per frame", records.len(), max)));
        }
        let template = FrameTemplate::new(&self.endpoint, records.len() * R::SIZE);
        self.enqueue_frame(records, &template, &mut Spin::forever())
    }

    /// One datagram per record, headers computed once for the batch.
    pub fn enqueue_batch<R: Record>(&mut self, records: &[R]) -> Result<(), LinkError> {
        let template = FrameTemplate::new(&self.endpoint, R::SIZE);
        let mut spin = Spin::forever();
        for record in records {
            self.enqueue_frame(std::slice::from_ref(record), &template, &mut spin)?;
        }
        Ok(())
    }

    /// Enqueue and flush.
    pub fn send<R: Record>(&mut self, record: &R) -> Result<(), LinkError> {
        self.enqueue(record)?;
        self.flush()
    }

    /// Ask the kernel to transmit everything queued. Does not block. A no-op
    /// while the background kick thread runs.
    pub fn flush(&mut self) -> Result<(), LinkError> {
        if self.flusher.is_some() {
            return Ok(());
        }
        match self.kicker.kick(false) {
            Ok(()) => Ok(()),
            Err(e) => match self.policy {
                FaultPolicy::Strict => {
                    telemetry::bump(&self.telemetry.kick_errors);
                    Err(LinkError::Kick(e))
                }
                FaultPolicy::Relaxed => {
                    telemetry::record_fault(&self.telemetry.kick_errors, "tx kick", &e);
                    Ok(())
                }
            },
        }
    }

    /// Kick the TX ring continuously from a dedicated thread until the
    /// transport is dropped.
    pub fn start_background_flush(&mut self) -> Result<(), LinkError> {
        if self.flusher.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let kicker = self.kicker.clone();
        let stats = self.telemetry.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("rtlink-kick".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    if let Err(e) = kicker.kick(true) {
                        telemetry::record_fault(&stats.kick_errors, "tx kick", &e);
                    }
                }
            })
            .map_err(|source| LinkError::Socket { op: "spawn(kick thread)", source })?;
        self.flusher = Some(Flusher { stop, handle });
        tracing::info!("background tx kick thread started");
        Ok(())
    }

    pub fn is_background_flushing(&self) -> bool {
        self.flusher.is_some()
    }

    // ------------------------------------------------------------------------
    // RX
    // ------------------------------------------------------------------------

    fn receive_with<R: Record>(&mut self, spin: &mut Spin, op: &'static str) -> Result<&R, LinkError> {
        #[allow(clippy::let_unit_value)]
        let () = R::ASSERT_PACKED;
        let depth = self.rx.cursor.depth();
        let Self { rx, endpoint, policy, telemetry: stats, .. } = self;
        let region = &*rx.region;
        loop {
            match poll_rx(region, &mut rx.cursor, endpoint, *policy, stats)? {
                Poll::Frame(payload) => {
                    telemetry::bump(&stats.frames_received);
                    if payload.len() < R::SIZE {
                        telemetry::bump(&stats.frames_dropped);
                        drop_slot(region, &mut rx.cursor);
                        continue;
                    }
                    telemetry::add(&stats.records_received, R::count_in(payload.len()) as u64);
                    return Ok(bytemuck::from_bytes(&payload[..R::SIZE]));
                }
                Poll::Dropped => continue,
                Poll::Backlog => return Err(LinkError::RxBacklog { depth }),
                Poll::Empty => {
                    if !spin.tick() {
                        telemetry::bump(&stats.timeouts);
                        return Err(LinkError::Timeout { op });
                    }
                }
            }
        }
    }

    /// Spin until a datagram from the peer arrives; view its first record.
    ///
    /// The view borrows the transport: call [`RingTransport::free_receive`]
    /// once done with it.
    pub fn receive_blocking<R: Record>(&mut self) -> Result<&R, LinkError> {
        self.receive_with(&mut Spin::forever(), "receive")
    }

    /// Like [`RingTransport::receive_blocking`], giving up after `timeout`
    /// without consuming a slot.
    pub fn receive_blocking_timeout<R: Record>(&mut self, timeout: Duration) -> Result<&R, LinkError> {
        self.receive_with(&mut Spin::within(timeout), "receive")
    }

    /// Drain every ready datagram into `out` as record views. Returns how
    /// many were appended.
    pub fn receive_into<'a, R: Record>(&'a mut self, out: &mut Vec<&'a R>) -> Result<usize, LinkError> {
        #[allow(clippy::let_unit_value)]
        let () = R::ASSERT_PACKED;
        self.clock.now()?;
        let before = out.len();
        let Self { rx, endpoint, policy, telemetry: stats, .. } = self;
        let region = &*rx.region;
        loop {
            match poll_rx(region, &mut rx.cursor, endpoint, *policy, stats)? {
                Poll::Frame(payload) => {
                    let n = R::count_in(payload.len());
                    telemetry::bump(&stats.frames_received);
                    telemetry::add(&stats.records_received, n as u64);
                    out.extend(payload[..n * R::SIZE].chunks_exact(R::SIZE).map(bytemuck::from_bytes::<R>));
                }
                Poll::Dropped => continue,
                Poll::Empty | Poll::Backlog => return Ok(out.len() - before),
            }
        }
    }

    /// Every record of every ready datagram, without waiting.
    pub fn receive_nonblocking<R: Record>(&mut self) -> Result<Vec<&R>, LinkError> {
        let mut out = Vec::new();
        self.receive_into(&mut out)?;
        Ok(out)
    }

    /// Hand every consumed RX slot back to the kernel, oldest first.
    /// Invalidates all outstanding record views.
    pub fn free_receive(&mut self) {
        let region = &*self.rx.region;
        while let Some(idx) = self.rx.cursor.release() {
            region.slot(idx).set_status(TP_STATUS_KERNEL);
        }
    }

    /// RX slots consumed and not yet released.
    pub fn pending_receive(&self) -> usize {
        self.rx.cursor.pending()
    }
}

impl Drop for RingTransport {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.stop.store(true, Ordering::Relaxed);
            if flusher.handle.join().is_err() {
                tracing::error!("tx kick thread panicked");
            }
        }
        tracing::debug!(telemetry = %self.telemetry(), "transport closed");
    }
}

impl std::fmt::Debug for RingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingTransport")
            .field("endpoint", &self.endpoint)
            .field("depth", &self.depth())
            .field("policy", &self.policy)
            .field("mtu", &self.mtu)
            .field("rx", &self.rx.cursor)
            .field("tx", &self.tx.cursor)
            .finish()
    }
}

impl SpikeLink for RingTransport {
    #[inline]
    fn enqueue<R: Record>(&mut self, record: &R) -> Result<(), LinkError> {
        RingTransport::enqueue(self, record)
    }

    #[inline]
    fn flush(&mut self) -> Result<(), LinkError> {
        RingTransport::flush(self)
    }

    #[inline]
    fn receive_blocking<R: Record>(&mut self) -> Result<&R, LinkError> {
        RingTransport::receive_blocking(self)
    }

    #[inline]
    fn free_receive(&mut self) {
        RingTransport::free_receive(self)
    }

    fn clock(&self) -> &SyncClock {
        &self.clock
    }

    fn clock_mut(&mut self) -> &mut SyncClock {
        &mut self.clock
    }
}
