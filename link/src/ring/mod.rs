// RTLINK — PACKET_MMAP RING ARENA
// A ring is a fixed-size byte arena of `frame_count` slots, `frame_size` bytes
// each, shared with the kernel. Every access goes through `RingRegion::slot`,
// which bounds-checks the index once; slot data accessors bounds-check
// offsets against the frame. Ownership of a slot is carried by its status
// word alone: whoever does not own it must not touch its payload.
//
// Layout per slot (TPACKET_V1):
//   [tpacket_hdr][pad to 16][... frame data at tp_net (rx) or TX_DATA_OFFSET (tx) ...]

pub mod loopback;
pub mod socket;

use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::LinkError;

// ============================================================================
// KERNEL ABI (linux/if_packet.h, TPACKET_V1)
// ============================================================================

pub const PACKET_RX_RING: libc::c_int = 5;
pub const PACKET_TX_RING: libc::c_int = 13;

pub const TPACKET_ALIGNMENT: usize = 16;

pub const fn tpacket_align(x: usize) -> usize {
    (x + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// Per-slot header written by both sides. `tp_status` is the ownership word.
#[repr(C)]
pub struct TpacketHdr {
    pub tp_status: AtomicUsize,
    pub tp_len: u32,
    pub tp_snaplen: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub tp_sec: u32,
    pub tp_usec: u32,
}
#[cfg(target_pointer_width = "64")]
const _: () = assert!(mem::size_of::<TpacketHdr>() == 32);
#[cfg(target_pointer_width = "32")]
const _: () = assert!(mem::size_of::<TpacketHdr>() == 24);

const SOCKADDR_LL_LEN: usize = mem::size_of::<libc::sockaddr_ll>();

/// TPACKET_HDRLEN: aligned header plus the sockaddr_ll the kernel stores after it.
pub const TPACKET_HDRLEN: usize = tpacket_align(mem::size_of::<TpacketHdr>()) + SOCKADDR_LL_LEN;
/// Where a TX frame's network header starts (SOCK_DGRAM: no link header).
pub const TX_DATA_OFFSET: usize = TPACKET_HDRLEN - SOCKADDR_LL_LEN;
/// Where the kernel puts the network header of an RX frame on a SOCK_DGRAM
/// socket without tp_reserve.
pub const RX_NET_OFFSET: usize = tpacket_align(TPACKET_HDRLEN + 16);

/// setsockopt(PACKET_RX_RING / PACKET_TX_RING) argument.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TpacketReq {
    pub tp_block_size: libc::c_uint,
    pub tp_block_nr: libc::c_uint,
    pub tp_frame_size: libc::c_uint,
    pub tp_frame_nr: libc::c_uint,
}

// RX status bits
pub const TP_STATUS_KERNEL: usize = 0;
pub const TP_STATUS_USER: usize = 1;
pub const TP_STATUS_COPY: usize = 1 << 1;
pub const TP_STATUS_LOSING: usize = 1 << 2;

// TX status values
pub const TP_STATUS_AVAILABLE: usize = 0;
pub const TP_STATUS_SEND_REQUEST: usize = 1;
pub const TP_STATUS_SENDING: usize = 1 << 1;
pub const TP_STATUS_WRONG_FORMAT: usize = 1 << 2;

pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as usize } else { 4096 }
}

// ============================================================================
// TX KICK
// ============================================================================

/// Asks whoever drains the TX ring to transmit every SEND_REQUEST slot.
/// For a packet socket this is a zero-length sendto().
pub trait TxKick: Send + Sync {
    /// `wait = false` must not block on I/O.
    fn kick(&self, wait: bool) -> io::Result<()>;
}

// ============================================================================
// RING REGION (ARENA)
// ============================================================================

/// One mapped ring. Unmapped on drop.
pub struct RingRegion {
    base: NonNull<u8>,
    map_len: usize,
    frame_size: usize,
    frame_count: usize,
}

// SAFETY: the region is plain shared memory; concurrent access to a slot is
// mediated by its atomic status word.
unsafe impl Send for RingRegion {}
unsafe impl Sync for RingRegion {}

impl RingRegion {
    /// Map the ring the kernel attached to `fd`.
    pub(crate) fn map_socket(
        fd: libc::c_int,
        frame_size: usize,
        frame_count: usize,
        which: &'static str,
    ) -> Result<Self, LinkError> {
        Self::map(fd, libc::MAP_SHARED, frame_size, frame_count, which)
    }

    /// A zero-filled private region with the same layout as a kernel ring.
    /// All slots start KERNEL-owned (rx) / AVAILABLE (tx).
    pub fn anonymous(frame_size: usize, frame_count: usize) -> Result<Self, LinkError> {
        Self::map(-1, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, frame_size, frame_count, "anonymous ring")
    }

    fn map(
        fd: libc::c_int,
        flags: libc::c_int,
        frame_size: usize,
        frame_count: usize,
        which: &'static str,
    ) -> Result<Self, LinkError> {
        if frame_count == 0 || frame_size < TPACKET_HDRLEN || frame_size % TPACKET_ALIGNMENT != 0 {
            return Err(LinkError::Config(format!(
                "{}: bad geometry {} x {} bytes",
                which, frame_count, frame_size
            )));
        }
        let map_len = frame_size
            .checked_mul(frame_count)
            .ok_or_else(|| LinkError::Config(format!("{}: ring size overflows", which)))?;

        // SAFETY: mapping a fresh region; the kernel validates fd and flags.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(LinkError::Mmap { which, source: io::Error::last_os_error() });
        }
        let base = NonNull::new(base as *mut u8)
            .ok_or_else(|| LinkError::Mmap { which, source: io::Error::other("mmap returned NULL") })?;

        Ok(RingRegion { base, map_len, frame_size, frame_count })
    }

    #[inline(always)]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    #[inline(always)]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Slot accessor: `base + index * frame_size`.
    ///
    /// # Panics
    /// If `index >= frame_count`.
    #[inline(always)]
    pub fn slot(&self, index: usize) -> Slot<'_> {
        assert!(index < self.frame_count, "slot {} out of ring of {}", index, self.frame_count);
        // SAFETY: index is in bounds, so the offset stays inside the mapping,
        // and every frame start is TPACKET_ALIGNMENT-aligned (page-aligned base).
        let hdr = unsafe { self.base.as_ptr().add(index * self.frame_size) } as *mut TpacketHdr;
        Slot {
            // SAFETY: derived from a non-null base with an in-bounds offset.
            hdr: unsafe { NonNull::new_unchecked(hdr) },
            index,
            frame_size: self.frame_size,
            _region: PhantomData,
        }
    }
}

impl Drop for RingRegion {
    fn drop(&mut self) {
        // SAFETY: base/map_len describe exactly the mapping created in map().
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.map_len);
        }
    }
}

impl std::fmt::Debug for RingRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingRegion")
            .field("frame_size", &self.frame_size)
            .field("frame_count", &self.frame_count)
            .finish()
    }
}

// ============================================================================
// SLOT ACCESSOR
// ============================================================================

/// Bounded view of one slot. Header fields are read/written volatile; the
/// status word with acquire/release so payload writes are published by it.
/// Writing the header hands the slot over, so only the crate may do it.
#[derive(Clone, Copy)]
pub struct Slot<'a> {
    hdr: NonNull<TpacketHdr>,
    index: usize,
    frame_size: usize,
    _region: PhantomData<&'a RingRegion>,
}

impl<'a> Slot<'a> {
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    fn status_word(&self) -> &'a AtomicUsize {
        // SAFETY: hdr points at a live TpacketHdr inside the region; atomics
        // may be shared with the other owner.
        unsafe { &(*self.hdr.as_ptr()).tp_status }
    }

    #[inline(always)]
    pub fn status(&self) -> usize {
        self.status_word().load(Ordering::Acquire)
    }

    /// Hand the slot over. Everything written before is visible to the new owner.
    #[inline(always)]
    pub(crate) fn set_status(&self, status: usize) {
        self.status_word().store(status, Ordering::Release);
    }

    #[inline(always)]
    pub fn len(&self) -> u32 {
        // SAFETY: in-bounds header field.
        unsafe { ptr::addr_of!((*self.hdr.as_ptr()).tp_len).read_volatile() }
    }

    #[inline(always)]
    pub(crate) fn set_len(&self, len: u32) {
        // SAFETY: in-bounds header field; caller owns the slot.
        unsafe { ptr::addr_of_mut!((*self.hdr.as_ptr()).tp_len).write_volatile(len) }
    }

    #[inline(always)]
    pub fn snaplen(&self) -> u32 {
        // SAFETY: in-bounds header field.
        unsafe { ptr::addr_of!((*self.hdr.as_ptr()).tp_snaplen).read_volatile() }
    }

    #[inline(always)]
    pub(crate) fn set_snaplen(&self, len: u32) {
        // SAFETY: in-bounds header field; caller owns the slot.
        unsafe { ptr::addr_of_mut!((*self.hdr.as_ptr()).tp_snaplen).write_volatile(len) }
    }

    /// Offset from slot start to the IP header (rx).
    #[inline(always)]
    pub fn net_offset(&self) -> usize {
        // SAFETY: in-bounds header field.
        unsafe { ptr::addr_of!((*self.hdr.as_ptr()).tp_net).read_volatile() as usize }
    }

    #[inline(always)]
    pub(crate) fn set_net_offset(&self, off: u16) {
        // SAFETY: in-bounds header field; caller owns the slot.
        unsafe {
            ptr::addr_of_mut!((*self.hdr.as_ptr()).tp_mac).write_volatile(off);
            ptr::addr_of_mut!((*self.hdr.as_ptr()).tp_net).write_volatile(off);
        }
    }

    #[inline(always)]
    fn in_frame(&self, offset: usize, len: usize) -> bool {
        offset >= mem::size_of::<TpacketHdr>()
            && offset.checked_add(len).is_some_and(|end| end <= self.frame_size)
    }

    /// Frame bytes `[offset, offset + len)`, or `None` if that leaves the slot.
    ///
    /// # Safety
    /// The caller must own the slot (status says so) for as long as the
    /// returned slice lives.
    #[inline(always)]
    pub unsafe fn data(&self, offset: usize, len: usize) -> Option<&'a [u8]> {
        if !self.in_frame(offset, len) {
            return None;
        }
        let p = (self.hdr.as_ptr() as *const u8).add(offset);
        Some(std::slice::from_raw_parts(p, len))
    }

    /// Mutable frame bytes `[offset, offset + len)`.
    ///
    /// # Safety
    /// As for [`Slot::data`], and no other reference into this slot's data may
    /// exist while the returned slice lives.
    #[inline(always)]
    pub unsafe fn data_mut(&self, offset: usize, len: usize) -> Option<&'a mut [u8]> {
        if !self.in_frame(offset, len) {
            return None;
        }
        let p = (self.hdr.as_ptr() as *mut u8).add(offset);
        Some(std::slice::from_raw_parts_mut(p, len))
    }
}

// ============================================================================
// RING CURSOR
// ============================================================================

/// Producer/consumer position plus release position of one ring.
///
/// Counters never wrap in practice (u64); slot index is `counter % depth`.
/// Invariant: `released <= current <= released + depth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    current: u64,
    released: u64,
    depth: usize,
}

impl RingCursor {
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "ring depth must be non-zero");
        RingCursor { current: 0, released: 0, depth }
    }

    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Slot index of the next frame to produce/consume.
    #[inline(always)]
    pub fn index(&self) -> usize {
        (self.current % self.depth as u64) as usize
    }

    /// Slot index of the oldest unreleased frame.
    #[inline(always)]
    pub fn release_index(&self) -> usize {
        (self.released % self.depth as u64) as usize
    }

    #[inline(always)]
    pub fn current(&self) -> u64 {
        self.current
    }

    #[inline(always)]
    pub fn released(&self) -> u64 {
        self.released
    }

    /// Frames consumed but not yet released.
    #[inline(always)]
    pub fn pending(&self) -> usize {
        (self.current - self.released) as usize
    }

    /// A full ring of unreleased frames: the next index is still ours.
    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.pending() >= self.depth
    }

    #[inline(always)]
    pub fn advance(&mut self) {
        debug_assert!(!self.is_full(), "cursor would lap its release point");
        self.current += 1;
    }

    /// Release the oldest pending frame; returns its slot index.
    #[inline(always)]
    pub fn release(&mut self) -> Option<usize> {
        if self.released == self.current {
            return None;
        }
        let idx = self.release_index();
        self.released += 1;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_offsets() {
        assert_eq!(TX_DATA_OFFSET, tpacket_align(mem::size_of::<TpacketHdr>()));
        #[cfg(target_pointer_width = "64")]
        {
            assert_eq!(TPACKET_HDRLEN, 52);
            assert_eq!(TX_DATA_OFFSET, 32);
            assert_eq!(RX_NET_OFFSET, 80);
        }
    }

    #[test]
    fn anonymous_region_slots_start_zeroed() {
        let ps = page_size();
        let region = RingRegion::anonymous(ps, 4).unwrap();
        for i in 0..4 {
            let slot = region.slot(i);
            assert_eq!(slot.status(), TP_STATUS_KERNEL);
            assert_eq!(slot.len(), 0);
        }
    }

    #[test]
    fn slot_addressing_is_strided() {
        let ps = page_size();
        let region = RingRegion::anonymous(ps, 3).unwrap();
        region.slot(1).set_len(111);
        region.slot(2).set_status(TP_STATUS_USER);
        assert_eq!(region.slot(0).len(), 0);
        assert_eq!(region.slot(1).len(), 111);
        assert_eq!(region.slot(1).status(), TP_STATUS_KERNEL);
        assert_eq!(region.slot(2).status(), TP_STATUS_USER);
    }

    #[test]
    #[should_panic(expected = "out of ring")]
    fn slot_out_of_bounds_panics() {
        let region = RingRegion::anonymous(page_size(), 2).unwrap();
        let _ = region.slot(2);
    }

    #[test]
    fn slot_data_is_bounded() {
        let ps = page_size();
        let region = RingRegion::anonymous(ps, 1).unwrap();
        let slot = region.slot(0);
        unsafe {
            assert!(slot.data(0, 4).is_none(), "header must not be exposed as data");
            assert!(slot.data(TX_DATA_OFFSET, ps - TX_DATA_OFFSET).is_some());
            assert!(slot.data(TX_DATA_OFFSET, ps - TX_DATA_OFFSET + 1).is_none());
            assert!(slot.data(usize::MAX, 2).is_none());
            slot.data_mut(TX_DATA_OFFSET, 3).unwrap().copy_from_slice(&[7, 8, 9]);
            assert_eq!(slot.data(TX_DATA_OFFSET, 3).unwrap(), &[7, 8, 9]);
        }
    }

    #[test]
    fn bad_geometry_rejected() {
        assert!(matches!(RingRegion::anonymous(page_size(), 0), Err(LinkError::Config(_))));
        assert!(matches!(RingRegion::anonymous(40, 4), Err(LinkError::Config(_))));
        assert!(matches!(RingRegion::anonymous(4100, 4), Err(LinkError::Config(_))));
    }

    #[test]
    fn cursor_wraps_and_releases_in_order() {
        let mut c = RingCursor::new(3);
        assert_eq!(c.release(), None);
        for expected in [0, 1, 2] {
            assert_eq!(c.index(), expected);
            c.advance();
        }
        assert!(c.is_full());
        assert_eq!(c.index(), 0);
        assert_eq!(c.release(), Some(0));
        assert_eq!(c.release(), Some(1));
        c.advance();
        assert_eq!(c.pending(), 2);
        assert_eq!(c.release(), Some(2));
        assert_eq!(c.release(), Some(0));
        assert_eq!(c.release(), None);
        assert_eq!(c.current(), c.released());
    }
}
