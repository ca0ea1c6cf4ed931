// RTLINK — WIRE PROTOCOL
// Canonical definitions for the on-wire format: IPv4(20) + UDP(8) + N records.
// Records are #[repr(C, packed)] so they can be viewed in place inside a ring
// slot without copying (alignment 1, no padding).

use std::mem;

use bytemuck::{Pod, Zeroable};

// ============================================================================
// WIRE CONSTANTS
// ============================================================================

pub const IP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;
/// Bytes in front of the first record of every frame.
pub const HEADERS_LEN: usize = IP_HDR_LEN + UDP_HDR_LEN;

pub const IPPROTO_UDP: u8 = 17;
pub const IP_DEFAULT_TTL: u8 = 64;
/// Don't Fragment, offset 0.
pub const IP_FLAG_DF: u16 = 0x4000;

// ============================================================================
// RECORDS
// ============================================================================

/// A fixed-size record that can live directly inside a UDP payload.
///
/// Encoding is the record's own byte layout: no length prefix, no padding.
/// A payload of `n * SIZE` bytes carries `n` records back to back.
pub trait Record: Pod {
    const SIZE: usize = mem::size_of::<Self>();

    /// Evaluated wherever a record is viewed in place: slot payloads carry
    /// no alignment guarantee.
    #[doc(hidden)]
    const ASSERT_PACKED: () = assert!(
        mem::align_of::<Self>() == 1 && mem::size_of::<Self>() > 0,
        "records must be non-empty #[repr(C, packed)] types"
    );

    /// Number of whole records in a UDP payload of `payload_len` bytes.
    #[inline(always)]
    fn count_in(payload_len: usize) -> usize {
        payload_len / Self::SIZE
    }
}

/// Packet type carried in `SpikeRecord::packet_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    Dummy = 0,
    Sync = 1,
    Spikes = 0xff,
}

impl PacketType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Dummy),
            1 => Some(Self::Sync),
            0xff => Some(Self::Spikes),
            _ => None,
        }
    }
}

/// The "dummy" spike format. 20 bytes, host byte order.
///
/// `timestamp0` doubles as the exchange nonce during clock sync: the slave
/// echoes it back untouched.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable, PartialEq, Eq)]
pub struct SpikeRecord {
    pub timestamp0: u64,
    pub timestamp: u64,
    pub label: u16,
    pub packet_type: u16,
}
const _: () = assert!(mem::size_of::<SpikeRecord>() == 20);

impl SpikeRecord {
    pub fn new(timestamp0: u64, timestamp: u64, label: u16, packet_type: PacketType) -> Self {
        SpikeRecord { timestamp0, timestamp, label, packet_type: packet_type as u16 }
    }

    pub fn sync(timestamp0: u64, timestamp: u64) -> Self {
        Self::new(timestamp0, timestamp, 0, PacketType::Sync)
    }

    /// `None` for packet types this build does not know.
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_u16(self.packet_type)
    }

    pub fn is_sync(&self) -> bool {
        self.kind() == Some(PacketType::Sync)
    }
}

impl Record for SpikeRecord {}

impl std::fmt::Debug for SpikeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Copy out of the packed struct before borrowing for formatting.
        let (t0, t, label, ty) = (self.timestamp0, self.timestamp, self.label, self.packet_type);
        f.debug_struct("SpikeRecord")
            .field("timestamp0", &t0)
            .field("timestamp", &t)
            .field("label", &label)
            .field("packet_type", &ty)
            .finish()
    }
}

/// SpiNNaker-style record: a single 32-bit label in network byte order.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable, PartialEq, Eq)]
pub struct SpinnakerRecord {
    label_be: u32,
}
const _: () = assert!(mem::size_of::<SpinnakerRecord>() == 4);

impl SpinnakerRecord {
    /// Build from a host-order label.
    pub fn from_host(label: u32) -> Self {
        SpinnakerRecord { label_be: label.to_be() }
    }

    /// The label in host byte order.
    pub fn host_label(&self) -> u32 {
        u32::from_be(self.label_be)
    }

    /// The label exactly as it sits on the wire.
    pub fn wire_label(&self) -> u32 {
        self.label_be
    }
}

impl Record for SpinnakerRecord {}

impl std::fmt::Debug for SpinnakerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinnakerRecord").field("label", &self.host_label()).finish()
    }
}
