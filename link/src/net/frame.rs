// RTLINK — IPv4/UDP FRAMING
// RFC 1071 checksum, header assembly directly into a ring slot, and the
// inbound address/port filter. No state, no allocation.
//
// All multi-byte header fields are written big-endian. The checksum sums
// big-endian words, which yields the same wire bytes as summing native words
// and storing the result natively (one's complement sums are byte-order
// independent).

use std::net::Ipv4Addr;

use crate::net::MacAddr;
use crate::protocol::wire::*;

/// One side's view of the link: who we are, who the peer is.
///
/// `src_port` is our source port and the peer's destination port; both ends
/// configure the same pair with roles mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub remote_mac: MacAddr,
}

impl Endpoint {
    /// The endpoint the peer must be configured with to talk to us.
    pub fn mirrored(&self, local_mac: MacAddr) -> Endpoint {
        Endpoint {
            local_ip: self.remote_ip,
            remote_ip: self.local_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            remote_mac: local_mac,
        }
    }
}

// ============================================================================
// CHECKSUM
// ============================================================================

/// Add the 16-bit big-endian words of `data` to `seed`.
/// A trailing odd byte counts as the high byte of a zero-padded word.
#[inline]
pub fn sum_words(data: &[u8], seed: u32) -> u32 {
    let mut sum = seed;
    let mut words = data.chunks_exact(2);
    for w in &mut words {
        sum = sum.wrapping_add(u16::from_be_bytes([w[0], w[1]]) as u32);
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold carries twice and complement.
#[inline]
pub fn fold(sum: u32) -> u16 {
    let mut sum = (sum >> 16) + (sum & 0xffff);
    sum += sum >> 16;
    !(sum as u16)
}

/// RFC 1071: Internet checksum of a buffer whose checksum field is zero.
#[inline]
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

// ============================================================================
// HEADER ASSEMBLY
// ============================================================================

/// Precomputed headers for frames of one payload size on one endpoint.
///
/// Everything except the UDP checksum is identical for all such frames, so a
/// batch pays for the IPv4 header and the pseudo-header sum once.
#[derive(Debug, Clone, Copy)]
pub struct FrameTemplate {
    ip: [u8; IP_HDR_LEN],
    udp: [u8; UDP_HDR_LEN],
    pseudo_sum: u32,
    payload_len: usize,
}

impl FrameTemplate {
    pub fn new(endpoint: &Endpoint, payload_len: usize) -> Self {
        let udp_len = (UDP_HDR_LEN + payload_len) as u16;
        let total_len = (HEADERS_LEN + payload_len) as u16;
        let src = endpoint.local_ip.octets();
        let dst = endpoint.remote_ip.octets();

        let mut ip = [0u8; IP_HDR_LEN];
        ip[0] = 0x45; // version 4, 5 words
        ip[1] = 0x00;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[4..6].copy_from_slice(&0u16.to_be_bytes());
        ip[6..8].copy_from_slice(&IP_FLAG_DF.to_be_bytes());
        ip[8] = IP_DEFAULT_TTL;
        ip[9] = IPPROTO_UDP;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        let cksum = internet_checksum(&ip);
        ip[10..12].copy_from_slice(&cksum.to_be_bytes());

        let mut udp = [0u8; UDP_HDR_LEN];
        udp[0..2].copy_from_slice(&endpoint.src_port.to_be_bytes());
        udp[2..4].copy_from_slice(&endpoint.dst_port.to_be_bytes());
        udp[4..6].copy_from_slice(&udp_len.to_be_bytes());

        // Pseudo-header: saddr, daddr, zero+protocol, udp length.
        let mut pseudo_sum = sum_words(&src, 0);
        pseudo_sum = sum_words(&dst, pseudo_sum);
        pseudo_sum = pseudo_sum.wrapping_add(IPPROTO_UDP as u32);
        pseudo_sum = pseudo_sum.wrapping_add(udp_len as u32);

        FrameTemplate { ip, udp, pseudo_sum, payload_len }
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Total datagram length (IP header through last payload byte).
    pub fn frame_len(&self) -> usize {
        HEADERS_LEN + self.payload_len
    }

    /// Fill in IPv4 + UDP headers in front of a payload already present at
    /// `frame[HEADERS_LEN..]`. Returns the datagram length.
    #[inline]
    pub fn write(&self, frame: &mut [u8]) -> usize {
        let frame_len = self.frame_len();
        debug_assert!(frame_len <= frame.len(), "frame too large for buffer");

        frame[..IP_HDR_LEN].copy_from_slice(&self.ip);
        let udp = &mut frame[IP_HDR_LEN..frame_len];
        udp[..UDP_HDR_LEN].copy_from_slice(&self.udp);
        // RFC 768: a computed zero goes out as all ones; zero means "none".
        let cksum = match fold(sum_words(udp, self.pseudo_sum)) {
            0 => 0xffff,
            c => c,
        };
        udp[6..8].copy_from_slice(&cksum.to_be_bytes());
        frame_len
    }
}

/// Write IPv4 + UDP headers for a `payload_len`-byte payload that is already
/// in place at `frame[HEADERS_LEN..]`. Must run after the payload is written:
/// the UDP checksum covers it. Returns the datagram length.
pub fn build_udp_over_ip_frame(frame: &mut [u8], payload_len: usize, endpoint: &Endpoint) -> usize {
    FrameTemplate::new(endpoint, payload_len).write(frame)
}

// ============================================================================
// INBOUND FILTER
// ============================================================================

/// Accept only datagrams from our peer to us, with the port pair mirrored.
pub fn validate_frame(frame: &[u8], endpoint: &Endpoint) -> bool {
    if frame.len() < HEADERS_LEN {
        return false;
    }
    let saddr = &frame[12..16];
    let daddr = &frame[16..20];
    let sport = u16::from_be_bytes([frame[20], frame[21]]);
    let dport = u16::from_be_bytes([frame[22], frame[23]]);

    saddr == endpoint.remote_ip.octets()
        && daddr == endpoint.local_ip.octets()
        && sport == endpoint.dst_port
        && dport == endpoint.src_port
}

/// UDP length field of a datagram (header included). `None` for runts.
#[inline]
pub fn udp_payload(frame: &[u8]) -> Option<usize> {
    if frame.len() < HEADERS_LEN {
        return None;
    }
    let udp_len = u16::from_be_bytes([frame[24], frame[25]]) as usize;
    udp_len.checked_sub(UDP_HDR_LEN)
}
