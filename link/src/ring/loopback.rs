// RTLINK — IN-PROCESS LOOPBACK WIRE
// Plays the kernel for two transports in one process: a kick moves every
// SEND_REQUEST slot of one side's TX ring into the next KERNEL-owned slot of
// the other side's RX ring, with the same status handoff the real
// PACKET_MMAP rings use. A full RX ring drops the frame, like the kernel.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::ring::{
    RingRegion, TxKick, RX_NET_OFFSET, TP_STATUS_AVAILABLE, TP_STATUS_KERNEL, TP_STATUS_SEND_REQUEST,
    TP_STATUS_USER, TX_DATA_OFFSET,
};

/// Which transport of a loopback pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

struct Lane {
    tx: Arc<RingRegion>,
    peer_rx: Arc<RingRegion>,
    tx_next: usize,
    rx_next: usize,
}

impl Lane {
    /// Place one frame into the peer's RX ring. `false` if the ring is full.
    fn deliver(&mut self, frame: &[u8], snaplen: u32, extra_status: usize) -> bool {
        let dst = self.peer_rx.slot(self.rx_next);
        if dst.status() != TP_STATUS_KERNEL {
            return false;
        }
        let room = self.peer_rx.frame_size() - RX_NET_OFFSET;
        let copied = frame.len().min(room).min(snaplen as usize);
        // SAFETY: KERNEL status means the consumer does not look at this slot.
        if let Some(buf) = unsafe { dst.data_mut(RX_NET_OFFSET, copied) } {
            buf.copy_from_slice(&frame[..copied]);
        }
        dst.set_len(frame.len() as u32);
        dst.set_snaplen(copied as u32);
        dst.set_net_offset(RX_NET_OFFSET as u16);
        dst.set_status(TP_STATUS_USER | extra_status);
        self.rx_next = (self.rx_next + 1) % self.peer_rx.frame_count();
        true
    }

    fn pump(&mut self, dropped: &AtomicU64) -> usize {
        let mut sent = 0;
        let tx = Arc::clone(&self.tx);
        loop {
            let src = tx.slot(self.tx_next);
            if src.status() != TP_STATUS_SEND_REQUEST {
                return sent;
            }
            let len = src.len() as usize;
            // SAFETY: SEND_REQUEST hands the slot to us until we mark it AVAILABLE.
            let frame = unsafe { src.data(TX_DATA_OFFSET, len) };
            let delivered = match frame {
                Some(frame) => self.deliver(frame, u32::MAX, 0),
                None => false,
            };
            if !delivered {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
            src.set_status(TP_STATUS_AVAILABLE);
            self.tx_next = (self.tx_next + 1) % tx.frame_count();
            sent += 1;
        }
    }
}

/// TX kick of one side of the wire.
pub struct LoopbackKick {
    lane: Mutex<Lane>,
    dropped: AtomicU64,
}

impl LoopbackKick {
    fn lane(&self) -> MutexGuard<'_, Lane> {
        // A panic while holding the lock leaves only indices behind; keep going.
        self.lane.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Frames lost to a full peer RX ring.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TxKick for LoopbackKick {
    fn kick(&self, _wait: bool) -> io::Result<()> {
        self.lane().pump(&self.dropped);
        Ok(())
    }
}

/// The rings and kicks of a connected pair.
pub struct LoopbackWire {
    a_to_b: Arc<LoopbackKick>,
    b_to_a: Arc<LoopbackKick>,
}

/// Ring set for one side, as handed to `RingTransport::from_parts`.
pub(crate) struct LoopbackEnd {
    pub(crate) rx: Arc<RingRegion>,
    pub(crate) tx: Arc<RingRegion>,
    pub(crate) kick: Arc<LoopbackKick>,
}

impl LoopbackWire {
    /// Allocate four anonymous rings of `depth` slots and cross-connect them.
    pub(crate) fn new(frame_size: usize, depth: usize) -> Result<(Self, LoopbackEnd, LoopbackEnd), crate::LinkError> {
        let a_rx = Arc::new(RingRegion::anonymous(frame_size, depth)?);
        let a_tx = Arc::new(RingRegion::anonymous(frame_size, depth)?);
        let b_rx = Arc::new(RingRegion::anonymous(frame_size, depth)?);
        let b_tx = Arc::new(RingRegion::anonymous(frame_size, depth)?);

        let lane = |tx: &Arc<RingRegion>, peer_rx: &Arc<RingRegion>| {
            Arc::new(LoopbackKick {
                lane: Mutex::new(Lane { tx: tx.clone(), peer_rx: peer_rx.clone(), tx_next: 0, rx_next: 0 }),
                dropped: AtomicU64::new(0),
            })
        };
        let a_to_b = lane(&a_tx, &b_rx);
        let b_to_a = lane(&b_tx, &a_rx);

        let a = LoopbackEnd { rx: a_rx, tx: a_tx, kick: a_to_b.clone() };
        let b = LoopbackEnd { rx: b_rx, tx: b_tx, kick: b_to_a.clone() };
        Ok((LoopbackWire { a_to_b, b_to_a }, a, b))
    }

    fn lane_into(&self, to: Side) -> &LoopbackKick {
        match to {
            Side::A => &self.b_to_a,
            Side::B => &self.a_to_b,
        }
    }

    /// Put a raw datagram (IP header onwards) into `to`'s RX ring, as if it
    /// had arrived from the network. `false` if that ring is full.
    pub fn inject(&self, to: Side, frame: &[u8]) -> bool {
        self.lane_into(to).lane().deliver(frame, u32::MAX, 0)
    }

    /// Like [`LoopbackWire::inject`], but with a forced snaplen and extra
    /// status bits, to reproduce kernel capture faults.
    pub fn inject_raw(&self, to: Side, frame: &[u8], snaplen: u32, extra_status: usize) -> bool {
        self.lane_into(to).lane().deliver(frame, snaplen, extra_status)
    }

    /// Frames dropped on the way into `to` because its RX ring was full.
    pub fn dropped_into(&self, to: Side) -> u64 {
        self.lane_into(to).dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{page_size, TP_STATUS_COPY};

    fn send(end: &LoopbackEnd, idx: usize, bytes: &[u8]) {
        let slot = end.tx.slot(idx);
        unsafe { slot.data_mut(TX_DATA_OFFSET, bytes.len()).unwrap().copy_from_slice(bytes) };
        slot.set_len(bytes.len() as u32);
        slot.set_status(TP_STATUS_SEND_REQUEST);
    }

    #[test]
    fn kick_moves_frames_across() {
        let (_wire, a, b) = LoopbackWire::new(page_size(), 4).unwrap();
        send(&a, 0, b"hello");
        send(&a, 1, b"world!");
        a.kick.kick(false).unwrap();

        assert_eq!(a.tx.slot(0).status(), TP_STATUS_AVAILABLE);
        let s0 = b.rx.slot(0);
        assert_eq!(s0.status(), TP_STATUS_USER);
        assert_eq!(s0.net_offset(), RX_NET_OFFSET);
        assert_eq!(unsafe { s0.data(RX_NET_OFFSET, s0.snaplen() as usize) }.unwrap(), b"hello");
        assert_eq!(b.rx.slot(1).len(), 6);
        assert_eq!(a.rx.slot(0).status(), TP_STATUS_KERNEL);
    }

    #[test]
    fn full_rx_ring_drops() {
        let (wire, a, b) = LoopbackWire::new(page_size(), 2).unwrap();
        for i in 0..2 {
            send(&a, i, &[i as u8; 8]);
        }
        a.kick.kick(false).unwrap();
        send(&a, 0, &[9; 8]);
        a.kick.kick(false).unwrap();
        assert_eq!(wire.dropped_into(Side::B), 1);
        assert_eq!(b.rx.slot(0).status(), TP_STATUS_USER);
        assert_eq!(unsafe { b.rx.slot(0).data(RX_NET_OFFSET, 1) }.unwrap(), &[0]);
    }

    #[test]
    fn raw_injection_sets_fault_bits() {
        let (wire, a, _b) = LoopbackWire::new(page_size(), 2).unwrap();
        assert!(wire.inject_raw(Side::A, &[0u8; 40], 30, TP_STATUS_COPY));
        let s = a.rx.slot(0);
        assert_eq!(s.status(), TP_STATUS_USER | TP_STATUS_COPY);
        assert_eq!(s.len(), 40);
        assert_eq!(s.snaplen(), 30);
    }
}
