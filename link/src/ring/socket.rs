// RTLINK — PACKET SOCKETS (COLD PATH)
// Two AF_PACKET/SOCK_DGRAM sockets, one RX ring and one TX ring, bound to a
// single interface. Setup order matters: the ring must be requested before
// bind() and mmap().

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::LinkError;
use crate::net::{interface_index, interface_mtu, MacAddr};
use crate::ring::{page_size, RingRegion, TpacketReq, TxKick, PACKET_RX_RING, PACKET_TX_RING};

/// Minimum socket buffer the kernel must grant each ring socket.
pub const MIN_SOCKET_BUFFER: u32 = 1 << 20;

/// Both rings of an open link, plus what keeps them alive.
pub struct PacketRings {
    pub rx: RingRegion,
    pub tx: RingRegion,
    /// Interface MTU: the kernel rejects longer TX frames.
    pub mtu: usize,
    pub rx_socket: OwnedFd,
    pub kick: PacketKick,
}

/// Transmits every SEND_REQUEST slot of the TX ring: `sendto(fd, NULL, 0)`.
pub struct PacketKick {
    socket: OwnedFd,
    dest: libc::sockaddr_ll,
}

impl TxKick for PacketKick {
    fn kick(&self, wait: bool) -> io::Result<()> {
        let flags = if wait { 0 } else { libc::MSG_DONTWAIT };
        // SAFETY: zero-length send with a valid sockaddr_ll; the kernel reads
        // frame data from the mapped TX ring.
        let ret = unsafe {
            libc::sendto(
                self.socket.as_raw_fd(),
                std::ptr::null(),
                0,
                flags,
                &self.dest as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

fn packet_socket() -> Result<OwnedFd, LinkError> {
    let proto = (libc::ETH_P_IP as u16).to_be() as libc::c_int;
    // SAFETY: plain socket(2); the descriptor is owned right below.
    let raw = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, proto) };
    if raw < 0 {
        return Err(LinkError::last_os("socket(AF_PACKET)"));
    }
    // SAFETY: raw is a freshly created, valid descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn setsockopt<T>(
    fd: &OwnedFd,
    level: libc::c_int,
    name: libc::c_int,
    val: &T,
    op: &'static str,
) -> Result<(), LinkError> {
    // SAFETY: val points at a live T of the advertised size.
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            val as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(LinkError::last_os(op));
    }
    Ok(())
}

fn socket_buffer(fd: &OwnedFd, name: libc::c_int, op: &'static str) -> Result<u32, LinkError> {
    let mut val: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: val/len describe a writable c_int.
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            &mut val as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(LinkError::last_os(op));
    }
    Ok(val.max(0) as u32)
}

/// Ask for MIN_SOCKET_BUFFER past rmem_max/wmem_max (needs CAP_NET_ADMIN,
/// which a packet socket implies) and check what was granted.
fn ensure_buffer(
    fd: &OwnedFd,
    force: libc::c_int,
    name: libc::c_int,
    which: &'static str,
) -> Result<(), LinkError> {
    let want = MIN_SOCKET_BUFFER as libc::c_int;
    if let Err(e) = setsockopt(fd, libc::SOL_SOCKET, force, &want, "setsockopt(SO_*BUFFORCE)") {
        tracing::debug!(which, error = %e, "forcing socket buffer size failed");
    }
    let granted = socket_buffer(fd, name, "getsockopt(SO_*BUF)")?;
    if granted < MIN_SOCKET_BUFFER {
        return Err(LinkError::BufferTooSmall { which, granted, required: MIN_SOCKET_BUFFER });
    }
    Ok(())
}

fn link_address(ifindex: i32, mac: Option<MacAddr>) -> libc::sockaddr_ll {
    // SAFETY: sockaddr_ll is plain old data; all-zero is valid.
    let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = (libc::ETH_P_IP as u16).to_be();
    sll.sll_ifindex = ifindex;
    if let Some(mac) = mac {
        sll.sll_halen = 6;
        sll.sll_addr[..6].copy_from_slice(&mac.octets());
    }
    sll
}

fn bind(fd: &OwnedFd, addr: &libc::sockaddr_ll, op: &'static str) -> Result<(), LinkError> {
    // SAFETY: addr is a valid sockaddr_ll.
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(LinkError::last_os(op));
    }
    Ok(())
}

/// Open, size, bind and map both rings on `if_name`. One page per slot,
/// one slot per block, `depth` slots per ring.
pub fn open_rings(if_name: &str, depth: usize, remote_mac: MacAddr) -> Result<PacketRings, LinkError> {
    let frame_size = page_size();
    let nr = u32::try_from(depth)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| LinkError::Config(format!("ring depth {} out of range", depth)))?;
    let req = TpacketReq {
        tp_block_size: frame_size as u32,
        tp_block_nr: nr,
        tp_frame_size: frame_size as u32,
        tp_frame_nr: nr,
    };

    let rx_socket = packet_socket()?;
    let tx_socket = packet_socket()?;

    setsockopt(&rx_socket, libc::SOL_PACKET, PACKET_RX_RING, &req, "setsockopt(PACKET_RX_RING)")?;
    setsockopt(&tx_socket, libc::SOL_PACKET, PACKET_TX_RING, &req, "setsockopt(PACKET_TX_RING)")?;

    ensure_buffer(&rx_socket, libc::SO_RCVBUFFORCE, libc::SO_RCVBUF, "SO_RCVBUF")?;
    ensure_buffer(&tx_socket, libc::SO_SNDBUFFORCE, libc::SO_SNDBUF, "SO_SNDBUF")?;

    let ifindex = interface_index(if_name)?;
    let mtu = interface_mtu(if_name)?;
    let local = link_address(ifindex, None);
    bind(&rx_socket, &local, "bind(rx)")?;
    bind(&tx_socket, &local, "bind(tx)")?;

    let rx = RingRegion::map_socket(rx_socket.as_raw_fd(), frame_size, depth, "rx ring")?;
    let tx = RingRegion::map_socket(tx_socket.as_raw_fd(), frame_size, depth, "tx ring")?;

    tracing::info!(
        dev = if_name,
        ifindex,
        depth,
        frame_size,
        mtu,
        peer = %remote_mac,
        "packet rings mapped"
    );

    Ok(PacketRings {
        rx,
        tx,
        mtu,
        rx_socket,
        kick: PacketKick { socket: tx_socket, dest: link_address(ifindex, Some(remote_mac)) },
    })
}
