// RTLINK — ADDRESS RESOLUTION (COLD PATH)
// Interface lookups via ioctl/if_nametoindex and peer MAC discovery via the
// kernel ARP cache. Called by drivers before a transport is built; the
// transport itself only ever receives a resolved MacAddr.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::{Command, Stdio};
use std::str::FromStr;

use crate::error::LinkError;

const PROC_NET_ARP: &str = "/proc/net/arp";

/// IEEE 802 48-bit link-layer address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", m[0], m[1], m[2], m[3], m[4], m[5])
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<u8> = s
            .trim()
            .split([':', '-'])
            .map(|h| u8::from_str_radix(h, 16))
            .collect::<Result<_, _>>()
            .map_err(|e| format!("bad MAC {:?}: {}", s, e))?;
        let octets: [u8; 6] = parts
            .try_into()
            .map_err(|_| format!("bad MAC {:?}: need 6 octets", s))?;
        Ok(MacAddr(octets))
    }
}

/// Look `ip` up in an ARP table dump (`/proc/net/arp` format), optionally
/// restricted to one device. Incomplete entries (all-zero MAC) are skipped.
pub(crate) fn find_in_arp_table(table: &str, ip: Ipv4Addr, if_name: Option<&str>) -> Option<MacAddr> {
    let ip_str = ip.to_string();
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 || fields[0] != ip_str {
            continue;
        }
        if let Some(dev) = if_name {
            if fields[5] != dev {
                continue;
            }
        }
        if let Ok(mac) = fields[3].parse::<MacAddr>() {
            if mac != MacAddr::default() {
                return Some(mac);
            }
        }
    }
    None
}

/// Resolve a peer IPv4 address to its MAC via the kernel ARP cache.
/// A cache miss provokes one ARP exchange (`ping -c 1 -W 1`) and re-reads.
pub fn resolve_link_address(if_name: &str, ip: Ipv4Addr) -> Result<MacAddr, LinkError> {
    let read_table = || {
        std::fs::read_to_string(PROC_NET_ARP).map_err(|e| LinkError::Resolve {
            ip,
            reason: format!("{}: {}", PROC_NET_ARP, e),
        })
    };

    if let Some(mac) = find_in_arp_table(&read_table()?, ip, Some(if_name)) {
        tracing::info!(%ip, %mac, dev = if_name, "peer link address from ARP cache");
        return Ok(mac);
    }

    tracing::warn!(%ip, dev = if_name, "peer not in ARP cache, probing");
    let ip_str = ip.to_string();
    let _ = Command::new("ping")
        .args(["-c", "1", "-W", "1", "-I", if_name, &ip_str])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match find_in_arp_table(&read_table()?, ip, Some(if_name)) {
        Some(mac) => {
            tracing::info!(%ip, %mac, dev = if_name, "peer link address resolved after probe");
            Ok(mac)
        }
        None => Err(LinkError::Resolve { ip, reason: format!("no ARP reply on {}", if_name) }),
    }
}

fn ifreq_for(if_name: &str) -> Result<libc::ifreq, LinkError> {
    let name = if_name.as_bytes();
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(LinkError::Config(format!("interface name {:?} invalid", if_name)));
    }
    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

/// IPv4 address assigned to an interface (SIOCGIFADDR).
pub fn interface_ipv4(if_name: &str) -> Result<Ipv4Addr, LinkError> {
    let mut ifr = ifreq_for(if_name)?;
    let iface_err = |source| LinkError::Interface { name: if_name.to_string(), source };

    // SAFETY: plain socket(2) call; the fd is owned immediately below.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(LinkError::last_os("socket(AF_INET)"));
    }
    // SAFETY: raw is a freshly created, valid descriptor.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: ifr is a valid ifreq with a NUL-terminated name.
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFADDR as _, &mut ifr) };
    if ret < 0 {
        return Err(iface_err(io::Error::last_os_error()));
    }

    // SAFETY: SIOCGIFADDR on an AF_INET socket fills ifru_addr with a sockaddr_in.
    let sa = unsafe { &*(&ifr.ifr_ifru as *const _ as *const libc::sockaddr_in) };
    let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
    tracing::info!(dev = if_name, %ip, "interface address");
    Ok(ip)
}

/// Largest IP datagram the interface transmits (SIOCGIFMTU).
pub fn interface_mtu(if_name: &str) -> Result<usize, LinkError> {
    let mut ifr = ifreq_for(if_name)?;

    // SAFETY: plain socket(2) call; the fd is owned immediately below.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(LinkError::last_os("socket(AF_INET)"));
    }
    // SAFETY: raw is a freshly created, valid descriptor.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: ifr is a valid ifreq with a NUL-terminated name.
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFMTU as _, &mut ifr) };
    if ret < 0 {
        return Err(LinkError::Interface { name: if_name.to_string(), source: io::Error::last_os_error() });
    }
    // SAFETY: SIOCGIFMTU fills the ifru_mtu member.
    let mtu = unsafe { ifr.ifr_ifru.ifru_mtu };
    usize::try_from(mtu).map_err(|_| LinkError::Config(format!("{}: bogus mtu {}", if_name, mtu)))
}

/// Kernel interface index, for binding packet sockets.
pub fn interface_index(if_name: &str) -> Result<i32, LinkError> {
    let name = CString::new(if_name)
        .map_err(|_| LinkError::Config(format!("interface name {:?} contains NUL", if_name)))?;
    // SAFETY: name is a valid C string for the duration of the call.
    let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if idx == 0 {
        return Err(LinkError::Interface {
            name: if_name.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(idx as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
10.0.0.2         0x1         0x2         52:54:00:12:34:56     *        eth1
10.0.0.3         0x1         0x0         00:00:00:00:00:00     *        eth1
10.0.0.2         0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
";

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddr = "52:54:00:12:34:56".parse().unwrap();
        assert_eq!(mac.octets(), [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        assert_eq!(mac.to_string(), "52:54:00:12:34:56");
        assert!("52:54:00:12:34".parse::<MacAddr>().is_err());
        assert!("zz:54:00:12:34:56".parse::<MacAddr>().is_err());
    }

    #[test]
    fn arp_lookup_respects_device() {
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        assert_eq!(
            find_in_arp_table(TABLE, ip, Some("eth1")),
            Some(MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]))
        );
        assert_eq!(
            find_in_arp_table(TABLE, ip, Some("eth0")),
            Some(MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]))
        );
        assert_eq!(find_in_arp_table(TABLE, ip, Some("eth2")), None);
    }

    #[test]
    fn arp_lookup_skips_incomplete() {
        assert_eq!(find_in_arp_table(TABLE, Ipv4Addr::new(10, 0, 0, 3), None), None);
    }

    #[test]
    fn bad_interface_names() {
        assert!(matches!(ifreq_for(""), Err(LinkError::Config(_))));
        assert!(matches!(ifreq_for("averyveryverylongname"), Err(LinkError::Config(_))));
        assert!(matches!(interface_index("no\0pe"), Err(LinkError::Config(_))));
    }
}
