// RTLINK — ERROR TAXONOMY
// Setup errors abort construction. Capture/transmit/clock faults surface here
// only under FaultPolicy::Strict; Relaxed counts them in Telemetry instead.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Why a filled receive slot could not be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFault {
    /// Kernel flagged TP_STATUS_COPY: the frame was truncated into the slot.
    CopyInProgress,
    /// Captured length disagrees with the on-wire length.
    LengthMismatch { len: u32, snaplen: u32 },
    /// tp_net/tp_snaplen point outside the slot.
    OutOfSlot { net: usize, snaplen: u32 },
    /// UDP length claims more bytes than were captured.
    PayloadOverrun { udp_len: usize, captured: usize },
}

impl std::fmt::Display for CaptureFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureFault::CopyInProgress => write!(f, "incomplete packet in rx ring"),
            CaptureFault::LengthMismatch { len, snaplen } => {
                write!(f, "capture missed bytes (len {} != snaplen {})", len, snaplen)
            }
            CaptureFault::OutOfSlot { net, snaplen } => {
                write!(f, "frame at offset {} ({} bytes) leaves the slot", net, snaplen)
            }
            CaptureFault::PayloadOverrun { udp_len, captured } => {
                write!(f, "udp length {} exceeds {} captured bytes", udp_len, captured)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{op} failed: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{which} too small: kernel granted {granted} bytes, need {required}")]
    BufferTooSmall {
        which: &'static str,
        granted: u32,
        required: u32,
    },

    #[error("interface {name}: {source}")]
    Interface {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("mmap of {which} failed: {source}")]
    Mmap {
        which: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("cannot resolve link address of {ip}: {reason}")]
    Resolve { ip: Ipv4Addr, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("rx slot {slot}: {fault}")]
    Capture { slot: usize, fault: CaptureFault },

    #[error("tx slot {slot}: TP_STATUS_WRONG_FORMAT")]
    WrongFormat { slot: usize },

    #[error("tx kick failed: {0}")]
    Kick(#[source] io::Error),

    #[error("clock_gettime failed: {0}")]
    Clock(#[source] io::Error),

    #[error("{op} timed out")]
    Timeout { op: &'static str },

    #[error("rx ring holds {depth} unreleased slots; call free_receive")]
    RxBacklog { depth: usize },

    #[error("{op} failed: {source}")]
    Realtime {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl LinkError {
    /// Wrap the current `errno` for a failed socket-level call.
    pub(crate) fn last_os(op: &'static str) -> Self {
        LinkError::Socket { op, source: io::Error::last_os_error() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_errors_carry_os_text() {
        let err = LinkError::Socket {
            op: "setsockopt(PACKET_RX_RING)",
            source: io::Error::from_raw_os_error(libc::EPERM),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("setsockopt(PACKET_RX_RING) failed: "));
        assert!(msg.contains("ermitted"), "{}", msg);
    }

    #[test]
    fn capture_fault_display() {
        let err = LinkError::Capture {
            slot: 7,
            fault: CaptureFault::LengthMismatch { len: 60, snaplen: 48 },
        };
        assert_eq!(err.to_string(), "rx slot 7: capture missed bytes (len 60 != snaplen 48)");
    }
}
