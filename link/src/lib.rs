// RTLINK — CRATE ROOT (LIBRARY)
// Zero-copy raw IPv4/UDP spike-record link over PACKET_MMAP rings, with a
// master/slave clock-sync protocol on top.
//
// Module hierarchy:
//   protocol/  — Wire records (SpikeRecord, SpinnakerRecord), header constants
//   net/       — RFC 1071 checksum, IPv4/UDP framing, address filter, ARP/ioctl lookups
//   ring/      — Ring arena + slot accessor, packet sockets, in-process loopback wire
//   transport  — RingTransport: enqueue/flush/receive/free_receive
//   engine/    — Synced clock, clock-sync master/slave, real-time process setup
//   config     — LinkArgs (clap) -> LinkConfig, FaultPolicy
//   telemetry  — Datapath counters
//
// The binaries (rtlink, rtlink-loopback) compose these: resolve the endpoint,
// prepare the process, open the transport, sync, then move records.

pub mod config;
pub mod engine;
pub mod error;
pub mod net;
pub mod protocol;
pub mod ring;
pub mod telemetry;
pub mod transport;

pub use config::{CpuSelection, FaultPolicy, LinkArgs, LinkConfig, Role};
pub use engine::clock::SyncClock;
pub use engine::realtime::prepare_realtime;
pub use engine::sync::{sync, SyncStatus};
pub use error::{CaptureFault, LinkError};
pub use net::{resolve_link_address, Endpoint, MacAddr};
pub use protocol::wire::{PacketType, Record, SpikeRecord, SpinnakerRecord};
pub use telemetry::TelemetrySnapshot;
pub use transport::{RingTransport, SpikeLink};

/// Install the process-wide tracing subscriber. `RUST_LOG` overrides
/// `default_filter`.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
