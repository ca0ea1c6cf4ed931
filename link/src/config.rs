// RTLINK — CONFIGURATION
// Command-line/environment options shared by both binaries, validated once
// into an immutable LinkConfig.

use std::net::Ipv4Addr;

use clap::{Args, ValueEnum};

use crate::error::LinkError;
use crate::net::{interface_ipv4, resolve_link_address, Endpoint, MacAddr};

pub const DEFAULT_IFACE: &str = "eth1";
pub const DEFAULT_PORT: u16 = 2345;
pub const DEFAULT_RING_DEPTH: usize = 100_000;
pub const DEFAULT_SYNC_ITERATIONS: usize = 10_000;
/// Smallest iteration count whose trailing 20% still holds a sample.
pub const MIN_SYNC_ITERATIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Drives the clock-sync exchange and reports the estimate.
    Master,
    /// Echoes sync records with its own clock.
    Slave,
}

/// What the datapath does with capture faults, wrong-format TX slots, kick
/// errors and clock-read failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FaultPolicy {
    /// Fail the operation with the matching `LinkError`.
    Strict,
    /// Count it, log it, recover and carry on.
    Relaxed,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            FaultPolicy::Strict
        } else {
            FaultPolicy::Relaxed
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct LinkArgs {
    /// Network interface the packet rings bind to.
    #[arg(long, env = "RTLINK_IFACE", default_value = DEFAULT_IFACE)]
    pub iface: String,

    /// Our IPv4 address [default: the interface's address].
    #[arg(long, env = "RTLINK_LOCAL_IP")]
    pub local_ip: Option<Ipv4Addr>,

    /// Peer IPv4 address.
    #[arg(long, env = "RTLINK_REMOTE_IP")]
    pub remote_ip: Ipv4Addr,

    /// UDP source port (the peer's destination port).
    #[arg(long, env = "RTLINK_SPORT", default_value_t = DEFAULT_PORT)]
    pub sport: u16,

    /// UDP destination port (the peer's source port).
    #[arg(long, env = "RTLINK_DPORT", default_value_t = DEFAULT_PORT)]
    pub dport: u16,

    /// Peer link-layer address [default: resolved through ARP].
    #[arg(long, env = "RTLINK_REMOTE_MAC")]
    pub remote_mac: Option<MacAddr>,

    #[arg(long, value_enum, env = "RTLINK_ROLE", default_value_t = Role::Master)]
    pub role: Role,

    /// Slots per ring (one page each).
    #[arg(long, env = "RTLINK_RING_DEPTH", default_value_t = DEFAULT_RING_DEPTH)]
    pub ring_depth: usize,

    /// Kick the TX ring from a dedicated thread instead of on flush().
    #[arg(long, env = "RTLINK_BACKGROUND_FLUSH")]
    pub background_flush: bool,

    /// Sync exchanges run by the master.
    #[arg(long, env = "RTLINK_SYNC_ITERATIONS", default_value_t = DEFAULT_SYNC_ITERATIONS)]
    pub sync_iterations: usize,

    /// [default: strict in debug builds, relaxed in release builds]
    #[arg(long, value_enum, env = "RTLINK_POLICY")]
    pub policy: Option<FaultPolicy>,

    /// Cores to pin the process to.
    #[arg(long, env = "RTLINK_CPUS", value_delimiter = ',', default_values_t = [1usize, 2])]
    pub cpus: Vec<usize>,

    /// Pin to the kernel's isolated cores instead of --cpus.
    #[arg(long, env = "RTLINK_ISOLATED_CPUS")]
    pub isolated_cpus: bool,

    /// Skip memory locking and CPU pinning.
    #[arg(long, env = "RTLINK_NO_REALTIME")]
    pub no_realtime: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, env = "RTLINK_VERBOSE")]
    pub verbose: bool,
}

impl LinkArgs {
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuSelection {
    Cores(Vec<usize>),
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub iface: String,
    pub local_ip: Option<Ipv4Addr>,
    pub remote_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub remote_mac: Option<MacAddr>,
    pub role: Role,
    pub ring_depth: usize,
    pub background_flush: bool,
    pub sync_iterations: usize,
    pub policy: FaultPolicy,
    pub cpus: CpuSelection,
    pub realtime: bool,
}

impl LinkConfig {
    /// Defaults for everything but the peer address.
    pub fn new(remote_ip: Ipv4Addr) -> Self {
        LinkConfig {
            iface: DEFAULT_IFACE.to_string(),
            local_ip: None,
            remote_ip,
            src_port: DEFAULT_PORT,
            dst_port: DEFAULT_PORT,
            remote_mac: None,
            role: Role::Master,
            ring_depth: DEFAULT_RING_DEPTH,
            background_flush: false,
            sync_iterations: DEFAULT_SYNC_ITERATIONS,
            policy: FaultPolicy::default(),
            cpus: CpuSelection::Cores(vec![1, 2]),
            realtime: true,
        }
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.ring_depth == 0 || u32::try_from(self.ring_depth).is_err() {
            return Err(LinkError::Config(format!("ring depth {} out of range", self.ring_depth)));
        }
        if self.sync_iterations < MIN_SYNC_ITERATIONS {
            return Err(LinkError::Config(format!(
                "sync iterations must be at least {} (got {})",
                MIN_SYNC_ITERATIONS, self.sync_iterations
            )));
        }
        if self.local_ip == Some(self.remote_ip) {
            return Err(LinkError::Config(format!("local and remote address are both {}", self.remote_ip)));
        }
        if self.iface.is_empty() {
            return Err(LinkError::Config("empty interface name".into()));
        }
        Ok(())
    }

    pub fn endpoint(&self, local_ip: Ipv4Addr, remote_mac: MacAddr) -> Endpoint {
        Endpoint {
            local_ip,
            remote_ip: self.remote_ip,
            src_port: self.src_port,
            dst_port: self.dst_port,
            remote_mac,
        }
    }

    /// Fill in whatever was left to discovery: our address from the
    /// interface, the peer's MAC from ARP.
    pub fn resolve_endpoint(&self) -> Result<Endpoint, LinkError> {
        let local_ip = match self.local_ip {
            Some(ip) => ip,
            None => interface_ipv4(&self.iface)?,
        };
        if local_ip == self.remote_ip {
            return Err(LinkError::Config(format!("{} is this host's own address", local_ip)));
        }
        let remote_mac = match self.remote_mac {
            Some(mac) => mac,
            None => resolve_link_address(&self.iface, self.remote_ip)?,
        };
        Ok(self.endpoint(local_ip, remote_mac))
    }
}

impl TryFrom<LinkArgs> for LinkConfig {
    type Error = LinkError;

    fn try_from(args: LinkArgs) -> Result<Self, Self::Error> {
        let cfg = LinkConfig {
            iface: args.iface,
            local_ip: args.local_ip,
            remote_ip: args.remote_ip,
            src_port: args.sport,
            dst_port: args.dport,
            remote_mac: args.remote_mac,
            role: args.role,
            ring_depth: args.ring_depth,
            background_flush: args.background_flush,
            sync_iterations: args.sync_iterations,
            policy: args.policy.unwrap_or_default(),
            cpus: if args.isolated_cpus { CpuSelection::Isolated } else { CpuSelection::Cores(args.cpus) },
            realtime: !args.no_realtime,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
