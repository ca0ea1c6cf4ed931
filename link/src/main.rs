// RTLINK — LINK DRIVER
// Usage:
//   master: sudo ./rtlink --iface eth1 --remote-ip 10.0.0.2 --role master [--spikes N]
//   slave:  sudo ./rtlink --iface eth1 --remote-ip 10.0.0.1 --role slave  [--spikes N]
//
// Resolve the endpoint, prepare the process, open the rings, run clock sync,
// then optionally stream N spike records stamped with synced time; the slave
// reports their one-way latency on the shared clock.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use rtlink::engine::sync::mean_stdev;
use rtlink::{
    prepare_realtime, sync, LinkArgs, LinkConfig, LinkError, PacketType, RingTransport, Role, SpikeRecord,
};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }
}

#[derive(Debug, Parser)]
#[command(name = "rtlink", version, about = "Zero-copy raw UDP spike link with clock sync")]
struct Cli {
    #[command(flatten)]
    link: LinkArgs,

    /// Spike records to stream after sync (master sends, slave measures).
    #[arg(long, env = "RTLINK_SPIKES", default_value_t = 0)]
    spikes: u64,
}

const POLL: Duration = Duration::from_millis(100);

fn stream_spikes(link: &mut RingTransport, count: u64) -> Result<(), LinkError> {
    for i in 0..count {
        if SHUTDOWN.load(Ordering::Relaxed) {
            break;
        }
        let now = link.now()?;
        link.send(&SpikeRecord::new(i, now, i as u16, PacketType::Spikes))?;
    }
    tracing::info!(count, "spikes sent");
    Ok(())
}

fn measure_spikes(link: &mut RingTransport, count: u64) -> Result<(), LinkError> {
    let mut latency = Vec::with_capacity(count.min(1 << 24) as usize);
    while (latency.len() as u64) < count && !SHUTDOWN.load(Ordering::Relaxed) {
        let stamp = match link.receive_blocking_timeout::<SpikeRecord>(POLL) {
            Ok(rec) => rec.timestamp,
            Err(LinkError::Timeout { .. }) => continue,
            Err(e) => return Err(e),
        };
        let now = link.now()?;
        latency.push(now as f64 - stamp as f64);
        link.free_receive();
    }
    let (mean, stdev) = mean_stdev(&latency);
    println!(
        "One-way latency [us]: {:>15.9} +/- {:<15.9} ({} of {} spikes)",
        1e-3 * mean,
        1e-3 * stdev,
        latency.len(),
        count
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    rtlink::init_tracing(cli.link.log_filter());
    install_signal_handlers();

    let config = LinkConfig::try_from(cli.link)?;
    let endpoint = config.resolve_endpoint()?;
    tracing::info!(?endpoint, role = ?config.role, "starting");

    let _realtime = if config.realtime {
        Some(prepare_realtime(&config.cpus)?)
    } else {
        tracing::warn!("real-time preparation disabled");
        None
    };

    let mut link = RingTransport::open(&config, endpoint)?;
    if config.background_flush {
        link.start_background_flush()?;
    }

    let status = sync(&mut link, config.role, config.sync_iterations)?;
    if config.role == Role::Master {
        print!("{}", status);
    }

    if cli.spikes > 0 {
        match config.role {
            Role::Master => stream_spikes(&mut link, cli.spikes)?,
            Role::Slave => measure_spikes(&mut link, cli.spikes)?,
        }
    }

    tracing::info!(telemetry = %link.telemetry(), "shutdown complete");
    Ok(())
}
