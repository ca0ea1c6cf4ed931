// RTLINK LOOPBACK — ECHO PEER
// Usage:
//   sudo ./rtlink-loopback --iface eth1 --remote-ip 10.0.0.1
//
// Spins on the RX ring, sends every spike record straight back unchanged,
// releases the slot. Runs until SIGINT/SIGTERM. No clock sync.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use rtlink::{prepare_realtime, LinkArgs, LinkConfig, LinkError, RingTransport, SpikeRecord};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

#[derive(Debug, Parser)]
#[command(name = "rtlink-loopback", version, about = "Echo every received spike record back to its sender")]
struct Cli {
    #[command(flatten)]
    link: LinkArgs,
}

const POLL: Duration = Duration::from_millis(100);

fn echo(link: &mut RingTransport) -> Result<u64, LinkError> {
    let mut echoed = 0u64;
    while !SHUTDOWN.load(Ordering::Relaxed) {
        let rec = match link.receive_blocking_timeout::<SpikeRecord>(POLL) {
            Ok(rec) => *rec,
            Err(LinkError::Timeout { .. }) => continue,
            Err(e) => return Err(e),
        };
        link.send(&rec)?;
        link.free_receive();
        echoed += 1;
        let label = rec.label;
        tracing::info!(label, "looping back spike");
    }
    Ok(echoed)
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    rtlink::init_tracing(cli.link.log_filter());
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    let config = LinkConfig::try_from(cli.link)?;
    let endpoint = config.resolve_endpoint()?;
    let _realtime = if config.realtime { Some(prepare_realtime(&config.cpus)?) } else { None };

    let mut link = RingTransport::open(&config, endpoint)?;
    if config.background_flush {
        link.start_background_flush()?;
    }
    tracing::info!(?endpoint, "echoing");

    let echoed = echo(&mut link)?;
    tracing::info!(echoed, telemetry = %link.telemetry(), "shutdown complete");
    Ok(())
}
