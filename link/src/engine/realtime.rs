// RTLINK — REAL-TIME PROCESS PREPARATION (COLD PATH)
// Lock memory, prefault the stack, pin to cores and hold the CPU in C0, once
// before the datapath starts. Only mlockall() failing is fatal; the rest
// degrades with a warning.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::config::CpuSelection;
use crate::error::LinkError;

/// Stack touched up front so the hot loop never page-faults on it.
pub const PREFAULT_STACK_BYTES: usize = 8 * 1024;

const ISOLATED_CPUS: &str = "/sys/devices/system/cpu/isolated";
const CPU_DMA_LATENCY: &str = "/dev/cpu_dma_latency";
/// Command line override for isolated-core discovery (tests, containers).
pub const MOCK_CMDLINE_ENV: &str = "RTLINK_MOCK_CMDLINE";

/// Keeps the process in its real-time state. The C-state request is
/// withdrawn when this is dropped.
#[derive(Debug)]
pub struct RealtimeGuard {
    pub cores: Vec<usize>,
    _latency: Option<File>,
}

pub fn prepare_realtime(cpus: &CpuSelection) -> Result<RealtimeGuard, LinkError> {
    // SAFETY: mlockall has no memory-safety preconditions.
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        return Err(LinkError::Realtime { op: "mlockall", source: io::Error::last_os_error() });
    }
    prefault_stack();

    let cores = match cpus {
        CpuSelection::Cores(cores) => cores.clone(),
        CpuSelection::Isolated => discover_isolated_cores(),
    };
    if cores.is_empty() {
        tracing::warn!("no cores to pin to; affinity left unchanged");
    } else {
        pin_to_cores(&cores)?;
        tracing::info!(?cores, "pinned");
    }

    Ok(RealtimeGuard { cores, _latency: lock_cpu_latency() })
}

#[inline(never)]
fn prefault_stack() {
    let mut buf = [0u8; PREFAULT_STACK_BYTES];
    for b in buf.iter_mut() {
        // SAFETY: b is a valid &mut u8.
        unsafe { std::ptr::write_volatile(b, 0) };
    }
    std::hint::black_box(&buf);
}

/// Isolated cores, from `RTLINK_MOCK_CMDLINE`'s `isolcpus=` if set, else
/// from sysfs.
pub fn discover_isolated_cores() -> Vec<usize> {
    if let Ok(mock) = std::env::var(MOCK_CMDLINE_ENV) {
        return isolcpus_from_cmdline(&mock);
    }
    match std::fs::read_to_string(ISOLATED_CPUS) {
        Ok(s) => parse_cpu_list(s.trim()),
        Err(e) => {
            tracing::debug!(error = %e, path = ISOLATED_CPUS, "cannot read isolated cores");
            Vec::new()
        }
    }
}

/// Cores named by `isolcpus=` on a kernel command line. Flag words
/// (`nohz`, `domain`, ...) in front of the list are skipped.
pub fn isolcpus_from_cmdline(cmdline: &str) -> Vec<usize> {
    cmdline
        .split_whitespace()
        .find_map(|p| p.strip_prefix("isolcpus="))
        .map(parse_cpu_list)
        .unwrap_or_default()
}

/// `"1,3-5"` -> `[1, 3, 4, 5]`. Malformed parts are skipped. Sorted, deduped.
pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cores = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    // Past the last settable cpu only `lo` is kept, for pinning to reject.
                    let last = libc::CPU_SETSIZE as usize - 1;
                    cores.extend(lo..=hi.min(last.max(lo)));
                }
            }
            None => {
                if let Ok(id) = part.parse::<usize>() {
                    cores.push(id);
                }
            }
        }
    }
    cores.sort_unstable();
    cores.dedup();
    cores
}

fn pin_to_cores(cores: &[usize]) -> Result<(), LinkError> {
    let max = libc::CPU_SETSIZE as usize;
    if let Some(bad) = cores.iter().find(|&&c| c >= max) {
        return Err(LinkError::Config(format!("cpu {} beyond CPU_SETSIZE {}", bad, max)));
    }
    // SAFETY: cpu_set_t is plain data; every index was checked against CPU_SETSIZE.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        for &core in cores {
            libc::CPU_SET(core, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(LinkError::Realtime { op: "sched_setaffinity", source: io::Error::last_os_error() });
        }
    }
    Ok(())
}

/// Request 0us wakeup latency (C0 only) for as long as the file stays open.
fn lock_cpu_latency() -> Option<File> {
    if std::env::var_os(MOCK_CMDLINE_ENV).is_some() {
        return None;
    }
    let attempt = || -> io::Result<File> {
        let mut file = OpenOptions::new().read(true).write(true).open(CPU_DMA_LATENCY)?;
        file.write_all(&0i32.to_ne_bytes())?;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 4];
        file.read_exact(&mut buf)?;
        if i32::from_ne_bytes(buf) != 0 {
            return Err(io::Error::other("request rejected"));
        }
        Ok(file)
    };
    match attempt() {
        Ok(file) => {
            tracing::info!("cpu latency locked: max 0us (C0 only)");
            Some(file)
        }
        Err(e) => {
            tracing::warn!(error = %e, "cpu latency lock failed, continuing");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_lists() {
        assert_eq!(parse_cpu_list(""), Vec::<usize>::new());
        assert_eq!(parse_cpu_list("3"), vec![3]);
        assert_eq!(parse_cpu_list("1,3-5"), vec![1, 3, 4, 5]);
        assert_eq!(parse_cpu_list("4-5,2,4"), vec![2, 4, 5]);
        assert_eq!(parse_cpu_list("x,2-y,7"), vec![7]);
    }

    #[test]
    fn huge_cpu_ranges_are_clamped() {
        let set = libc::CPU_SETSIZE as usize;
        let cores = parse_cpu_list("0-18446744073709551615");
        assert_eq!(cores.len(), set);
        assert_eq!(cores.last(), Some(&(set - 1)));
        assert_eq!(parse_cpu_list("5000000-9000000000"), vec![5_000_000]);
    }

    #[test]
    fn isolcpus_from_kernel_cmdline() {
        let cmdline = "BOOT_IMAGE=/vmlinuz root=/dev/sda1 isolcpus=2-3,6 quiet";
        assert_eq!(isolcpus_from_cmdline(cmdline), vec![2, 3, 6]);
        assert_eq!(isolcpus_from_cmdline("isolcpus=nohz,domain,1-2"), vec![1, 2]);
        assert!(isolcpus_from_cmdline("quiet splash").is_empty());
    }

    #[test]
    fn pinning_rejects_out_of_range_core() {
        let err = pin_to_cores(&[libc::CPU_SETSIZE as usize]).unwrap_err();
        assert!(matches!(err, LinkError::Config(_)));
    }
}
