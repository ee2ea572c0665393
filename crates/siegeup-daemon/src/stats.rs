//! Best-effort host and per-child statistics for the status snapshot.
//!
//! Everything here reads `/proc` and degrades to zeros when a file is
//! missing or unparsable; the snapshot must never fail because telemetry is
//! unavailable.

use std::sync::{Arc, Mutex, OnceLock};

use nix::libc;

const KIB_PER_MIB: u64 = 1024;
const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Host memory totals in MiB.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryInfo {
    /// Total physical memory.
    pub total_mb: u64,
    /// Memory in use (total minus available).
    pub used_mb: u64,
}

/// Reads host memory totals from `/proc/meminfo`.
#[must_use]
pub fn read_memory() -> Option<MemoryInfo> {
    let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
    let total_kb = meminfo_field(&raw, "MemTotal:")?;
    let available_kb = meminfo_field(&raw, "MemAvailable:")?;
    Some(MemoryInfo {
        total_mb: total_kb / KIB_PER_MIB,
        used_mb: total_kb.saturating_sub(available_kb) / KIB_PER_MIB,
    })
}

fn meminfo_field(raw: &str, key: &str) -> Option<u64> {
    raw.lines()
        .find(|line| line.starts_with(key))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Resident set size of `pid` in MiB, from `/proc/<pid>/statm`. Returns 0
/// when the process is gone or unreadable.
#[must_use]
pub fn process_rss_mb(pid: u32) -> u64 {
    let Ok(raw) = std::fs::read_to_string(format!("/proc/{pid}/statm")) else {
        return 0;
    };
    raw.split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<u64>().ok())
        .map_or(0, |pages| pages * page_size() / BYTES_PER_MIB)
}

/// Runtime-queried system page size, defaulting to 4 KiB if `sysconf` is
/// unavailable.
#[allow(unsafe_code, clippy::cast_sign_loss)]
fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf is a thread-safe libc function that only reads
        // system configuration.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if result > 0 { result as u64 } else { 4096 }
    })
}

/// Host name as reported by the OS, or `"unknown"`.
#[must_use]
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// One aggregate CPU reading from `/proc/stat`.
#[derive(Debug, Clone, Copy)]
struct CpuSample {
    busy: u64,
    total: u64,
}

fn read_cpu_sample() -> Option<CpuSample> {
    let raw = std::fs::read_to_string("/proc/stat").ok()?;
    let line = raw.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|field| field.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait count as idle time; everything else is busy.
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some(CpuSample {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// CPU usage tracker computing the busy share since the previous poll.
///
/// The first poll has no baseline and reports 0.0.
#[derive(Debug, Clone, Default)]
pub struct CpuTracker {
    prev: Arc<Mutex<Option<CpuSample>>>,
}

impl CpuTracker {
    /// Creates a tracker with no baseline sample.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Percentage of CPU time spent busy since the previous call, 0.0 when
    /// no delta is available yet.
    #[must_use]
    pub fn usage_percent(&self) -> f64 {
        let Some(current) = read_cpu_sample() else {
            return 0.0;
        };
        let mut prev = self.prev.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let usage = match *prev {
            Some(before) if current.total > before.total => {
                let busy = current.busy.saturating_sub(before.busy) as f64;
                let total = (current.total - before.total) as f64;
                (busy / total * 100.0).clamp(0.0, 100.0)
            },
            _ => 0.0,
        };
        *prev = Some(current);
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meminfo_field_parsing() {
        let raw = "MemTotal:       16315204 kB\nMemFree:  1189940 kB\nMemAvailable: 8203996 kB\n";
        assert_eq!(meminfo_field(raw, "MemTotal:"), Some(16_315_204));
        assert_eq!(meminfo_field(raw, "MemAvailable:"), Some(8_203_996));
        assert_eq!(meminfo_field(raw, "SwapTotal:"), None);
    }

    #[test]
    fn test_process_rss_of_self_is_nonzero() {
        assert!(process_rss_mb(std::process::id()) > 0);
    }

    #[test]
    fn test_missing_pid_reports_zero() {
        assert_eq!(process_rss_mb(u32::MAX), 0);
    }

    #[test]
    fn test_cpu_tracker_first_poll_is_zero() {
        let tracker = CpuTracker::new();
        assert_eq!(tracker.usage_percent(), 0.0);

        // A second poll has a baseline and stays within the percent range.
        let second = tracker.usage_percent();
        assert!((0.0..=100.0).contains(&second));
    }

    #[test]
    fn test_hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }
}
