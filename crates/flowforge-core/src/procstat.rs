//! `/proc/{pid}` sampling for the monitor loop.
//!
//! CPU usage is derived from the utime+stime jiffy counters in
//! `/proc/{pid}/stat`, differenced across sampling ticks. File descriptor
//! and socket counts come from `/proc/{pid}/fd`. Reads are bounded and
//! fail closed: a vanished or unreadable process yields an error, never a
//! fabricated sample.

use std::io::Read;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use thiserror::Error;

/// Upper bound for proc file reads; stat lines are tiny but the limit
/// keeps a hostile `/proc` mount from ballooning memory.
const MAX_PROC_FILE_SIZE: u64 = 64 * 1024;

/// Sampling errors.
#[derive(Debug, Error)]
pub enum ProcStatError {
    /// PID is not a live positive process id.
    #[error("invalid pid: {0}")]
    InvalidPid(i32),

    /// A proc file could not be read (process likely exited).
    #[error("failed to read /proc/{pid}/{file}: {source}")]
    ReadFailed {
        /// Process id being sampled.
        pid: i32,
        /// File under `/proc/{pid}/`.
        file: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A proc file did not parse.
    #[error("failed to parse /proc/{pid}/{file}: {reason}")]
    ParseFailed {
        /// Process id being sampled.
        pid: i32,
        /// File under `/proc/{pid}/`.
        file: &'static str,
        /// What went wrong.
        reason: String,
    },
}

/// Clock ticks per second, queried once via sysconf.
fn clk_tck() -> u64 {
    static CLK_TCK: OnceLock<u64> = OnceLock::new();
    *CLK_TCK.get_or_init(|| {
        // SAFETY: sysconf reads system configuration without touching any
        // process state and is callable from any thread.
        let ticks = unsafe { nix::libc::sysconf(nix::libc::_SC_CLK_TCK) };
        if ticks > 0 { ticks as u64 } else { 100 }
    })
}

/// Point-in-time resource counts for a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    /// Open file descriptors.
    pub open_fds: usize,
    /// File descriptors that are sockets.
    pub socket_count: usize,
}

/// CPU sampler differencing jiffy counters across ticks.
///
/// The first call to [`ProcSampler::sample_cpu_percent`] establishes the
/// baseline and reports 0%.
#[derive(Debug)]
pub struct ProcSampler {
    pid: i32,
    last: Option<(Instant, u64)>,
}

impl ProcSampler {
    /// Creates a sampler for `pid`.
    #[must_use]
    pub const fn new(pid: i32) -> Self {
        Self { pid, last: None }
    }

    /// PID being sampled.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Samples CPU usage since the previous call, in percent of one core.
    ///
    /// # Errors
    ///
    /// Fails when the process has exited or its stat line is unreadable.
    pub fn sample_cpu_percent(&mut self) -> Result<f64, ProcStatError> {
        let jiffies = read_cpu_jiffies(self.pid)?;
        let now = Instant::now();
        let cpu = match self.last {
            Some((then, prev)) => {
                let wall = now.duration_since(then).as_secs_f64();
                if wall <= 0.0 {
                    0.0
                } else {
                    let used = jiffies.saturating_sub(prev) as f64 / clk_tck() as f64;
                    (used / wall * 100.0).max(0.0)
                }
            }
            None => 0.0,
        };
        self.last = Some((now, jiffies));
        Ok(cpu)
    }

    /// Counts open file descriptors and sockets.
    ///
    /// # Errors
    ///
    /// Fails when `/proc/{pid}/fd` is unreadable.
    pub fn resource_counts(&self) -> Result<ResourceCounts, ProcStatError> {
        resource_counts(self.pid)
    }
}

/// Total utime+stime jiffies for `pid`.
fn read_cpu_jiffies(pid: i32) -> Result<u64, ProcStatError> {
    let stat = read_proc_file(pid, "stat")?;
    // The command field is parenthesized and may itself contain spaces or
    // parentheses; fields are only positional after the final ')'.
    let after_comm = stat
        .rfind(')')
        .map(|i| &stat[i + 1..])
        .ok_or_else(|| ProcStatError::ParseFailed {
            pid,
            file: "stat",
            reason: "missing comm delimiter".to_string(),
        })?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // After the comm field: state is index 0, utime is index 11, stime 12.
    let utime: u64 = parse_stat_field(pid, &fields, 11)?;
    let stime: u64 = parse_stat_field(pid, &fields, 12)?;
    Ok(utime + stime)
}

fn parse_stat_field(pid: i32, fields: &[&str], index: usize) -> Result<u64, ProcStatError> {
    fields
        .get(index)
        .and_then(|f| f.parse::<u64>().ok())
        .ok_or_else(|| ProcStatError::ParseFailed {
            pid,
            file: "stat",
            reason: format!("missing numeric field {index}"),
        })
}

/// Counts fds and socket fds for `pid`.
///
/// # Errors
///
/// Fails when the fd directory cannot be listed.
pub fn resource_counts(pid: i32) -> Result<ResourceCounts, ProcStatError> {
    if pid <= 0 {
        return Err(ProcStatError::InvalidPid(pid));
    }
    let dir = PathBuf::from(format!("/proc/{pid}/fd"));
    let entries = std::fs::read_dir(&dir).map_err(|source| ProcStatError::ReadFailed {
        pid,
        file: "fd",
        source,
    })?;

    let mut counts = ResourceCounts::default();
    for entry in entries.flatten() {
        counts.open_fds += 1;
        if let Ok(target) = std::fs::read_link(entry.path()) {
            if target.to_string_lossy().starts_with("socket:") {
                counts.socket_count += 1;
            }
        }
    }
    Ok(counts)
}

/// Whether `pid` still exists (signal 0 probe).
#[must_use]
pub fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

fn read_proc_file(pid: i32, file: &'static str) -> Result<String, ProcStatError> {
    if pid <= 0 {
        return Err(ProcStatError::InvalidPid(pid));
    }
    let path = format!("/proc/{pid}/{file}");
    let handle = std::fs::File::open(&path).map_err(|source| ProcStatError::ReadFailed {
        pid,
        file,
        source,
    })?;
    let mut content = String::new();
    handle
        .take(MAX_PROC_FILE_SIZE)
        .read_to_string(&mut content)
        .map_err(|source| ProcStatError::ReadFailed { pid, file, source })?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_pid() -> i32 {
        std::process::id() as i32
    }

    #[test]
    fn samples_own_process() {
        let mut sampler = ProcSampler::new(own_pid());
        // First sample establishes the baseline.
        assert_eq!(sampler.sample_cpu_percent().unwrap(), 0.0);
        // Burn a little CPU so the delta is well-defined.
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_add(i);
        }
        std::hint::black_box(acc);
        let cpu = sampler.sample_cpu_percent().unwrap();
        assert!(cpu >= 0.0);
    }

    #[test]
    fn counts_own_fds() {
        let counts = resource_counts(own_pid()).unwrap();
        assert!(counts.open_fds >= 3, "stdio should be open: {counts:?}");
        assert!(counts.socket_count <= counts.open_fds);
    }

    #[test]
    fn rejects_invalid_pid() {
        assert!(matches!(
            resource_counts(0),
            Err(ProcStatError::InvalidPid(0))
        ));
        let mut sampler = ProcSampler::new(-4);
        assert!(sampler.sample_cpu_percent().is_err());
    }

    #[test]
    fn vanished_pid_fails_closed() {
        // PID max on Linux is bounded well below this value.
        let mut sampler = ProcSampler::new(i32::MAX - 7);
        assert!(sampler.sample_cpu_percent().is_err());
    }

    #[test]
    fn existence_probe() {
        assert!(process_exists(own_pid()));
        assert!(!process_exists(0));
        assert!(!process_exists(-1));
    }
}
