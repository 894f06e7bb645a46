//! Resident memory sampling and process group termination.
//!
//! On Linux the resident set of a stage is the sum of `VmRSS` over the stage's
//! process and all of its descendants, read from `/proc`. Other targets report
//! no samples, so only time limits apply there.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::constants::SAMPLE_INTERVAL;

/// Background poller tracking the peak resident memory of one stage.
#[derive(Debug)]
pub struct MemorySampler {
    peak_bytes: Arc<AtomicU64>,
    exceeded: CancellationToken,
    handle: JoinHandle<()>,
}

impl MemorySampler {
    pub fn spawn(pid: u32, limit_bytes: Option<u64>) -> Self {
        let peak_bytes = Arc::new(AtomicU64::new(0));
        let exceeded = CancellationToken::new();

        let handle = {
            let peak_bytes = peak_bytes.clone();
            let exceeded = exceeded.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let Some(rss) = tree_rss_bytes(pid) else {
                        continue;
                    };
                    peak_bytes.fetch_max(rss, Ordering::Relaxed);
                    if limit_bytes.is_some_and(|limit| rss > limit) {
                        tracing::debug!(pid, rss, "Memory limit exceeded");
                        exceeded.cancel();
                        return;
                    }
                }
            })
        };

        Self {
            peak_bytes,
            exceeded,
            handle,
        }
    }

    /// Cancelled as soon as a sample goes over the limit.
    pub fn exceeded(&self) -> &CancellationToken {
        &self.exceeded
    }

    /// Stops sampling and returns the highest observed value.
    pub fn finish(self) -> u64 {
        self.handle.abort();
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

impl Drop for MemorySampler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(target_os = "linux")]
pub fn tree_rss_bytes(root: u32) -> Option<u64> {
    let mut visited = std::collections::HashSet::new();
    let mut pending = vec![root];
    let mut total = None;

    while let Some(pid) = pending.pop() {
        if !visited.insert(pid) {
            continue;
        }
        if let Some(rss) = rss_bytes(pid) {
            total = Some(total.unwrap_or(0) + rss);
        }
        pending.extend(child_pids(pid));
    }

    total
}

#[cfg(not(target_os = "linux"))]
pub fn tree_rss_bytes(_root: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn rss_bytes(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss(&status)
}

#[cfg(target_os = "linux")]
fn child_pids(pid: u32) -> Vec<u32> {
    let Ok(tasks) = std::fs::read_dir(format!("/proc/{pid}/task")) else {
        return Vec::new();
    };
    tasks
        .flatten()
        .filter_map(|task| std::fs::read_to_string(task.path().join("children")).ok())
        .flat_map(|children| {
            children
                .split_whitespace()
                .filter_map(|child| child.parse().ok())
                .collect::<Vec<u32>>()
        })
        .collect()
}

/// Extracts `VmRSS` in bytes from the contents of `/proc/<pid>/status`.
/// Zombies and kernel threads have no such line.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find_map(|line| line.strip_prefix("VmRSS:"))?;
    let kilobytes: u64 = line.trim().trim_end_matches("kB").trim().parse().ok()?;
    Some(kilobytes * 1024)
}

/// Sends SIGKILL to every member of the process group led by `pgid`.
/// A group that is already gone is not an error.
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> std::io::Result<()> {
    let ret = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if ret == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn kill_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

/// Whether `pid` is a live (non-zombie) process.
#[cfg(all(test, target_os = "linux"))]
pub fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tcat\nVmPeak:\t    8000 kB\nVmRSS:\t    1536 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(1536 * 1024));
        assert_eq!(parse_vm_rss("Name:\tkthreadd\nState:\tS\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_process_has_resident_memory() {
        let rss = tree_rss_bytes(std::process::id()).expect("own rss should be readable");
        assert!(rss > 0);
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_kill_missing_group_is_ok() {
        // pid_max on Linux never reaches this value
        assert!(kill_group(0x3fff_fff0).is_ok());
    }
}
