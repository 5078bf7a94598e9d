//! Host probe reading `/proc` (CPU, memory) and `statvfs` (disk).
//!
//! Figures that cannot be read come back as `None`; the monitor skips them.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::ports::{HostProbe, HostSample};

/// (idle, total) jiffies from the aggregate `cpu` line.
fn parse_cpu_line(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total = values.iter().sum();
    Some((idle, total))
}

/// Used memory percentage from `/proc/meminfo`.
fn parse_meminfo(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total) * 100.0)
}

fn cpu_percent(prev: (u64, u64), now: (u64, u64)) -> Option<f64> {
    let total = now.1.checked_sub(prev.1)?;
    let idle = now.0.checked_sub(prev.0)?;
    if total == 0 {
        return None;
    }
    Some((1.0 - idle as f64 / total as f64) * 100.0)
}

#[cfg(unix)]
fn disk_percent(path: &std::path::Path) -> Option<f64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    let blocks = stat.blocks() as f64;
    let free = stat.blocks_free() as f64;
    let available = stat.blocks_available() as f64;
    let used = blocks - free;
    let usable = used + available;
    if usable <= 0.0 {
        return None;
    }
    Some(used / usable * 100.0)
}

#[cfg(not(unix))]
fn disk_percent(_path: &std::path::Path) -> Option<f64> {
    None
}

/// Linux host probe.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// has no CPU figure.
#[derive(Debug)]
pub struct ProcProbe {
    disk_path: PathBuf,
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl ProcProbe {
    /// `disk_path` selects the filesystem to watch (normally the state directory).
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            last_cpu: Mutex::new(None),
        }
    }

    async fn sample_cpu(&self) -> Option<f64> {
        let stat = tokio::fs::read_to_string("/proc/stat").await.ok()?;
        let now = parse_cpu_line(&stat)?;
        let mut last = self.last_cpu.lock().ok()?;
        let previous = last.replace(now)?;
        cpu_percent(previous, now)
    }

    async fn sample_memory(&self) -> Option<f64> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        parse_meminfo(&meminfo)
    }

    /// `statvfs` blocks, so it runs on the blocking pool.
    async fn sample_disk(&self) -> Option<f64> {
        let path = self.disk_path.clone();
        match tokio::task::spawn_blocking(move || disk_percent(&path)).await {
            Ok(pct) => pct,
            Err(e) => {
                debug!(error = %e, "disk usage probe did not finish");
                None
            }
        }
    }
}

#[async_trait]
impl HostProbe for ProcProbe {
    async fn sample(&self) -> HostSample {
        HostSample {
            cpu_percent: self.sample_cpu().await,
            memory_percent: self.sample_memory().await,
            disk_percent: self.sample_disk().await,
        }
    }
}
