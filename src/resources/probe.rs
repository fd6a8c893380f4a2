//! Host resource sampling.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::trace;

/// One resource usage sample. Fields are `None` when unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// System memory in use, percent.
    pub memory_percent: Option<f64>,
    /// System CPU busy time since the previous sample, percent.
    pub cpu_percent: Option<f64>,
    /// Resident set size of this process.
    pub process_rss_bytes: Option<u64>,
}

/// Source of resource usage samples.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> ResourceUsage;
}

/// Aggregate CPU counters from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Probe reading the Linux `/proc` filesystem.
///
/// CPU usage is the busy share between two readings of `/proc/stat`. The
/// first sample waits `cpu_window` for a second reading; later samples
/// compare against the previous call.
#[derive(Debug)]
pub struct ProcProbe {
    cpu_window: Duration,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl ProcProbe {
    pub fn new() -> Self {
        Self::with_cpu_window(Duration::from_secs(1))
    }

    pub fn with_cpu_window(cpu_window: Duration) -> Self {
        Self {
            cpu_window,
            last_cpu: Mutex::new(None),
        }
    }

    async fn read_cpu() -> Option<CpuTimes> {
        let stat = tokio::fs::read_to_string("/proc/stat").await.ok()?;
        parse_cpu_times(&stat)
    }

    async fn cpu_percent(&self) -> Option<f64> {
        let previous = *self.last_cpu.lock().unwrap_or_else(|e| e.into_inner());
        let previous = match previous {
            Some(times) => times,
            None => {
                let first = Self::read_cpu().await?;
                tokio::time::sleep(self.cpu_window).await;
                first
            }
        };

        let current = Self::read_cpu().await?;
        *self.last_cpu.lock().unwrap_or_else(|e| e.into_inner()) = Some(current);
        cpu_busy_percent(previous, current)
    }
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProbe for ProcProbe {
    async fn sample(&self) -> ResourceUsage {
        let memory_percent = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|s| parse_memory_percent(&s));
        let process_rss_bytes = tokio::fs::read_to_string("/proc/self/status")
            .await
            .ok()
            .and_then(|s| parse_vm_rss(&s));
        let cpu_percent = self.cpu_percent().await;

        let usage = ResourceUsage {
            memory_percent,
            cpu_percent,
            process_rss_bytes,
        };
        trace!(?usage, "Sampled resource usage");
        usage
    }
}

/// Reads a `Key:   1234 kB` line value.
fn meminfo_kb(meminfo: &str, key: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

fn parse_memory_percent(meminfo: &str) -> Option<f64> {
    let total = meminfo_kb(meminfo, "MemTotal")?;
    let available = meminfo_kb(meminfo, "MemAvailable")?;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    meminfo_kb(status, "VmRSS").map(|kb| kb * 1024)
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
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
    Some(CpuTimes {
        idle,
        total: values.iter().sum(),
    })
}

fn cpu_busy_percent(previous: CpuTimes, current: CpuTimes) -> Option<f64> {
    let total = current.total.checked_sub(previous.total)?;
    let idle = current.idle.checked_sub(previous.idle)?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(idle) as f64 / total as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16000000 kB\n\
                           MemFree:         2000000 kB\n\
                           MemAvailable:    4000000 kB\n";

    #[test]
    fn test_parse_memory_percent() {
        let percent = parse_memory_percent(MEMINFO).unwrap();
        assert!((percent - 75.0).abs() < 1e-9);
        assert!(parse_memory_percent("MemTotal: 0 kB\nMemAvailable: 0 kB\n").is_none());
        assert!(parse_memory_percent("garbage").is_none());
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\trender-forge\nVmRSS:\t   2048 kB\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
    }

    #[test]
    fn test_cpu_busy_percent() {
        let before = parse_cpu_times("cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n").unwrap();
        let after = parse_cpu_times("cpu  200 0 200 1000 200 0 0 0 0 0\n").unwrap();
        assert_eq!(before, CpuTimes { idle: 800, total: 1000 });

        // 600 ticks elapsed, 400 of them idle.
        let busy = cpu_busy_percent(before, after).unwrap();
        assert!((busy - 100.0 / 3.0).abs() < 1e-9);
        assert!(cpu_busy_percent(after, before).is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_proc_probe_samples_on_linux() {
        let probe = ProcProbe::with_cpu_window(Duration::from_millis(50));
        let usage = probe.sample().await;
        let memory = usage.memory_percent.unwrap();
        assert!((0.0..=100.0).contains(&memory));
        assert!(usage.process_rss_bytes.unwrap() > 0);
    }
}
