//! CPU metrics from /proc/stat.
//!
//! Utilization is the active-jiffy share of the delta between two samples
//! taken one second apart.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CpuError {
    #[error("failed to read /proc/stat: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse /proc/stat: {0}")]
    Parse(String),
}

/// Aggregate CPU counters in jiffies since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuStats {
    /// Read the aggregate "cpu " line from /proc/stat.
    pub fn read() -> Result<Self, CpuError> {
        let content = std::fs::read_to_string("/proc/stat")?;
        Self::parse(&content)
    }

    /// Parse /proc/stat content for the aggregate line.
    pub fn parse(content: &str) -> Result<Self, CpuError> {
        let line = content
            .lines()
            .find(|line| line.starts_with("cpu "))
            .ok_or_else(|| CpuError::Parse("no aggregate cpu line".to_string()))?;

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return Err(CpuError::Parse(format!(
                "cpu line too short: {} fields",
                parts.len()
            )));
        }

        let field = |idx: usize| parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0);

        Ok(Self {
            user: field(1),
            nice: field(2),
            system: field(3),
            idle: field(4),
            iowait: field(5),
            irq: field(6),
            softirq: field(7),
            steal: field(8),
        })
    }

    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn active(&self) -> u64 {
        self.total()
            .saturating_sub(self.idle)
            .saturating_sub(self.iowait)
    }

    /// Utilization percentage between two samples, in [0, 100].
    pub fn percent_between(prev: &CpuStats, curr: &CpuStats) -> f64 {
        let total_delta = curr.total().saturating_sub(prev.total());
        if total_delta == 0 {
            return 0.0;
        }
        let active_delta = curr.active().saturating_sub(prev.active());
        (active_delta as f64 / total_delta as f64) * 100.0
    }
}

/// Sample CPU utilization over `window`.
pub async fn sample_usage(window: Duration) -> Result<f64, CpuError> {
    let first = CpuStats::read()?;
    tokio::time::sleep(window).await;
    let second = CpuStats::read()?;
    Ok(CpuStats::percent_between(&first, &second))
}

/// Logical CPU count, from /proc/stat per-core lines with a
/// `available_parallelism` fallback.
pub fn cpu_count() -> u32 {
    let from_proc = std::fs::read_to_string("/proc/stat")
        .map(|content| {
            content
                .lines()
                .filter(|line| {
                    line.starts_with("cpu")
                        && line
                            .as_bytes()
                            .get(3)
                            .is_some_and(|b| b.is_ascii_digit())
                })
                .count() as u32
        })
        .unwrap_or(0);

    if from_proc > 0 {
        return from_proc;
    }

    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "cpu  100 10 50 800 40 0 5 0 0 0\n\
                          cpu0 50 5 25 400 20 0 3 0 0 0\n\
                          cpu1 50 5 25 400 20 0 2 0 0 0\n\
                          intr 12345\n";

    #[test]
    fn test_parse_aggregate_line() {
        let stats = CpuStats::parse(SAMPLE).unwrap();
        assert_eq!(stats.user, 100);
        assert_eq!(stats.idle, 800);
        assert_eq!(stats.iowait, 40);
        assert_eq!(stats.total(), 1005);
        assert_eq!(stats.active(), 165);
    }

    #[test]
    fn test_parse_rejects_missing_cpu_line() {
        assert!(CpuStats::parse("intr 1\nctxt 2\n").is_err());
    }

    #[test]
    fn test_parse_minimal_fields() {
        let stats = CpuStats::parse("cpu  100 50 30 500\n").unwrap();
        assert_eq!(stats.user, 100);
        assert_eq!(stats.idle, 500);
        assert_eq!(stats.iowait, 0);
    }

    #[test]
    fn test_percent_between() {
        let prev = CpuStats {
            user: 100,
            system: 50,
            idle: 800,
            iowait: 50,
            ..CpuStats::default()
        };
        let curr = CpuStats {
            user: 200,
            system: 100,
            idle: 850,
            iowait: 100,
            ..CpuStats::default()
        };
        let percent = CpuStats::percent_between(&prev, &curr);
        assert!((percent - 60.0).abs() < 0.1);
    }

    #[test]
    fn test_percent_zero_delta() {
        let stats = CpuStats::default();
        assert_eq!(CpuStats::percent_between(&stats, &stats), 0.0);
    }

    #[test]
    fn test_percent_counter_wrap_is_clamped() {
        let prev = CpuStats {
            user: 1000,
            idle: 5000,
            ..CpuStats::default()
        };
        let curr = CpuStats {
            user: 100,
            idle: 500,
            ..CpuStats::default()
        };
        let percent = CpuStats::percent_between(&prev, &curr);
        assert!((0.0..=100.0).contains(&percent));
    }

    #[test]
    fn test_cpu_count_at_least_one() {
        assert!(cpu_count() >= 1);
    }
}
