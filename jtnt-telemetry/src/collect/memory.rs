//! Memory metrics from /proc/meminfo.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("failed to read /proc/meminfo: {0}")]
    Read(#[from] std::io::Error),

    #[error("missing /proc/meminfo field: {0}")]
    MissingField(&'static str),
}

/// Parsed memory counters, in kilobytes as the kernel reports them.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryInfo {
    pub total_kb: u64,
    pub free_kb: u64,
    /// Kernel estimate of memory available for new allocations; absent on
    /// very old kernels, in which case it falls back to MemFree.
    pub available_kb: u64,
}

impl MemoryInfo {
    pub fn read() -> Result<Self, MemoryError> {
        let content = std::fs::read_to_string("/proc/meminfo")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, MemoryError> {
        let mut info = Self::default();
        let mut have_available = false;

        for line in content.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let value: u64 = rest
                .trim()
                .trim_end_matches(" kB")
                .trim()
                .parse()
                .unwrap_or(0);
            match key {
                "MemTotal" => info.total_kb = value,
                "MemFree" => info.free_kb = value,
                "MemAvailable" => {
                    info.available_kb = value;
                    have_available = true;
                }
                _ => {}
            }
        }

        if info.total_kb == 0 {
            return Err(MemoryError::MissingField("MemTotal"));
        }
        if !have_available {
            info.available_kb = info.free_kb;
        }

        Ok(info)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_kb * 1024
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb) * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "MemTotal:       16384000 kB\n\
                          MemFree:         2048000 kB\n\
                          MemAvailable:    8192000 kB\n\
                          Buffers:          512000 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let info = MemoryInfo::parse(SAMPLE).unwrap();
        assert_eq!(info.total_kb, 16_384_000);
        assert_eq!(info.available_kb, 8_192_000);
        assert_eq!(info.total_bytes(), 16_384_000 * 1024);
        assert_eq!(info.used_bytes(), (16_384_000 - 8_192_000) * 1024);
    }

    #[test]
    fn test_parse_falls_back_to_memfree() {
        let info = MemoryInfo::parse("MemTotal: 1000 kB\nMemFree: 400 kB\n").unwrap();
        assert_eq!(info.available_kb, 400);
    }

    #[test]
    fn test_parse_requires_total() {
        assert!(MemoryInfo::parse("MemFree: 400 kB\n").is_err());
    }
}
