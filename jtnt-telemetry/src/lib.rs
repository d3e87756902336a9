//! Best-effort host telemetry for JTNT agent heartbeats.
//!
//! Produces the `SystemInfo` snapshot carried in every heartbeat. The
//! hostname is the only required field; every other collector degrades to
//! its zero value or "unknown" when the underlying source is unavailable
//! (common in containers), emitting a single info-level note per snapshot.

pub mod collect;

use chrono::Utc;
use jtnt_common::types::SystemInfo;
use std::time::Duration;
use tracing::info;

/// How long the CPU sampler waits between its two /proc/stat reads.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// System information collector.
#[derive(Debug, Default)]
pub struct Collector;

impl Collector {
    pub fn new() -> Self {
        Self
    }

    /// Gather a snapshot.
    ///
    /// Fails only when the hostname cannot be determined; everything else
    /// is best-effort. The CPU sample blocks (asynchronously) for one
    /// second to produce a utilization percentage.
    pub async fn collect(&self) -> Result<SystemInfo, collect::host::HostError> {
        let mut degraded: Vec<&str> = Vec::new();

        let hostname = collect::host::hostname()?;

        let mut info = SystemInfo {
            hostname,
            timestamp: Some(Utc::now()),
            ..SystemInfo::default()
        };

        match collect::host::identity() {
            Ok(host) => {
                info.os = host.os;
                info.os_version = host.os_version;
                info.arch = host.arch;
                info.uptime = host.uptime_secs;
            }
            Err(_) => {
                info.os = "unknown".to_string();
                info.os_version = "unknown".to_string();
                info.arch = "unknown".to_string();
                degraded.push("host");
            }
        }

        info.cpu_count = collect::cpu::cpu_count();
        match collect::cpu::sample_usage(CPU_SAMPLE_WINDOW).await {
            Ok(percent) => info.cpu_usage = percent,
            Err(_) => degraded.push("cpu"),
        }

        match collect::memory::MemoryInfo::read() {
            Ok(mem) => {
                info.mem_total = mem.total_bytes();
                info.mem_used = mem.used_bytes();
            }
            Err(_) => degraded.push("memory"),
        }

        match collect::disk::root_usage() {
            Ok(disk) => {
                info.disk_total = disk.total_bytes;
                info.disk_used = disk.used_bytes;
            }
            Err(_) => degraded.push("disk"),
        }

        match collect::network::ipv4_addresses() {
            Ok(addrs) => info.ip_addresses = addrs,
            Err(_) => degraded.push("network"),
        }

        if !degraded.is_empty() {
            info!(
                sources = degraded.join(","),
                "some telemetry sources unavailable, reporting partial snapshot"
            );
        }

        Ok(info)
    }
}
