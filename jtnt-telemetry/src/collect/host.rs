//! Host identity: hostname, OS name/version, architecture, uptime.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to get hostname: {0}")]
    Hostname(#[from] nix::errno::Errno),

    #[error("hostname is not valid utf-8")]
    HostnameEncoding,

    #[error("failed to read host identity: {0}")]
    Read(#[from] std::io::Error),
}

/// Best-effort host identity fields.
#[derive(Debug, Clone, Default)]
pub struct HostIdentity {
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub uptime_secs: u64,
}

/// The machine hostname. This is the one field the heartbeat cannot do
/// without.
pub fn hostname() -> Result<String, HostError> {
    let name = nix::unistd::gethostname()?;
    name.into_string().map_err(|_| HostError::HostnameEncoding)
}

/// OS family/version, architecture, and uptime.
pub fn identity() -> Result<HostIdentity, HostError> {
    Ok(HostIdentity {
        os: std::env::consts::OS.to_string(),
        os_version: os_version().unwrap_or_else(|| "unknown".to_string()),
        arch: std::env::consts::ARCH.to_string(),
        uptime_secs: uptime_secs().unwrap_or(0),
    })
}

#[cfg(target_os = "linux")]
fn os_version() -> Option<String> {
    let content = std::fs::read_to_string("/etc/os-release").ok()?;
    parse_os_release(&content)
}

#[cfg(not(target_os = "linux"))]
fn os_version() -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn parse_os_release(content: &str) -> Option<String> {
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("PRETTY_NAME=") {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn uptime_secs() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/uptime").ok()?;
    let first = content.split_whitespace().next()?;
    first.parse::<f64>().ok().map(|secs| secs as u64)
}

#[cfg(not(target_os = "linux"))]
fn uptime_secs() -> Option<u64> {
    None
}
