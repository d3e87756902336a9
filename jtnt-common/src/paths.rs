//! Platform state directory layout.
//!
//! All durable agent state lives under a single platform-specific root:
//! `/var/lib/jtnt-agent` on Linux, `/Library/Application Support/JTNT/Agent`
//! on macOS, `%PROGRAMDATA%\JTNT\Agent` on Windows. `JTNT_AGENT_STATE_DIR`
//! overrides the root for tests and unprivileged runs.

use std::path::PathBuf;

const STATE_DIR_ENV: &str = "JTNT_AGENT_STATE_DIR";

/// Root of the agent's durable state.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    platform_state_dir()
}

#[cfg(target_os = "linux")]
fn platform_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/jtnt-agent")
}

#[cfg(target_os = "macos")]
fn platform_state_dir() -> PathBuf {
    PathBuf::from("/Library/Application Support/JTNT/Agent")
}

#[cfg(target_os = "windows")]
fn platform_state_dir() -> PathBuf {
    let program_data =
        std::env::var("PROGRAMDATA").unwrap_or_else(|_| "C:\\ProgramData".to_string());
    PathBuf::from(program_data).join("JTNT").join("Agent")
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn platform_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jtnt-agent")
}

/// Path of `config.json`.
pub fn config_path() -> PathBuf {
    state_dir().join("config.json")
}

/// Directory holding certificates, keys, and the agent token.
pub fn certs_dir() -> PathBuf {
    state_dir().join("certs")
}

/// Directory holding spooled job results awaiting upload.
pub fn spool_dir() -> PathBuf {
    state_dir().join("job_results_pending")
}

/// Directory holding the signed audit log files.
pub fn audit_dir() -> PathBuf {
    state_dir().join("audit")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_hangs_off_state_dir() {
        let root = state_dir();
        assert_eq!(config_path(), root.join("config.json"));
        assert_eq!(certs_dir(), root.join("certs"));
        assert_eq!(spool_dir(), root.join("job_results_pending"));
        assert_eq!(audit_dir(), root.join("audit"));
    }
}
