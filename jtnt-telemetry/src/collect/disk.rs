//! Disk usage for the root filesystem via statvfs.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("statvfs failed: {0}")]
    Statvfs(#[from] nix::errno::Errno),
}

/// Usage of a single filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Usage of the filesystem containing `/`.
pub fn root_usage() -> Result<DiskUsage, DiskError> {
    usage(Path::new("/"))
}

pub fn usage(path: &Path) -> Result<DiskUsage, DiskError> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let frsize = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * frsize;
    let free = stat.blocks_free() as u64 * frsize;
    Ok(DiskUsage {
        total_bytes: total,
        used_bytes: total.saturating_sub(free),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_root_usage_is_sane() {
        let usage = root_usage().unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.used_bytes <= usage.total_bytes);
    }

    #[cfg(unix)]
    #[test]
    fn test_usage_of_tmp() {
        let usage = usage(Path::new("/tmp")).unwrap();
        assert!(usage.total_bytes > 0);
    }
}
