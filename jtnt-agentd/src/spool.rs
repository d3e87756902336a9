//! Durable on-disk spool of job results whose in-band report failed.
//!
//! A spool entry exists exactly while the hub has not acknowledged that
//! result. Entries are flushed opportunistically by the job loop and
//! purged once older than the retention window. Spooling the same job id
//! twice yields two files (different timestamps); deduplication on
//! re-delivery is the hub's responsibility.

use jtnt_common::types::JobResult;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Retention window for unsent results.
pub const MAX_SPOOL_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("failed to create spool directory: {0}")]
    Create(#[source] std::io::Error),

    #[error("failed to write spool entry: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to read spool directory: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Filesystem-backed result spool.
pub struct ResultSpool {
    dir: PathBuf,
}

impl ResultSpool {
    pub fn new(dir: &Path) -> Result<Self, SpoolError> {
        std::fs::create_dir_all(dir).map_err(SpoolError::Create)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Persist a result as `<job_id>_<unix_seconds>.json`, atomically and
    /// owner-only.
    pub fn store(&self, job_id: &str, result: &JobResult) -> Result<PathBuf, SpoolError> {
        let data = serde_json::to_vec_pretty(result)?;
        let name = format!("{}_{}.json", job_id, chrono::Utc::now().timestamp());
        let path = self.dir.join(&name);

        let tmp = self.dir.join(format!(".{name}.tmp"));
        std::fs::write(&tmp, &data).map_err(SpoolError::Write)?;
        set_owner_only(&tmp).map_err(SpoolError::Write)?;
        std::fs::rename(&tmp, &path).map_err(SpoolError::Write)?;

        debug!(job_id, path = %path.display(), "spooled job result");
        Ok(path)
    }

    /// All pending (path, result) pairs. Unreadable or malformed entries
    /// are skipped with a warning rather than blocking the rest.
    pub fn list(&self) -> Result<Vec<(PathBuf, JobResult)>, SpoolError> {
        let mut results = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(SpoolError::Read)? {
            let entry = entry.map_err(SpoolError::Read)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable spool entry");
                    continue;
                }
            };
            match serde_json::from_slice::<JobResult>(&data) {
                Ok(result) => results.push((path, result)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "malformed spool entry");
                }
            }
        }
        Ok(results)
    }

    pub fn delete(&self, path: &Path) -> Result<(), SpoolError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SpoolError::Write(err)),
        }
    }

    /// Remove entries whose modification time is older than `max_age`.
    pub fn purge(&self, max_age: Duration) -> Result<usize, SpoolError> {
        let cutoff = std::time::SystemTime::now() - max_age;
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir).map_err(SpoolError::Read)? {
            let entry = entry.map_err(SpoolError::Read)?;
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            if let Ok(modified) = metadata.modified() {
                if modified < cutoff && std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Job id encoded in a spool file name: the longest prefix before the
/// final `_` of the basename sans extension.
pub fn extract_job_id(path: &Path) -> String {
    let base = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    match base.rfind('_') {
        Some(idx) => base[..idx].to_string(),
        None => base.to_string(),
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jtnt_common::types::JobStatus;

    fn sample_result() -> JobResult {
        JobResult {
            agent_id: "agent-1".to_string(),
            status: JobStatus::Success,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            exit_code: 0,
            stdout_tail: "aGVsbG8=".to_string(),
            stderr_tail: String::new(),
            error_message: String::new(),
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn test_store_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();

        let stored = sample_result();
        let path = spool.store("job-42", &stored).unwrap();
        assert!(path.exists());

        let listed = spool.list().unwrap();
        assert_eq!(listed.len(), 1);
        let (listed_path, listed_result) = &listed[0];
        assert_eq!(listed_path, &path);
        // Byte-equal after JSON canonicalization.
        assert_eq!(
            serde_json::to_vec(&listed_result).unwrap(),
            serde_json::to_vec(&stored).unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_store_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();
        let path = spool.store("job-1", &sample_result()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_extract_job_id_longest_prefix_rule() {
        assert_eq!(
            extract_job_id(Path::new("/x/job-42_1700000000.json")),
            "job-42"
        );
        // Job ids containing underscores keep everything before the final one.
        assert_eq!(
            extract_job_id(Path::new("/x/batch_7_retry_1700000000.json")),
            "batch_7_retry"
        );
        assert_eq!(extract_job_id(Path::new("/x/bare.json")), "bare");
    }

    #[test]
    fn test_extract_job_id_of_stored_entry() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();
        let path = spool.store("job-42", &sample_result()).unwrap();
        assert_eq!(extract_job_id(&path), "job-42");
    }

    #[test]
    fn test_same_job_spooled_twice_keeps_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();
        let first = spool.store("job-1", &sample_result()).unwrap();
        // Force a distinct timestamp suffix.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let second = spool.store("job-1", &sample_result()).unwrap();
        assert_ne!(first, second);
        assert_eq!(spool.list().unwrap().len(), 2);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();
        let path = spool.store("job-1", &sample_result()).unwrap();
        spool.delete(&path).unwrap();
        spool.delete(&path).unwrap();
        assert!(spool.list().unwrap().is_empty());
    }

    #[test]
    fn test_purge_removes_only_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();
        let old = spool.store("job-old", &sample_result()).unwrap();
        let fresh = spool.store("job-new", &sample_result()).unwrap();

        let past = std::time::SystemTime::now() - Duration::from_secs(8 * 24 * 3600);
        let file = std::fs::File::options().append(true).open(&old).unwrap();
        file.set_times(std::fs::FileTimes::new().set_modified(past))
            .unwrap();

        let removed = spool.purge(MAX_SPOOL_AGE).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_list_skips_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();
        spool.store("job-1", &sample_result()).unwrap();
        std::fs::write(dir.path().join("junk_123.json"), b"not json").unwrap();

        assert_eq!(spool.list().unwrap().len(), 1);
    }
}
