//! Append-only audit log of signed event records.
//!
//! One JSON object per line in `audit-YYYY-MM-DD.log`. Each entry carries
//! a detached Ed25519 signature over the canonical field set; operators
//! verify entries offline against the agent's pinned public key. The
//! writer holds its lock across serialize-sign-append-fsync so entries
//! never interleave.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{NaiveDate, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to open audit log: {0}")]
    Open(#[source] std::io::Error),

    #[error("failed to write audit entry: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to encode audit entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(#[from] base64::DecodeError),

    #[error("invalid signature")]
    SignatureInvalid,
}

/// Privileged events recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    JobExecuted,
    PolicyChanged,
    CertRotated,
    #[allow(dead_code)] // Recorded by the updater flow.
    UpdateApplied,
    #[allow(dead_code)] // Recorded by enrollment tooling.
    Enrollment,
    PolicyViolation,
    Startup,
    Shutdown,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobExecuted => "job_executed",
            Self::PolicyChanged => "policy_changed",
            Self::CertRotated => "cert_rotated",
            Self::UpdateApplied => "update_applied",
            Self::Enrollment => "enrollment",
            Self::PolicyViolation => "policy_violation",
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit log entry as it appears on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// UTC, RFC 3339.
    pub timestamp: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub policy_version: u32,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    pub signature: String,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// Event-specific fields hoisted into an entry.
#[derive(Debug, Clone, Default)]
pub struct AuditRecord {
    pub job_id: String,
    pub command: String,
    pub status: String,
    pub user: String,
    pub policy_version: u32,
    pub details: serde_json::Value,
}

/// Canonical form signed and verified: every field of the entry except
/// the signature, in this exact order. Declaration order is the contract;
/// nothing is skipped even when empty.
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    timestamp: &'a str,
    #[serde(rename = "type")]
    record_type: &'a str,
    event: &'a str,
    agent_id: &'a str,
    job_id: &'a str,
    command: &'a str,
    status: &'a str,
    user: &'a str,
    policy_version: u32,
    details: &'a serde_json::Value,
}

fn canonical_bytes(entry: &AuditEntry) -> Result<Vec<u8>, AuditError> {
    Ok(serde_json::to_vec(&CanonicalEntry {
        timestamp: &entry.timestamp,
        record_type: &entry.record_type,
        event: &entry.event,
        agent_id: &entry.agent_id,
        job_id: &entry.job_id,
        command: &entry.command,
        status: &entry.status,
        user: &entry.user,
        policy_version: entry.policy_version,
        details: &entry.details,
    })?)
}

struct Inner {
    file: File,
    date: NaiveDate,
}

/// Signed audit logger with daily file rotation.
pub struct AuditLogger {
    dir: PathBuf,
    agent_id: String,
    signing: SigningKey,
    inner: Mutex<Inner>,
}

impl AuditLogger {
    pub fn new(dir: &Path, agent_id: &str, signing: SigningKey) -> Result<Self, AuditError> {
        std::fs::create_dir_all(dir).map_err(AuditError::Open)?;
        let date = Utc::now().date_naive();
        let file = open_log_file(dir, date)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            agent_id: agent_id.to_string(),
            signing,
            inner: Mutex::new(Inner { file, date }),
        })
    }

    /// Append a signed entry, rotating to a new dated file when the UTC
    /// day has changed since the last write.
    pub fn log(&self, event: AuditEvent, record: AuditRecord) -> Result<(), AuditError> {
        let mut entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            record_type: "audit".to_string(),
            event: event.as_str().to_string(),
            agent_id: self.agent_id.clone(),
            job_id: record.job_id,
            command: record.command,
            status: record.status,
            user: if record.user.is_empty() {
                "SYSTEM".to_string()
            } else {
                record.user
            },
            policy_version: record.policy_version,
            details: record.details,
            signature: String::new(),
        };

        let canonical = canonical_bytes(&entry)?;
        let signature = self.signing.sign(&canonical);
        entry.signature = BASE64.encode(signature.to_bytes());

        let line = serde_json::to_vec(&entry)?;

        let mut inner = self.inner.lock().unwrap();
        let today = Utc::now().date_naive();
        if today != inner.date {
            inner.file = open_log_file(&self.dir, today)?;
            inner.date = today;
        }
        inner.file.write_all(&line).map_err(AuditError::Write)?;
        inner.file.write_all(b"\n").map_err(AuditError::Write)?;
        inner.file.sync_all().map_err(AuditError::Write)
    }

    /// Force rotation to the current date's file.
    #[allow(dead_code)] // Driven by operator tooling.
    pub fn rotate(&self) -> Result<(), AuditError> {
        let mut inner = self.inner.lock().unwrap();
        let today = Utc::now().date_naive();
        inner.file = open_log_file(&self.dir, today)?;
        inner.date = today;
        Ok(())
    }

    pub fn log_job_execution(
        &self,
        job_id: &str,
        job_kind: &str,
        status: &str,
        command: &str,
        policy_version: u32,
    ) -> Result<(), AuditError> {
        self.log(
            AuditEvent::JobExecuted,
            AuditRecord {
                job_id: job_id.to_string(),
                command: command.to_string(),
                status: status.to_string(),
                policy_version,
                details: serde_json::json!({ "job_type": job_kind }),
                ..AuditRecord::default()
            },
        )
    }

    pub fn log_policy_violation(
        &self,
        violation_kind: &str,
        resource: &str,
        job_id: &str,
    ) -> Result<(), AuditError> {
        self.log(
            AuditEvent::PolicyViolation,
            AuditRecord {
                job_id: job_id.to_string(),
                details: serde_json::json!({
                    "violation_type": violation_kind,
                    "resource": resource,
                }),
                ..AuditRecord::default()
            },
        )
    }

    #[allow(dead_code)] // Recorded when the hub delivers a new policy.
    pub fn log_policy_change(&self, old_version: u32, new_version: u32) -> Result<(), AuditError> {
        self.log(
            AuditEvent::PolicyChanged,
            AuditRecord {
                policy_version: new_version,
                details: serde_json::json!({
                    "old_version": old_version,
                    "new_version": new_version,
                }),
                ..AuditRecord::default()
            },
        )
    }

    #[allow(dead_code)] // Recorded by hub-driven rotation.
    pub fn log_cert_rotation(&self, success: bool, reason: &str) -> Result<(), AuditError> {
        self.log(
            AuditEvent::CertRotated,
            AuditRecord {
                status: if success { "success" } else { "failed" }.to_string(),
                details: serde_json::json!({ "reason": reason }),
                ..AuditRecord::default()
            },
        )
    }
}

fn open_log_file(dir: &Path, date: NaiveDate) -> Result<File, AuditError> {
    let path = dir.join(format!("audit-{}.log", date.format("%Y-%m-%d")));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(AuditError::Open)?;
    set_owner_only(&path).map_err(AuditError::Open)?;
    Ok(file)
}

/// Verify a loaded entry against the agent's public key. Used offline by
/// operators.
#[allow(dead_code)] // Operator-side verification entry point.
pub fn verify_entry(entry: &AuditEntry, public_key: &VerifyingKey) -> Result<(), AuditError> {
    let sig_bytes = BASE64.decode(&entry.signature)?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| AuditError::SignatureInvalid)?;
    let canonical = canonical_bytes(entry)?;
    public_key
        .verify(&canonical, &signature)
        .map_err(|_| AuditError::SignatureInvalid)
}

/// Delete audit files older than the retention window.
pub fn cleanup_old_logs(dir: &Path, retention_days: i64) -> std::io::Result<()> {
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(retention_days as u64 * 24 * 3600);
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if modified < cutoff {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
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
    use jtnt_common::keys::KeyPair;

    fn logger(dir: &Path) -> (AuditLogger, VerifyingKey) {
        let pair = KeyPair::generate();
        let public = pair.verifying_key();
        let logger = AuditLogger::new(dir, "agent-test", pair.signing_key().clone()).unwrap();
        (logger, public)
    }

    fn read_entries(dir: &Path) -> Vec<AuditEntry> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            for line in content.lines() {
                entries.push(serde_json::from_str(line).unwrap());
            }
        }
        entries
    }

    #[test]
    fn test_entries_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, _) = logger(dir.path());

        logger
            .log(AuditEvent::Startup, AuditRecord::default())
            .unwrap();
        logger
            .log_job_execution("job-1", "exec", "success", "echo hello", 1)
            .unwrap();

        let entries = read_entries(dir.path());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "startup");
        assert_eq!(entries[1].event, "job_executed");
        assert_eq!(entries[1].job_id, "job-1");
        assert_eq!(entries[1].command, "echo hello");
        assert_eq!(entries[1].user, "SYSTEM");
    }

    #[test]
    fn test_signature_verifies_offline() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, public) = logger(dir.path());
        logger
            .log_policy_violation("binary_not_allowed", "/bin/rm", "job-9")
            .unwrap();

        let entries = read_entries(dir.path());
        assert_eq!(entries.len(), 1);
        assert!(verify_entry(&entries[0], &public).is_ok());
    }

    #[test]
    fn test_tampered_entry_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, public) = logger(dir.path());
        logger
            .log_job_execution("job-1", "exec", "success", "uname", 2)
            .unwrap();

        let mut entries = read_entries(dir.path());
        entries[0].status = "error".to_string();
        assert!(matches!(
            verify_entry(&entries[0], &public),
            Err(AuditError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_verification_fails_under_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, _) = logger(dir.path());
        logger
            .log(AuditEvent::Shutdown, AuditRecord::default())
            .unwrap();

        let other = KeyPair::generate();
        let entries = read_entries(dir.path());
        assert!(verify_entry(&entries[0], &other.verifying_key()).is_err());
    }

    #[test]
    fn test_file_named_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, _) = logger(dir.path());
        logger
            .log(AuditEvent::Startup, AuditRecord::default())
            .unwrap();

        let expected = format!("audit-{}.log", Utc::now().date_naive().format("%Y-%m-%d"));
        assert!(dir.path().join(expected).exists());
    }

    #[test]
    fn test_cleanup_removes_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("audit-2020-01-01.log");
        std::fs::write(&old, b"{}\n").unwrap();
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(120 * 24 * 3600);
        let file = std::fs::File::options().append(true).open(&old).unwrap();
        file.set_times(std::fs::FileTimes::new().set_modified(past))
            .unwrap();

        cleanup_old_logs(dir.path(), 90).unwrap();
        assert!(!old.exists());
    }

    #[test]
    fn test_policy_change_entry_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, public) = logger(dir.path());
        logger.log_policy_change(1, 2).unwrap();

        let entries = read_entries(dir.path());
        assert_eq!(entries[0].event, "policy_changed");
        assert_eq!(entries[0].policy_version, 2);
        assert_eq!(entries[0].details["old_version"], 1);
        assert!(verify_entry(&entries[0], &public).is_ok());
    }
}
