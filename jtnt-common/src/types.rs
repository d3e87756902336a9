//! Wire API types exchanged between the agent and the hub.
//!
//! All request/response bodies are JSON over HTTPS. Field names follow the
//! hub contract exactly; breaking changes here require a hub release.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Enrollment request sent once, before the agent holds a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    /// One-time enrollment token issued by an operator.
    pub token: String,
    pub hostname: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    pub arch: String,
    pub version: String,
    pub agent_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Base64-encoded Ed25519 public key; the hub pins this for the agent's
    /// lifetime and verifies audit entries against it.
    pub public_key: String,
}

/// Enrollment response carrying the agent's durable identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub agent_id: String,
    pub agent_token: String,
    pub hub_base_url: String,
    pub poll_interval_sec: u64,
    #[serde(rename = "heartbeat_interval_sec")]
    pub heartbeat_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<serde_json::Value>,
}

/// Periodic heartbeat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub sysinfo: SystemInfo,
    /// Set to "shutting_down" on the terminal heartbeat; absent otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    #[serde(default)]
    pub next_heartbeat_sec: u64,
}

/// Host telemetry snapshot carried in heartbeats.
///
/// Every field except `hostname` is best-effort: collectors leave the zero
/// value or "unknown" when the underlying source is unavailable (common in
/// containers).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub os_version: String,
    pub arch: String,
    /// Seconds since boot.
    pub uptime: u64,
    pub cpu_count: u32,
    /// Aggregate CPU utilization percentage (0-100).
    pub cpu_usage: f64,
    pub mem_total: u64,
    pub mem_used: u64,
    pub disk_total: u64,
    pub disk_used: u64,
    /// Non-loopback IPv4 addresses.
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Kind of work item delivered by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Exec,
    Script,
    Download,
    Upload,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::Script => write!(f, "script"),
            Self::Download => write!(f, "download"),
            Self::Upload => write!(f, "upload"),
        }
    }
}

/// A unit of work owned by the agent for one execute-and-report cycle.
///
/// `kind` determines the payload schema; payloads are parsed into their
/// typed form by the job handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Per-job timeout ceiling in seconds; 0 means "use the policy default".
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Typed payload for `exec` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPayload {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub working_dir: String,
}

/// Typed payload for `script` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptPayload {
    pub interpreter: String,
    /// Base64-encoded script body.
    pub script_content: String,
    /// Base64-encoded detached Ed25519 signature over the raw script bytes.
    #[serde(default)]
    pub script_signature: String,
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// Typed payload for `download` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadPayload {
    pub url: String,
    pub dest_path: String,
    /// Expected hex SHA-256 of the downloaded bytes; empty skips the check.
    #[serde(default)]
    pub sha256: String,
}

/// Typed payload for `upload` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPayload {
    pub source_path: String,
    #[serde(default)]
    pub max_size_bytes: u64,
}

/// Outcome classification of a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The command ran to completion (its exit code may still be non-zero).
    Success,
    /// The operation could not run or was denied.
    Error,
    /// The derived deadline fired before completion.
    Timeout,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Structured outcome of a job execution, reported to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub agent_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub exit_code: i32,
    /// Base64-encoded tail (last 10 KiB) of child stdout.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout_tail: String,
    /// Base64-encoded tail (last 10 KiB) of child stderr.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr_tail: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactInfo>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Metadata for a file uploaded by the upload handler.
///
/// Invariant: `sha256` covers exactly `size` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

/// Presigned upload destination returned by `/artifacts/init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadUrl {
    pub name: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInitRequest {
    pub job_id: String,
    pub files: Vec<ArtifactInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInitResponse {
    pub upload_urls: Vec<UploadUrl>,
}

/// Error body returned by the hub on failed requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_kind_wire_names() {
        let job: Job = serde_json::from_str(
            r#"{"job_id":"j-1","type":"exec","timeout_sec":5,"payload":{"binary":"echo"}}"#,
        )
        .unwrap();
        assert_eq!(job.kind, JobKind::Exec);
        assert_eq!(job.timeout_sec, 5);

        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains(r#""type":"exec""#));
    }

    #[test]
    fn test_payload_parses_with_defaults() {
        let payload: ExecPayload = serde_json::from_value(serde_json::json!({
            "binary": "uname"
        }))
        .unwrap();
        assert_eq!(payload.binary, "uname");
        assert!(payload.args.is_empty());
        assert_eq!(payload.timeout_sec, 0);
        assert!(payload.working_dir.is_empty());
    }

    #[test]
    fn test_result_omits_empty_fields() {
        let result = JobResult {
            agent_id: "agent-1".to_string(),
            status: JobStatus::Success,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            exit_code: 0,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            error_message: String::new(),
            artifacts: Vec::new(),
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("stdout_tail"));
        assert!(!json.contains("error_message"));
        assert!(!json.contains("artifacts"));
        assert!(json.contains(r#""status":"success""#));
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Timeout).unwrap(),
            r#""timeout""#
        );
        assert_eq!(JobStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_heartbeat_status_absent_by_default() {
        let req = HeartbeatRequest {
            agent_id: "agent-1".to_string(),
            timestamp: Utc::now(),
            sysinfo: SystemInfo::default(),
            status: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains(r#""status""#));
    }
}
