//! Policy document: versioned, expiring, Ed25519-signed capabilities.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid policy version: {0}")]
    InvalidVersion(u32),

    #[error("policy expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(#[from] base64::DecodeError),

    #[error("signature verification failed")]
    SignatureInvalid,
}

/// Agent execution policy.
///
/// `signature` is a detached Ed25519 signature (base64) over the canonical
/// JSON form of the policy with the signature field set to the empty
/// string. Canonical means: this struct's field order, serialized by
/// `serde_json` without whitespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub version: u32,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub signature: String,
    pub capabilities: Capabilities,
}

/// Gated abilities. A sub-capability is all-or-nothing: absent means the
/// whole ability is denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileCapability>,
}

/// Binary execution capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecCapability {
    pub enabled: bool,
    /// Allowed binary basenames (case-insensitive, extension-stripped on
    /// Windows).
    #[serde(default)]
    pub allowed_binaries: Vec<String>,
    /// Absolute-path glob patterns.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    pub max_execution_sec: u64,
}

/// Script execution capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptCapability {
    pub enabled: bool,
    /// Interpreter tokens from {powershell, bash, sh}.
    #[serde(default)]
    pub allowed_interpreters: Vec<String>,
    pub require_signature: bool,
    pub max_script_size_bytes: u64,
    pub max_execution_sec: u64,
}

/// File read/write capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCapability {
    #[serde(default)]
    pub read_paths: Vec<String>,
    #[serde(default)]
    pub write_paths: Vec<String>,
    pub max_file_size_bytes: u64,
}

impl Policy {
    /// Parse a policy from its JSON form.
    pub fn load(data: &[u8]) -> Result<Self, PolicyError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Check structural validity: version >= 1 and not expired.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.version < 1 {
            return Err(PolicyError::InvalidVersion(self.version));
        }
        if Utc::now() >= self.expires_at {
            return Err(PolicyError::Expired(self.expires_at));
        }
        Ok(())
    }

    /// Canonical bytes the hub signed: this policy with an empty signature
    /// field.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, PolicyError> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Verify the detached signature under the hub's public key.
    pub fn verify_signature(&self, hub_key: &VerifyingKey) -> Result<(), PolicyError> {
        let sig_bytes = BASE64.decode(&self.signature)?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| PolicyError::SignatureInvalid)?;
        let canonical = self.canonical_bytes()?;
        hub_key
            .verify(&canonical, &signature)
            .map_err(|_| PolicyError::SignatureInvalid)
    }

    /// Secure default policy used until the hub delivers a signed one.
    pub fn default_policy() -> Self {
        Self {
            version: 1,
            expires_at: Utc::now() + Duration::days(365),
            signature: String::new(),
            capabilities: Capabilities {
                exec: Some(ExecCapability {
                    enabled: true,
                    allowed_binaries: [
                        "ipconfig",
                        "whoami",
                        "systeminfo",
                        "hostname",
                        "uname",
                        "df",
                        "ip",
                        "ifconfig",
                        "netstat",
                        "system_profiler",
                        "scutil",
                    ]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                    allowed_paths: [
                        "C:\\Windows\\System32\\*",
                        "/usr/bin/*",
                        "/bin/*",
                        "/usr/sbin/*",
                        "/sbin/*",
                    ]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                    max_execution_sec: 300,
                }),
                script: Some(ScriptCapability {
                    enabled: true,
                    allowed_interpreters: ["powershell", "bash", "sh"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    require_signature: true,
                    max_script_size_bytes: 1_048_576,
                    max_execution_sec: 600,
                }),
                file: Some(FileCapability {
                    read_paths: [
                        "C:\\Logs\\*",
                        "C:\\ProgramData\\JTNT\\*",
                        "/var/log/*",
                        "/tmp/jtnt/*",
                        "/Library/Logs/*",
                    ]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                    write_paths: ["C:\\Temp\\JTNT\\*", "/tmp/jtnt/*", "/var/tmp/jtnt/*"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    max_file_size_bytes: 104_857_600,
                }),
            },
        }
    }
}
