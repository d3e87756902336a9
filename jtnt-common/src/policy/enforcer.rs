//! Policy enforcement: the gate in front of every privileged action.

use crate::policy::allowlist::{Allowlist, allows_binary, validate_path};
use crate::policy::model::Policy;
use thiserror::Error;

/// Default exec timeout ceiling when the capability is absent.
const DEFAULT_MAX_EXEC_SEC: u64 = 300;

/// Default script timeout ceiling when the capability is absent.
const DEFAULT_MAX_SCRIPT_SEC: u64 = 600;

/// Typed denial reasons.
///
/// Closed enum: every caller must either handle the denial or convert it
/// to a job result with status `error` (plus a policy-violation audit
/// entry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("capability disabled")]
    CapabilityDisabled,

    #[error("binary not allowed: {0}")]
    BinaryNotAllowed(String),

    #[error("path not allowed: {0}")]
    PathNotAllowed(String),

    #[error("interpreter not allowed: {0}")]
    InterpreterNotAllowed(String),

    #[error("script signature required")]
    SignatureRequired,

    #[error("file size exceeds policy limit: {size} > {limit}")]
    FileSizeExceeded { size: u64, limit: u64 },

    #[error("path traversal detected: {0}")]
    PathTraversal(String),

    #[error("timeout exceeds policy maximum: {requested} > {limit}")]
    TimeoutExceeded { requested: u64, limit: u64 },
}

impl PolicyViolation {
    /// Stable identifier recorded in policy-violation audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CapabilityDisabled => "capability_disabled",
            Self::BinaryNotAllowed(_) => "binary_not_allowed",
            Self::PathNotAllowed(_) => "path_not_allowed",
            Self::InterpreterNotAllowed(_) => "interpreter_not_allowed",
            Self::SignatureRequired => "signature_required",
            Self::FileSizeExceeded { .. } => "file_size_exceeded",
            Self::PathTraversal(_) => "path_traversal",
            Self::TimeoutExceeded { .. } => "timeout_exceeded",
        }
    }
}

/// Enforcer over a validated policy.
pub struct Enforcer {
    policy: Policy,
}

impl Enforcer {
    /// Wrap a policy, rejecting documents that fail structural validation.
    pub fn new(policy: Policy) -> Result<Self, crate::policy::model::PolicyError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// May `binary` be executed with a `requested_timeout_sec` ceiling?
    ///
    /// Allowed when the basename matches an allowed-binary entry or the
    /// full path matches an allowed-path glob.
    pub fn can_execute_binary(
        &self,
        binary: &str,
        requested_timeout_sec: u64,
    ) -> Result<(), PolicyViolation> {
        let exec = self
            .policy
            .capabilities
            .exec
            .as_ref()
            .filter(|c| c.enabled)
            .ok_or(PolicyViolation::CapabilityDisabled)?;

        if !allows_binary(&exec.allowed_binaries, binary)
            && !Allowlist::new(&exec.allowed_paths).allows(binary)
        {
            return Err(PolicyViolation::BinaryNotAllowed(binary.to_string()));
        }

        if requested_timeout_sec > exec.max_execution_sec {
            return Err(PolicyViolation::TimeoutExceeded {
                requested: requested_timeout_sec,
                limit: exec.max_execution_sec,
            });
        }

        Ok(())
    }

    /// May a script run under `interpreter` with the given size, signature
    /// presence, and timeout?
    pub fn can_execute_script(
        &self,
        interpreter: &str,
        script_size: u64,
        has_signature: bool,
        requested_timeout_sec: u64,
    ) -> Result<(), PolicyViolation> {
        let script = self
            .policy
            .capabilities
            .script
            .as_ref()
            .filter(|c| c.enabled)
            .ok_or(PolicyViolation::CapabilityDisabled)?;

        if !script
            .allowed_interpreters
            .iter()
            .any(|allowed| allowed == interpreter)
        {
            return Err(PolicyViolation::InterpreterNotAllowed(
                interpreter.to_string(),
            ));
        }

        if script.require_signature && !has_signature {
            return Err(PolicyViolation::SignatureRequired);
        }

        if script_size > script.max_script_size_bytes {
            return Err(PolicyViolation::FileSizeExceeded {
                size: script_size,
                limit: script.max_script_size_bytes,
            });
        }

        if requested_timeout_sec > script.max_execution_sec {
            return Err(PolicyViolation::TimeoutExceeded {
                requested: requested_timeout_sec,
                limit: script.max_execution_sec,
            });
        }

        Ok(())
    }

    /// May `path` be read?
    pub fn can_read_file(&self, path: &str) -> Result<(), PolicyViolation> {
        let file = self
            .policy
            .capabilities
            .file
            .as_ref()
            .ok_or(PolicyViolation::CapabilityDisabled)?;

        validate_path(path)?;

        if !Allowlist::new(&file.read_paths).allows(path) {
            return Err(PolicyViolation::PathNotAllowed(path.to_string()));
        }

        Ok(())
    }

    /// May `size` bytes be written to `path`?
    pub fn can_write_file(&self, path: &str, size: u64) -> Result<(), PolicyViolation> {
        let file = self
            .policy
            .capabilities
            .file
            .as_ref()
            .ok_or(PolicyViolation::CapabilityDisabled)?;

        validate_path(path)?;

        if !Allowlist::new(&file.write_paths).allows(path) {
            return Err(PolicyViolation::PathNotAllowed(path.to_string()));
        }

        if size > file.max_file_size_bytes {
            return Err(PolicyViolation::FileSizeExceeded {
                size,
                limit: file.max_file_size_bytes,
            });
        }

        Ok(())
    }

    /// Exec timeout ceiling applied when neither payload nor job carries one.
    pub fn max_exec_timeout_sec(&self) -> u64 {
        self.policy
            .capabilities
            .exec
            .as_ref()
            .map(|c| c.max_execution_sec)
            .unwrap_or(DEFAULT_MAX_EXEC_SEC)
    }

    /// Script timeout ceiling applied when neither payload nor job carries
    /// one.
    pub fn max_script_timeout_sec(&self) -> u64 {
        self.policy
            .capabilities
            .script
            .as_ref()
            .map(|c| c.max_execution_sec)
            .unwrap_or(DEFAULT_MAX_SCRIPT_SEC)
    }

    /// Upload size ceiling from the file capability.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.policy
            .capabilities
            .file
            .as_ref()
            .map(|c| c.max_file_size_bytes)
            .unwrap_or(0)
    }
}
