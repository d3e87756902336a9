//! Script execution handler.
//!
//! The script body arrives base64-encoded with an optional detached
//! Ed25519 signature. After the policy check (and signature verification
//! when the policy demands one) the body is written to a uniquely-named
//! temporary file with owner-only permissions and an interpreter-matched
//! extension, then executed as `<interpreter> <path>`. The temporary file
//! is removed on every exit path.

use super::{JobExecutor, run_command};
use crate::jobs::result::{error_result, format_result, parse_payload};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use jtnt_common::types::{Job, JobResult, ScriptPayload};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub(crate) async fn run(executor: &JobExecutor, job: &Job, cancel: &CancellationToken) -> JobResult {
    let started_at = Utc::now();

    let payload: ScriptPayload = match parse_payload(&job.payload) {
        Ok(payload) => payload,
        Err(err) => return error_result(executor.agent_id(), started_at, err),
    };

    let script_bytes = match BASE64.decode(&payload.script_content) {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_result(
                executor.agent_id(),
                started_at,
                format!("invalid script encoding: {err}"),
            );
        }
    };

    let timeout_sec = executor.effective_timeout(
        payload.timeout_sec,
        job,
        executor.enforcer().max_script_timeout_sec(),
    );

    let has_signature = !payload.script_signature.is_empty();
    if let Err(violation) = executor.enforcer().can_execute_script(
        &payload.interpreter,
        script_bytes.len() as u64,
        has_signature,
        timeout_sec,
    ) {
        return executor.deny(job, &violation, &payload.interpreter, started_at);
    }

    if has_signature {
        let Some(hub_key) = executor.hub_key() else {
            return error_result(
                executor.agent_id(),
                started_at,
                "signature verification failed: no hub public key installed",
            );
        };
        if let Err(err) = verify_script_signature(hub_key, &script_bytes, &payload.script_signature)
        {
            return error_result(
                executor.agent_id(),
                started_at,
                format!("signature verification failed: {err}"),
            );
        }
    }

    // The NamedTempFile guard deletes the script on every exit path.
    let script_file = match write_temp_script(&script_bytes, &payload.interpreter) {
        Ok(file) => file,
        Err(err) => {
            return error_result(
                executor.agent_id(),
                started_at,
                format!("failed to create script file: {err}"),
            );
        }
    };

    let mut cmd = match interpreter_command(&payload.interpreter, script_file.path()) {
        Ok(cmd) => cmd,
        Err(err) => return error_result(executor.agent_id(), started_at, err),
    };
    for (key, value) in &payload.env_vars {
        cmd.env(key, value);
    }

    let outcome = run_command(cmd, Duration::from_secs(timeout_sec), cancel).await;

    format_result(
        executor.agent_id(),
        outcome.status,
        started_at,
        Utc::now(),
        outcome.exit_code,
        Some(&outcome.stdout),
        Some(&outcome.stderr),
        outcome.error,
        Vec::new(),
    )
}

fn verify_script_signature(
    hub_key: &VerifyingKey,
    script: &[u8],
    signature_b64: &str,
) -> Result<(), String> {
    let sig_bytes = BASE64
        .decode(signature_b64)
        .map_err(|err| format!("invalid signature encoding: {err}"))?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| "malformed signature".to_string())?;
    hub_key
        .verify(script, &signature)
        .map_err(|_| "signature mismatch".to_string())
}

fn write_temp_script(content: &[u8], interpreter: &str) -> std::io::Result<NamedTempFile> {
    let ext = match interpreter {
        "powershell" => ".ps1",
        _ => ".sh",
    };
    let file = tempfile::Builder::new()
        .prefix("jtnt-script-")
        .suffix(ext)
        .tempfile()?;
    std::fs::write(file.path(), content)?;
    set_owner_exec_only(file.path())?;
    Ok(file)
}

fn interpreter_command(interpreter: &str, script_path: &std::path::Path) -> Result<Command, String> {
    let mut cmd = match interpreter {
        "powershell" => {
            let mut cmd = Command::new("powershell");
            cmd.arg("-ExecutionPolicy").arg("Bypass").arg("-File");
            cmd
        }
        "bash" => Command::new("bash"),
        "sh" => Command::new("sh"),
        other => return Err(format!("unsupported interpreter: {other}")),
    };
    cmd.arg(script_path);
    Ok(cmd)
}

#[cfg(unix)]
fn set_owner_exec_only(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_owner_exec_only(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobExecutor;
    use crate::jobs::tests::{test_executor, test_policy};
    use crate::audit::AuditLogger;
    use crate::metrics::Metrics;
    use ed25519_dalek::Signer;
    use jtnt_common::keys::KeyPair;
    use jtnt_common::policy::Enforcer;
    use jtnt_common::transport::HubClient;
    use jtnt_common::types::{JobKind, JobStatus};
    use std::sync::Arc;

    /// Serializes tests that create or count temp script files, so the
    /// count assertions cannot race a sibling test's transient file.
    fn temp_lock() -> &'static tokio::sync::Mutex<()> {
        static LOCK: std::sync::OnceLock<tokio::sync::Mutex<()>> = std::sync::OnceLock::new();
        LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
    }

    fn script_job(payload: serde_json::Value) -> Job {
        Job {
            job_id: "job-script".to_string(),
            kind: JobKind::Script,
            created_at: None,
            timeout_sec: 10,
            payload,
        }
    }

    fn count_temp_scripts() -> usize {
        std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("jtnt-script-")
            })
            .count()
    }

    #[tokio::test]
    async fn test_script_runs_with_env() {
        let _guard = temp_lock().lock().await;
        let dir = tempfile::tempdir().unwrap();
        let executor = test_executor(dir.path(), test_policy());

        let body = BASE64.encode(b"echo \"greeting=$GREETING\"\n");
        let job = script_job(serde_json::json!({
            "interpreter": "sh",
            "script_content": body,
            "env_vars": {"GREETING": "hello"}
        }));
        let result = run(&executor, &job, &CancellationToken::new()).await;

        assert_eq!(result.status, JobStatus::Success);
        let decoded = BASE64.decode(&result.stdout_tail).unwrap();
        assert!(String::from_utf8_lossy(&decoded).contains("greeting=hello"));
    }

    #[tokio::test]
    async fn test_signature_required_but_missing() {
        let _guard = temp_lock().lock().await;
        let dir = tempfile::tempdir().unwrap();
        let mut policy = test_policy();
        policy.capabilities.script.as_mut().unwrap().require_signature = true;
        let executor = test_executor(dir.path(), policy);

        let before = count_temp_scripts();
        let job = script_job(serde_json::json!({
            "interpreter": "sh",
            "script_content": BASE64.encode(b"echo hi\n"),
        }));
        let result = run(&executor, &job, &CancellationToken::new()).await;

        assert_eq!(result.status, JobStatus::Error);
        assert!(result.error_message.contains("signature required"));
        // No temp script may remain on disk.
        assert_eq!(count_temp_scripts(), before);
    }

    #[tokio::test]
    async fn test_valid_signature_accepted() {
        let _guard = temp_lock().lock().await;
        let dir = tempfile::tempdir().unwrap();
        let hub_pair = KeyPair::generate();
        let agent_pair = KeyPair::generate();

        let mut policy = test_policy();
        policy.capabilities.script.as_mut().unwrap().require_signature = true;

        let audit =
            AuditLogger::new(dir.path(), "agent-test", agent_pair.signing_key().clone()).unwrap();
        let executor = JobExecutor::new(
            "agent-test".to_string(),
            Arc::new(Enforcer::new(policy).unwrap()),
            Arc::new(HubClient::new("https://hub.invalid", None).unwrap()),
            Some(hub_pair.verifying_key()),
            Arc::new(audit),
            Arc::new(Metrics::new()),
        );

        let script = b"echo signed\n";
        let signature = hub_pair.signing_key().sign(script);
        let job = script_job(serde_json::json!({
            "interpreter": "sh",
            "script_content": BASE64.encode(script),
            "script_signature": BASE64.encode(signature.to_bytes()),
        }));
        let result = run(&executor, &job, &CancellationToken::new()).await;
        assert_eq!(result.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_forged_signature_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hub_pair = KeyPair::generate();
        let forger = KeyPair::generate();
        let agent_pair = KeyPair::generate();

        let audit =
            AuditLogger::new(dir.path(), "agent-test", agent_pair.signing_key().clone()).unwrap();
        let executor = JobExecutor::new(
            "agent-test".to_string(),
            Arc::new(Enforcer::new(test_policy()).unwrap()),
            Arc::new(HubClient::new("https://hub.invalid", None).unwrap()),
            Some(hub_pair.verifying_key()),
            Arc::new(audit),
            Arc::new(Metrics::new()),
        );

        let script = b"echo forged\n";
        let signature = forger.signing_key().sign(script);
        let job = script_job(serde_json::json!({
            "interpreter": "sh",
            "script_content": BASE64.encode(script),
            "script_signature": BASE64.encode(signature.to_bytes()),
        }));
        let result = run(&executor, &job, &CancellationToken::new()).await;
        assert_eq!(result.status, JobStatus::Error);
        assert!(result.error_message.contains("signature"));
    }

    #[tokio::test]
    async fn test_interpreter_not_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let executor = test_executor(dir.path(), test_policy());

        let job = script_job(serde_json::json!({
            "interpreter": "python",
            "script_content": BASE64.encode(b"print('no')"),
        }));
        let result = run(&executor, &job, &CancellationToken::new()).await;
        assert_eq!(result.status, JobStatus::Error);
        assert!(result.error_message.contains("interpreter not allowed"));
    }

    #[tokio::test]
    async fn test_oversized_script_denied() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = test_policy();
        policy
            .capabilities
            .script
            .as_mut()
            .unwrap()
            .max_script_size_bytes = 16;
        let executor = test_executor(dir.path(), policy);

        let job = script_job(serde_json::json!({
            "interpreter": "sh",
            "script_content": BASE64.encode(vec![b'#'; 64]),
        }));
        let result = run(&executor, &job, &CancellationToken::new()).await;
        assert_eq!(result.status, JobStatus::Error);
        assert!(result.error_message.contains("file size exceeds"));
    }

    #[tokio::test]
    async fn test_temp_script_removed_after_run() {
        let _guard = temp_lock().lock().await;
        let dir = tempfile::tempdir().unwrap();
        let executor = test_executor(dir.path(), test_policy());

        let before = count_temp_scripts();
        let job = script_job(serde_json::json!({
            "interpreter": "sh",
            "script_content": BASE64.encode(b"echo done\n"),
        }));
        let _ = run(&executor, &job, &CancellationToken::new()).await;
        assert_eq!(count_temp_scripts(), before);
    }

    #[test]
    fn test_temp_script_permissions() {
        let _guard = temp_lock().blocking_lock();
        let file = write_temp_script(b"echo x\n", "sh").unwrap();
        assert!(file.path().to_string_lossy().ends_with(".sh"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_powershell_invocation_shape() {
        let cmd = interpreter_command("powershell", std::path::Path::new("/tmp/x.ps1")).unwrap();
        let std_cmd = cmd.as_std();
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy()).collect();
        assert_eq!(args[0], "-ExecutionPolicy");
        assert_eq!(args[1], "Bypass");
        assert_eq!(args[2], "-File");
    }
}
