//! Job execution: fetch, dispatch by kind, run under policy, report.
//!
//! Dispatch is a plain match on the job kind; each handler parses its
//! typed payload from the wire payload, consults the enforcer before any
//! privileged step, and produces the common result envelope.

mod download;
mod exec;
pub mod result;
mod script;
mod upload;

use crate::audit::AuditLogger;
use crate::metrics::Metrics;
use ed25519_dalek::VerifyingKey;
use jtnt_common::policy::{Enforcer, PolicyViolation};
use jtnt_common::transport::{HubClient, TransportError};
use jtnt_common::types::{Job, JobKind, JobResult, JobStatus};
use result::{TailBuffer, error_result};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Orchestrates job execution against the current policy.
pub struct JobExecutor {
    agent_id: String,
    enforcer: Arc<Enforcer>,
    client: Arc<HubClient>,
    hub_key: Option<VerifyingKey>,
    audit: Arc<AuditLogger>,
    metrics: Arc<Metrics>,
}

impl JobExecutor {
    pub fn new(
        agent_id: String,
        enforcer: Arc<Enforcer>,
        client: Arc<HubClient>,
        hub_key: Option<VerifyingKey>,
        audit: Arc<AuditLogger>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            agent_id,
            enforcer,
            client,
            hub_key,
            audit,
            metrics,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn enforcer(&self) -> &Enforcer {
        &self.enforcer
    }

    pub(crate) fn client(&self) -> &HubClient {
        &self.client
    }

    pub(crate) fn hub_key(&self) -> Option<&VerifyingKey> {
        self.hub_key.as_ref()
    }

    /// Execute `job`, appending the `job_executed` audit entry before
    /// returning. Cancelling `cancel` kills any running child process and
    /// yields a `timeout` result.
    pub async fn execute(&self, job: &Job, cancel: &CancellationToken) -> JobResult {
        info!(job_id = %job.job_id, kind = %job.kind, "executing job");

        let result = match job.kind {
            JobKind::Exec => exec::run(self, job, cancel).await,
            JobKind::Script => script::run(self, job, cancel).await,
            JobKind::Download => download::run(self, job).await,
            JobKind::Upload => upload::run(self, job).await,
        };

        Metrics::incr(&self.metrics.jobs_executed);
        match result.status {
            JobStatus::Error => Metrics::incr(&self.metrics.jobs_failed),
            JobStatus::Timeout => Metrics::incr(&self.metrics.jobs_timed_out),
            JobStatus::Success => {}
        }

        if let Err(err) = self.audit.log_job_execution(
            &job.job_id,
            &job.kind.to_string(),
            &result.status.to_string(),
            &job_command_summary(job),
            self.enforcer.policy().version,
        ) {
            warn!(job_id = %job.job_id, error = %err, "failed to append audit entry");
        }

        result
    }

    /// Fetch the next pending job; `None` when the hub has nothing.
    pub async fn fetch_next(&self) -> Result<Option<Job>, TransportError> {
        match self.client.get("/api/v1/agent/jobs/next").await {
            Ok(data) => {
                let job: Job = serde_json::from_slice(&data).map_err(|err| {
                    TransportError::Client {
                        status: 200,
                        body: format!("failed to parse job: {err}"),
                    }
                })?;
                Ok(Some(job))
            }
            Err(TransportError::NoContent) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Report a result to the hub.
    pub async fn report(&self, job_id: &str, result: &JobResult) -> Result<(), TransportError> {
        let path = format!("/api/v1/agent/jobs/{job_id}/result");
        self.client.post(&path, result).await.map(|_| ())
    }

    /// Convert a policy denial into an error result, recording the
    /// violation in the audit log first.
    pub(crate) fn deny(
        &self,
        job: &Job,
        violation: &PolicyViolation,
        resource: &str,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> JobResult {
        Metrics::incr(&self.metrics.policy_violations);
        if let Err(err) = self
            .audit
            .log_policy_violation(violation.kind(), resource, &job.job_id)
        {
            warn!(job_id = %job.job_id, error = %err, "failed to audit policy violation");
        }
        error_result(
            &self.agent_id,
            started_at,
            format!("policy violation: {violation}"),
        )
    }

    /// Timeout ceiling for a job: payload value, then the job envelope,
    /// then the policy default.
    pub(crate) fn effective_timeout(
        &self,
        payload_timeout_sec: u64,
        job: &Job,
        policy_default_sec: u64,
    ) -> u64 {
        if payload_timeout_sec > 0 {
            payload_timeout_sec
        } else if job.timeout_sec > 0 {
            job.timeout_sec
        } else {
            policy_default_sec
        }
    }
}

/// One-line command summary for audit entries.
fn job_command_summary(job: &Job) -> String {
    match job.kind {
        JobKind::Exec => job
            .payload
            .get("binary")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        JobKind::Script => job
            .payload
            .get("interpreter")
            .and_then(|v| v.as_str())
            .map(|i| format!("{i} <script>"))
            .unwrap_or_default(),
        JobKind::Download => job
            .payload
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        JobKind::Upload => job
            .payload
            .get("source_path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
    }
}

/// Outcome of running a child process to completion or its deadline.
pub(crate) struct ChildOutcome {
    pub status: JobStatus,
    pub exit_code: i32,
    pub stdout: TailBuffer,
    pub stderr: TailBuffer,
    pub error: Option<String>,
}

/// Spawn `cmd` with tail-captured output and await it under `timeout`.
///
/// The child is spawned without a shell. On deadline or cancellation the
/// child is killed and the outcome is `timeout`; failure to launch yields
/// `error` with exit code -1.
pub(crate) async fn run_command(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ChildOutcome {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return ChildOutcome {
                status: JobStatus::Error,
                exit_code: -1,
                stdout: TailBuffer::default(),
                stderr: TailBuffer::default(),
                error: Some(format!("failed to launch: {err}")),
            };
        }
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut tail = TailBuffer::default();
        if let Some(pipe) = stdout_pipe.as_mut() {
            tail.capture(pipe).await;
        }
        tail
    });
    let stderr_task = tokio::spawn(async move {
        let mut tail = TailBuffer::default();
        if let Some(pipe) = stderr_pipe.as_mut() {
            tail.capture(pipe).await;
        }
        tail
    });

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(timeout) => None,
        _ = cancel.cancelled() => None,
    };

    let (status, exit_code, error) = match waited {
        Some(Ok(exit)) => {
            let code = exit.code().unwrap_or(-1);
            // Non-zero exit is still success: the command ran.
            let error = (code != 0).then(|| format!("exit status {code}"));
            (JobStatus::Success, code, error)
        }
        Some(Err(err)) => (
            JobStatus::Error,
            -1,
            Some(format!("failed to await child: {err}")),
        ),
        None => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            (
                JobStatus::Timeout,
                -1,
                Some("execution deadline exceeded".to_string()),
            )
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    ChildOutcome {
        status,
        exit_code,
        stdout,
        stderr,
        error,
    }
}
