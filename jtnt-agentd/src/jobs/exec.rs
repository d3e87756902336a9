//! Binary execution handler.
//!
//! Runs an allowlisted binary directly, never through a shell. Output is
//! tail-captured, the deadline is the payload/job/policy ceiling, and a
//! policy denial becomes an error result plus an audit entry.

use super::{JobExecutor, run_command};
use crate::jobs::result::{error_result, format_result, parse_payload};
use chrono::Utc;
use jtnt_common::types::{ExecPayload, Job, JobResult};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub(crate) async fn run(executor: &JobExecutor, job: &Job, cancel: &CancellationToken) -> JobResult {
    let started_at = Utc::now();

    let payload: ExecPayload = match parse_payload(&job.payload) {
        Ok(payload) => payload,
        Err(err) => return error_result(executor.agent_id(), started_at, err),
    };

    let timeout_sec = executor.effective_timeout(
        payload.timeout_sec,
        job,
        executor.enforcer().max_exec_timeout_sec(),
    );

    if let Err(violation) = executor
        .enforcer()
        .can_execute_binary(&payload.binary, timeout_sec)
    {
        return executor.deny(job, &violation, &payload.binary, started_at);
    }

    let mut cmd = Command::new(&payload.binary);
    cmd.args(&payload.args);
    if !payload.working_dir.is_empty() {
        cmd.current_dir(&payload.working_dir);
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
