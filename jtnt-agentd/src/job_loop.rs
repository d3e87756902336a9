//! Job loop: the fetch-execute-report state machine.
//!
//! One tick: flush the spool when its cadence is due, poll for a job,
//! execute it under a derived deadline, report the result (spooling on
//! failure). The tick interval resets to the default after a clean cycle
//! and doubles, up to a ceiling, after an error. At most one job executes
//! at a time.

use crate::agent::Agent;
use crate::metrics::Metrics;
use crate::spool::{self, MAX_SPOOL_AGE};
use anyhow::{Context as _, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CACHE_UPLOAD_INTERVAL: Duration = Duration::from_secs(5 * 60);
const ERROR_BACKOFF_MULTIPLIER: f64 = 2.0;
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(5 * 60);

pub async fn run(agent: Arc<Agent>, mut shutdown: watch::Receiver<bool>) {
    let poll_interval = configured_poll_interval(&agent);
    let mut interval = poll_interval;
    let mut error_backoff = MIN_POLL_INTERVAL;
    let mut last_flush = Instant::now();

    info!(interval_sec = interval.as_secs(), "job loop started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        if *shutdown.borrow() {
            info!("job loop stopped");
            return;
        }

        if last_flush.elapsed() >= CACHE_UPLOAD_INTERVAL {
            flush_spool(&agent).await;
            last_flush = Instant::now();
        }

        match process_next_job(&agent).await {
            Ok(()) => {
                error_backoff = MIN_POLL_INTERVAL;
                interval = poll_interval;
            }
            Err(err) => {
                warn!(error = %err, "job processing error");
                error_backoff = Duration::from_secs_f64(
                    (error_backoff.as_secs_f64() * ERROR_BACKOFF_MULTIPLIER)
                        .min(MAX_ERROR_BACKOFF.as_secs_f64()),
                );
                interval = error_backoff;
                debug!(next_poll_sec = interval.as_secs(), "applying error backoff");
            }
        }
    }
}

/// Fetch and run a single job, reporting or spooling its result.
///
/// Once this returns, the result has either been acknowledged by the hub
/// or persisted in the spool; the loop never advances past a result that
/// is in neither place.
async fn process_next_job(agent: &Agent) -> Result<()> {
    let job = agent
        .executor
        .fetch_next()
        .await
        .context("failed to fetch job")?;

    let Some(job) = job else {
        debug!("no jobs available");
        return Ok(());
    };

    info!(job_id = %job.job_id, kind = %job.kind, "job received");

    let cancel = agent.current_job.begin();
    let result = agent.executor.execute(&job, &cancel).await;
    agent.current_job.finish();

    info!(
        job_id = %job.job_id,
        status = %result.status,
        exit_code = result.exit_code,
        "job completed"
    );

    if let Err(report_err) = agent.executor.report(&job.job_id, &result).await {
        warn!(job_id = %job.job_id, error = %report_err, "failed to report job result");

        match agent.spool.store(&job.job_id, &result) {
            Ok(_) => {
                Metrics::incr(&agent.metrics.results_spooled);
                info!(job_id = %job.job_id, "spooled job result for later upload");
            }
            // Fatal for this result only: log it and move on.
            Err(spool_err) => {
                warn!(job_id = %job.job_id, error = %spool_err, "failed to spool job result");
            }
        }

        return Err(report_err).context("failed to report result");
    }

    Ok(())
}

/// One spool pass: report every pending result, delete on success, purge
/// anything past the retention window.
pub async fn flush_spool(agent: &Agent) {
    let pending = match agent.spool.list() {
        Ok(pending) => pending,
        Err(err) => {
            warn!(error = %err, "failed to list spooled results");
            return;
        }
    };

    if !pending.is_empty() {
        info!(count = pending.len(), "uploading spooled results");
        Metrics::incr(&agent.metrics.spool_flushes);
    }

    for (path, result) in pending {
        let job_id = spool::extract_job_id(&path);
        match agent.executor.report(&job_id, &result).await {
            Ok(()) => {
                if let Err(err) = agent.spool.delete(&path) {
                    warn!(path = %path.display(), error = %err, "failed to delete spooled result");
                } else {
                    debug!(job_id, "uploaded and removed spooled result");
                }
            }
            Err(err) => {
                warn!(job_id, error = %err, "failed to upload spooled result");
            }
        }
    }

    if let Err(err) = agent.spool.purge(MAX_SPOOL_AGE) {
        warn!(error = %err, "failed to purge old spooled results");
    }
}

fn configured_poll_interval(agent: &Agent) -> Duration {
    let configured = agent.config_snapshot().poll_interval_sec;
    if configured == 0 {
        return DEFAULT_POLL_INTERVAL;
    }
    Duration::from_secs(configured).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}
