//! Heartbeat loop: periodic telemetry push to the hub.
//!
//! The cadence is read from the shared config at the top of every tick,
//! so a hub-adjusted interval takes effect on the following tick.
//! `Agent::adopt_heartbeat_cadence` is the single authoritative place the
//! cadence changes. Failures are logged and never abort the loop; the
//! transport's retry layer already absorbed short outages.

use crate::agent::Agent;
use crate::certman::{self, CertManager};
use crate::metrics::Metrics;
use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, Local, Utc};
use jtnt_common::paths;
use jtnt_common::types::{HeartbeatRequest, HeartbeatResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Fallback cadence when the configured value is invalid.
const DEFAULT_HEARTBEAT_SEC: u64 = 60;

/// Audit files older than this are pruned during daily maintenance.
const AUDIT_RETENTION_DAYS: i64 = 90;

pub async fn run(agent: Arc<Agent>, mut shutdown: watch::Receiver<bool>) {
    let mut last_cert_check: Option<DateTime<Local>> = None;

    info!(
        interval_sec = effective_cadence_sec(&agent),
        "heartbeat loop started"
    );

    loop {
        let cadence = Duration::from_secs(effective_cadence_sec(&agent));
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("heartbeat loop stopped");
                    return;
                }
            }
            _ = tokio::time::sleep(cadence) => {}
        }
        if *shutdown.borrow() {
            info!("heartbeat loop stopped");
            return;
        }

        let started = std::time::Instant::now();
        match send(&agent, None).await {
            Ok(()) => {
                Metrics::incr(&agent.metrics.heartbeats_sent);
                debug!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    "heartbeat sent"
                );
            }
            Err(err) => {
                Metrics::incr(&agent.metrics.heartbeats_failed);
                warn!(error = %err, "heartbeat failed");
            }
        }

        if certman::should_check_renewal(last_cert_check) {
            last_cert_check = Some(Local::now());
            check_certificate(&agent);
            if let Err(err) =
                crate::audit::cleanup_old_logs(&paths::audit_dir(), AUDIT_RETENTION_DAYS)
            {
                warn!(error = %err, "failed to prune old audit logs");
            }
        }
    }
}

/// Send one heartbeat. With `status` set this is the terminal heartbeat
/// of the drain protocol.
pub async fn send(agent: &Agent, status: Option<&str>) -> Result<()> {
    let sysinfo = agent
        .collector
        .collect()
        .await
        .context("failed to collect system info")?;

    let config = agent.config_snapshot();
    let request = HeartbeatRequest {
        agent_id: config.agent_id.clone(),
        timestamp: Utc::now(),
        sysinfo,
        status: status.map(String::from),
    };

    let data = agent
        .client
        .post("/api/v1/agent/heartbeat", &request)
        .await
        .context("failed to send heartbeat")?;

    let response: HeartbeatResponse =
        serde_json::from_slice(&data).context("failed to parse heartbeat response")?;

    if !response.ok {
        bail!("heartbeat not acknowledged");
    }

    if response.next_heartbeat_sec > 0 && response.next_heartbeat_sec != config.heartbeat_sec {
        agent.adopt_heartbeat_cadence(response.next_heartbeat_sec);
    }

    Ok(())
}

fn effective_cadence_sec(agent: &Agent) -> u64 {
    let configured = agent.config_snapshot().heartbeat_sec;
    if configured == 0 {
        DEFAULT_HEARTBEAT_SEC
    } else {
        configured
    }
}

/// Daily certificate expiry check. Renewal itself is hub-driven; the
/// agent only surfaces how close the installed certificate is to expiry.
fn check_certificate(agent: &Agent) {
    let certs = paths::certs_dir();
    let cert_path = certs.join("client.crt");
    if !cert_path.exists() {
        return;
    }
    let manager = CertManager::new(cert_path, certs.join("ca-bundle.crt"));
    match manager.check_expiration() {
        Ok(status) if status.needs_renewal => {
            warn!(
                days_until_expiry = status.days_until_expiry,
                "client certificate needs renewal"
            );
        }
        Ok(status) => {
            debug!(
                days_until_expiry = status.days_until_expiry,
                "client certificate checked"
            );
        }
        Err(err) => warn!(error = %err, "certificate expiry check failed"),
    }
    if let Err(err) = manager.cleanup_old_backups() {
        warn!(error = %err, "failed to clean up certificate backups");
    }
}
