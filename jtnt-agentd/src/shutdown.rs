//! Signal-driven drain protocol.
//!
//! SIGTERM gets the graceful budget, SIGINT a short one, SIGQUIT the
//! minimum. In order: stop intake, wait for the in-flight job (cancel it
//! when the budget runs out), flush the spool once, send the terminal
//! heartbeat, stop the remaining tasks inside their own window. Exit code
//! 0 on a clean drain, 1 on budget overrun.

use crate::agent::Agent;
use crate::audit::{AuditEvent, AuditRecord};
use crate::{heartbeat, job_loop};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const GRACEFUL_SHUTDOWN_BUDGET: Duration = Duration::from_secs(60);
pub const INTERRUPT_SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);
pub const QUIT_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Window for stopping auxiliary tasks after the drain proper.
const AUX_STOP_WINDOW: Duration = Duration::from_secs(5);

/// Floor for the terminal-heartbeat attempt even when the budget is gone.
const FINAL_HEARTBEAT_FLOOR: Duration = Duration::from_secs(5);

/// Shutdown-triggering signals and their drain budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Term,
    Interrupt,
    Quit,
}

impl ShutdownSignal {
    pub fn budget(&self) -> Duration {
        match self {
            Self::Term => GRACEFUL_SHUTDOWN_BUDGET,
            Self::Interrupt => INTERRUPT_SHUTDOWN_BUDGET,
            Self::Quit => QUIT_SHUTDOWN_BUDGET,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Interrupt => "SIGINT",
            Self::Quit => "SIGQUIT",
        }
    }
}

/// Block until one of the shutdown signals arrives.
#[cfg(unix)]
pub async fn wait_for_signal() -> ShutdownSignal {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut interrupt =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = term.recv() => ShutdownSignal::Term,
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
        _ = quit.recv() => ShutdownSignal::Quit,
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> ShutdownSignal {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownSignal::Interrupt
}

/// Run the drain protocol. Returns the process exit code.
pub async fn drain(
    agent: Arc<Agent>,
    signal: ShutdownSignal,
    task_handles: Vec<tokio::task::JoinHandle<()>>,
) -> i32 {
    let budget = signal.budget();
    let deadline = Instant::now() + budget;
    info!(
        signal = signal.name(),
        budget_sec = budget.as_secs(),
        "initiating graceful shutdown"
    );

    // Step 1: stop intake. The loops observe this on their next tick.
    agent.begin_shutdown();

    // Step 2: wait for the in-flight job; kill it on budget overrun.
    if agent.current_job.is_busy() {
        info!("waiting for in-flight job to complete");
    }
    let drained = agent.current_job.wait_idle(budget).await;
    if !drained {
        warn!("shutdown budget reached, cancelling active job");
        agent.current_job.cancel_running();
        // The kill path is prompt; give it a moment to settle.
        let _ = agent.current_job.wait_idle(Duration::from_secs(2)).await;
    }

    // Step 3: one best-effort spool flush.
    let flush_window = remaining(deadline).max(FINAL_HEARTBEAT_FLOOR);
    if tokio::time::timeout(flush_window, job_loop::flush_spool(&agent))
        .await
        .is_err()
    {
        warn!("spool flush did not finish within the shutdown window");
    }

    // Step 4: terminal heartbeat tagged shutting_down.
    let heartbeat_window = remaining(deadline).max(FINAL_HEARTBEAT_FLOOR);
    match tokio::time::timeout(heartbeat_window, heartbeat::send(&agent, Some("shutting_down")))
        .await
    {
        Ok(Ok(())) => info!("terminal heartbeat sent"),
        Ok(Err(err)) => warn!(error = %err, "failed to send terminal heartbeat"),
        Err(_) => warn!("terminal heartbeat timed out"),
    }

    // Step 5: stop the remaining tasks inside their own window.
    for handle in task_handles {
        if tokio::time::timeout(AUX_STOP_WINDOW, handle).await.is_err() {
            warn!("task did not stop within its shutdown window");
        }
    }

    if let Err(err) = agent.audit.log(
        AuditEvent::Shutdown,
        AuditRecord {
            status: if drained { "clean" } else { "budget_overrun" }.to_string(),
            ..AuditRecord::default()
        },
    ) {
        warn!(error = %err, "failed to append shutdown audit entry");
    }

    info!(
        clean = drained,
        jobs_executed = crate::metrics::Metrics::get(&agent.metrics.jobs_executed),
        "shutdown complete"
    );
    if drained { 0 } else { 1 }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_budgets() {
        assert_eq!(ShutdownSignal::Term.budget(), Duration::from_secs(60));
        assert_eq!(ShutdownSignal::Interrupt.budget(), Duration::from_secs(10));
        assert_eq!(ShutdownSignal::Quit.budget(), Duration::from_secs(5));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(ShutdownSignal::Term.name(), "SIGTERM");
        assert_eq!(ShutdownSignal::Quit.name(), "SIGQUIT");
    }
}
