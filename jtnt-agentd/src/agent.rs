//! Agent root: owns every subsystem and wires the cooperative tasks.
//!
//! The root holds the shared config (mutex-protected; the heartbeat loop
//! mutates cadences the hub adjusts), the hub client, the policy
//! enforcer, the audit logger, the result spool, and the metrics value.
//! Handlers borrow these for the duration of one call; nothing is cyclic.

use crate::audit::{AuditEvent, AuditLogger, AuditRecord};
use crate::jobs::JobExecutor;
use crate::metrics::Metrics;
use crate::spool::ResultSpool;
use anyhow::{Context as _, Result};
use jtnt_common::config::AgentConfig;
use jtnt_common::keys::KeyPair;
use jtnt_common::policy::{Enforcer, Policy};
use jtnt_common::transport::HubClient;
use jtnt_common::{keys, paths};
use jtnt_telemetry::Collector;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tracks the single job allowed to execute at a time.
///
/// The job loop registers each job before dispatch; the shutdown
/// coordinator waits for idleness and cancels the running job when the
/// drain budget runs out.
pub struct CurrentJob {
    busy: watch::Sender<bool>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl CurrentJob {
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            busy,
            cancel: Mutex::new(None),
        }
    }

    /// Register a job as running; returns its cancellation token.
    pub fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(token.clone());
        let _ = self.busy.send(true);
        token
    }

    /// Mark the running job finished.
    pub fn finish(&self) {
        *self.cancel.lock().unwrap() = None;
        let _ = self.busy.send(false);
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    /// Cancel the running job, if any; its child process is killed.
    pub fn cancel_running(&self) {
        if let Some(token) = self.cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Wait until no job is executing, up to `budget`. Returns whether
    /// idleness was reached in time.
    pub async fn wait_idle(&self, budget: Duration) -> bool {
        let mut rx = self.busy.subscribe();
        if !*rx.borrow() {
            return true;
        }
        tokio::time::timeout(budget, async {
            while *rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}

impl Default for CurrentJob {
    fn default() -> Self {
        Self::new()
    }
}

/// The agent daemon's root object.
pub struct Agent {
    pub config: Arc<Mutex<AgentConfig>>,
    pub config_path: PathBuf,
    pub client: Arc<HubClient>,
    pub executor: Arc<JobExecutor>,
    pub spool: Arc<ResultSpool>,
    pub audit: Arc<AuditLogger>,
    pub collector: Arc<Collector>,
    pub metrics: Arc<Metrics>,
    pub current_job: Arc<CurrentJob>,
    shutdown: watch::Sender<bool>,
}

impl Agent {
    /// Assemble the agent from validated configuration and on-disk state.
    ///
    /// `config_path` is the file the config was loaded from; hub-adjusted
    /// cadences are persisted back to the same path. Fails (and the daemon
    /// exits 1) on missing config fields, an unreadable signing key, or an
    /// invalid policy signature.
    pub fn bootstrap(config: AgentConfig, config_path: PathBuf) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let keypair =
            KeyPair::load(&paths::certs_dir()).context("failed to load agent signing key")?;

        let client = Arc::new(
            HubClient::new(&config.hub_url, Some(config.agent_token.clone()))
                .context("failed to create hub client")?,
        );

        let audit = Arc::new(
            AuditLogger::new(
                &paths::audit_dir(),
                &config.agent_id,
                keypair.signing_key().clone(),
            )
            .context("failed to open audit log")?,
        );

        let spool =
            Arc::new(ResultSpool::new(&paths::spool_dir()).context("failed to create spool")?);

        let hub_key = load_hub_key();
        let policy = load_policy(hub_key.as_ref())?;
        info!(version = policy.version, "policy loaded");
        let enforcer = Arc::new(Enforcer::new(policy).context("policy failed validation")?);

        let metrics = Arc::new(Metrics::new());
        let executor = Arc::new(JobExecutor::new(
            config.agent_id.clone(),
            enforcer,
            client.clone(),
            hub_key,
            audit.clone(),
            metrics.clone(),
        ));

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(Mutex::new(config)),
            config_path,
            client,
            executor,
            spool,
            audit,
            collector: Arc::new(Collector::new()),
            metrics,
            current_job: Arc::new(CurrentJob::new()),
            shutdown,
        })
    }

    /// Assemble an agent from pre-built components, bypassing the on-disk
    /// bootstrap. Test scaffolding only.
    #[cfg(test)]
    pub(crate) fn for_tests(
        config: AgentConfig,
        config_path: PathBuf,
        client: Arc<HubClient>,
        executor: Arc<JobExecutor>,
        spool: Arc<ResultSpool>,
        audit: Arc<AuditLogger>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(Mutex::new(config)),
            config_path,
            client,
            executor,
            spool,
            audit,
            collector: Arc::new(Collector::new()),
            metrics,
            current_job: Arc::new(CurrentJob::new()),
            shutdown,
        }
    }

    /// Spawn the two long-running cooperative tasks.
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        if let Err(err) = self.audit.log(AuditEvent::Startup, AuditRecord::default()) {
            warn!(error = %err, "failed to append startup audit entry");
        }

        let heartbeat = {
            let agent = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                crate::heartbeat::run(agent, shutdown).await;
            })
        };

        let job_loop = {
            let agent = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                crate::job_loop::run(agent, shutdown).await;
            })
        };

        info!("agent started");
        vec![heartbeat, job_loop]
    }

    /// Stop job intake; the loops observe this on their next tick.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Snapshot the current config.
    pub fn config_snapshot(&self) -> AgentConfig {
        self.config.lock().unwrap().clone()
    }

    /// Update the stored heartbeat cadence and persist the config.
    pub fn adopt_heartbeat_cadence(&self, next_sec: u64) {
        let snapshot = {
            let mut config = self.config.lock().unwrap();
            if config.heartbeat_sec == next_sec {
                return;
            }
            info!(
                old_sec = config.heartbeat_sec,
                new_sec = next_sec,
                "heartbeat cadence updated by hub"
            );
            config.heartbeat_sec = next_sec;
            config.clone()
        };
        if let Err(err) = snapshot.save(&self.config_path) {
            warn!(error = %err, "failed to persist updated config");
        }
    }
}

/// The hub's public key, when installed. Script signature verification
/// and policy verification require it.
fn load_hub_key() -> Option<ed25519_dalek::VerifyingKey> {
    let path = paths::certs_dir().join("hub.pub");
    let encoded = std::fs::read_to_string(path).ok()?;
    match keys::parse_public_key(&encoded) {
        Ok(key) => Some(key),
        Err(err) => {
            warn!(error = %err, "hub public key file is unreadable, ignoring");
            None
        }
    }
}

/// Load the policy delivered by the hub, falling back to the built-in
/// default. A signed policy must verify when the hub key is installed.
fn load_policy(hub_key: Option<&ed25519_dalek::VerifyingKey>) -> Result<Policy> {
    let path = paths::state_dir().join("policy.json");
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("no stored policy, using built-in defaults");
            return Ok(Policy::default_policy());
        }
        Err(err) => return Err(err).context("failed to read stored policy"),
    };

    let policy = Policy::load(&data).context("failed to parse stored policy")?;
    if !policy.signature.is_empty() {
        let key = hub_key.context("stored policy is signed but no hub public key is installed")?;
        policy
            .verify_signature(key)
            .context("stored policy signature is invalid")?;
    }
    Ok(policy)
}
