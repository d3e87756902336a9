//! JTNT Agent - Endpoint Daemon
//!
//! Long-running agent for managed hosts: maintains a telemetry heartbeat
//! to the hub, polls for jobs, executes them under the signed capability
//! policy, and reports results with durable spooling across hub outages.

#![forbid(unsafe_code)]

mod agent;
mod audit;
mod certman;
mod heartbeat;
mod job_loop;
mod jobs;
mod metrics;
mod shutdown;
mod spool;
#[cfg(test)]
mod testutil;

use agent::Agent;
use anyhow::{Context as _, Result};
use clap::Parser;
use jtnt_common::config::AgentConfig;
use jtnt_common::paths;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "jtnt-agentd")]
#[command(author, version, about = "JTNT agent daemon - policy-gated job execution")]
struct Cli {
    /// Path to config.json (defaults to the platform config path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "fatal");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = cli.config.unwrap_or_else(paths::config_path);
    let config = AgentConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(agent_id = %config.agent_id, hub = %config.hub_url, "starting JTNT agent");

    let agent = Arc::new(Agent::bootstrap(config, config_path).context("failed to create agent")?);
    let task_handles = agent.start();

    let signal = shutdown::wait_for_signal().await;
    Ok(shutdown::drain(agent, signal, task_handles).await)
}
