//! Hub connectivity probe through the full transport stack.

use anyhow::{Context as _, Result};
use jtnt_common::config::AgentConfig;
use jtnt_common::paths;
use jtnt_common::retry::{BackoffConfig, BreakerConfig};
use jtnt_common::transport::HubClient;
use std::time::Duration;

pub async fn run() -> Result<()> {
    let config =
        AgentConfig::load(&paths::config_path()).context("failed to load config (not enrolled?)")?;

    println!("Testing connection to: {}", config.hub_url);

    // A probe should fail fast, not sit in the outage backoff schedule.
    let retry = BackoffConfig {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(2),
        max_attempts: 3,
        ..BackoffConfig::default()
    };
    let client = HubClient::with_config(
        &config.hub_url,
        Some(config.agent_token.clone()),
        retry,
        BreakerConfig::default(),
    )
    .context("failed to create client")?;

    let probe = tokio::time::timeout(Duration::from_secs(10), client.ping()).await;
    match probe {
        Ok(Ok(())) => {
            println!("Connection test successful");
            Ok(())
        }
        Ok(Err(err)) => {
            println!("Connection test failed");
            Err(err).context("connection test failed")
        }
        Err(_) => {
            println!("Connection test failed");
            anyhow::bail!("connection test timed out")
        }
    }
}
