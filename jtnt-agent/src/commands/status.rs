//! Agent enrollment status.

use anyhow::{Context as _, Result};
use jtnt_common::config::AgentConfig;
use jtnt_common::paths;

pub fn run() -> Result<()> {
    let config_path = paths::config_path();
    if !config_path.exists() {
        println!("Agent is not enrolled");
        println!();
        println!("Enroll with:");
        println!("  jtnt-agent enroll --token <TOKEN> --hub <URL>");
        return Ok(());
    }

    let config = AgentConfig::load(&config_path).context("failed to load config")?;

    println!("Agent Status:");
    println!("  Agent ID:       {}", config.agent_id);
    println!("  Hub URL:        {}", config.hub_url);
    println!("  Heartbeat:      {}s", config.heartbeat_sec);
    println!("  Poll Interval:  {}s", config.poll_interval_sec);
    println!("  Config File:    {}", config_path.display());
    println!("  Token:          {}", mask_token(&config.agent_token));

    Ok(())
}

fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "****".to_string();
    }
    format!("{}****{}", &token[..4], &token[token.len() - 4..])
}
