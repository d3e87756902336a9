//! Agent enrollment against a hub.
//!
//! Generates the agent's Ed25519 identity, sends the one-time token and
//! host facts to the hub, and persists the returned identity: config,
//! agent token, signing key, and any delivered policy. Enrollment is the
//! one hub call made without a bearer token, on a plain one-shot client.

use anyhow::{Context as _, Result, bail};
use jtnt_common::config::AgentConfig;
use jtnt_common::keys::KeyPair;
use jtnt_common::paths;
use jtnt_common::types::{EnrollRequest, EnrollResponse, ErrorResponse};
use jtnt_telemetry::collect::host;
use std::path::Path;
use std::time::Duration;

const ENROLL_PATH: &str = "/api/v1/agent/enroll";
const ENROLL_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(token: &str, hub: &str) -> Result<()> {
    println!("Enrolling agent with hub: {hub}");

    let keypair = KeyPair::generate();
    let hostname = host::hostname().context("failed to get hostname")?;
    let identity = host::identity().unwrap_or_default();

    let request = EnrollRequest {
        token: token.to_string(),
        hostname,
        os: std::env::consts::OS.to_string(),
        os_version: (!identity.os_version.is_empty()).then_some(identity.os_version),
        arch: std::env::consts::ARCH.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: vec![
            "exec".to_string(),
            "script".to_string(),
            "file".to_string(),
        ],
        public_key: keypair.public_key_base64(),
    };

    let response = send_enroll_request(hub, &request).await?;
    persist_identity(&keypair, &response).context("failed to persist enrollment")?;

    println!("Enrollment successful");
    println!("  Agent ID: {}", response.agent_id);
    println!("  Hub URL:  {}", response.hub_base_url);
    println!("  Config:   {}", paths::config_path().display());
    println!();
    println!("Start the agent with:");
    println!("  sudo systemctl start jtnt-agent");
    println!("  or run manually: sudo jtnt-agentd");

    Ok(())
}

async fn send_enroll_request(hub: &str, request: &EnrollRequest) -> Result<EnrollResponse> {
    let client = reqwest::Client::builder()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .timeout(ENROLL_TIMEOUT)
        .build()
        .context("failed to build client")?;

    let url = format!("{}{ENROLL_PATH}", hub.trim_end_matches('/'));
    let resp = client
        .post(&url)
        .json(request)
        .send()
        .await
        .context("enrollment request failed")?;

    let status = resp.status();
    let body = resp.bytes().await.context("failed to read response")?;

    if !status.is_success() {
        if let Ok(err) = serde_json::from_slice::<ErrorResponse>(&body) {
            bail!("enrollment failed: {}", err.error);
        }
        bail!("enrollment failed with status {status}");
    }

    serde_json::from_slice(&body).context("failed to parse enrollment response")
}

fn persist_identity(keypair: &KeyPair, response: &EnrollResponse) -> Result<()> {
    let certs_dir = paths::certs_dir();
    keypair
        .save(&certs_dir)
        .context("failed to save signing key")?;
    write_secret(&certs_dir.join("agent.token"), response.agent_token.as_bytes())
        .context("failed to save agent token")?;

    if let Some(policy) = &response.policy {
        let data = serde_json::to_vec_pretty(policy)?;
        write_secret(&paths::state_dir().join("policy.json"), &data)
            .context("failed to save policy")?;
    }

    let config = AgentConfig {
        agent_id: response.agent_id.clone(),
        hub_url: response.hub_base_url.clone(),
        agent_token: response.agent_token.clone(),
        heartbeat_sec: response.heartbeat_sec,
        poll_interval_sec: response.poll_interval_sec,
    };
    config
        .save(&paths::config_path())
        .context("failed to save config")?;
    Ok(())
}

fn write_secret(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
