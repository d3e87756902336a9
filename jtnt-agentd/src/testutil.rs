//! Shared test scaffolding: an in-process hub stub and agent assembly.

use crate::agent::Agent;
use crate::audit::AuditLogger;
use crate::jobs::JobExecutor;
use crate::metrics::Metrics;
use crate::spool::ResultSpool;
use jtnt_common::config::AgentConfig;
use jtnt_common::keys::KeyPair;
use jtnt_common::policy::{Capabilities, Enforcer, ExecCapability, Policy};
use jtnt_common::retry::{BackoffConfig, BreakerConfig};
use jtnt_common::transport::HubClient;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

/// Mutable behavior and capture state of the hub stub.
#[derive(Default)]
pub struct HubState {
    pub jobs: tokio::sync::Mutex<Vec<serde_json::Value>>,
    pub fail_results: AtomicBool,
    pub reported: tokio::sync::Mutex<Vec<(String, serde_json::Value)>>,
    pub heartbeats: tokio::sync::Mutex<Vec<serde_json::Value>>,
    pub next_heartbeat_sec: AtomicU64,
}

pub struct StubHub {
    pub url: String,
    pub state: Arc<HubState>,
}

/// Spawn a raw-TCP hub stub serving the agent API routes used in tests.
pub async fn spawn_stub_hub() -> StubHub {
    let state = Arc::new(HubState::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let state = server_state.clone();
            tokio::spawn(async move {
                let (request_line, body) = read_request(&mut sock).await;
                route(&state, &request_line, body, &mut sock).await;
            });
        }
    });

    StubHub {
        url: format!("http://{addr}"),
        state,
    }
}

async fn route(
    state: &HubState,
    request_line: &str,
    body: Vec<u8>,
    sock: &mut tokio::net::TcpStream,
) {
    if request_line.contains("/agent/jobs/next") {
        let job = state.jobs.lock().await.pop();
        match job {
            Some(job) => write_response(sock, 200, &job.to_string()).await,
            None => write_response(sock, 204, "").await,
        }
    } else if request_line.contains("/agent/jobs/") && request_line.contains("/result") {
        if state.fail_results.load(Ordering::SeqCst) {
            write_response(sock, 500, "{\"error\":\"unavailable\"}").await;
            return;
        }
        let job_id = request_line
            .split('/')
            .skip_while(|part| *part != "jobs")
            .nth(1)
            .unwrap_or_default()
            .to_string();
        let parsed = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        state.reported.lock().await.push((job_id, parsed));
        write_response(sock, 200, "{}").await;
    } else if request_line.contains("/agent/heartbeat") {
        let parsed = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        state.heartbeats.lock().await.push(parsed);
        let next = state.next_heartbeat_sec.load(Ordering::SeqCst);
        let reply = format!("{{\"ok\":true,\"next_heartbeat_sec\":{next}}}");
        write_response(sock, 200, &reply).await;
    } else if request_line.contains("/agent/ping") {
        write_response(sock, 200, "{}").await;
    } else {
        write_response(sock, 404, "{\"error\":\"not found\"}").await;
    }
}

async fn read_request(sock: &mut tokio::net::TcpStream) -> (String, Vec<u8>) {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = sock.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(header_end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&data[..header_end]).to_string();
            let content_length = headers
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            let body_start = header_end + 4;
            while data.len() < body_start + content_length {
                let n = sock.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }
            let request_line = headers.lines().next().unwrap_or_default().to_string();
            return (request_line, data[body_start..].to_vec());
        }
    }
    (String::new(), Vec::new())
}

async fn write_response(sock: &mut tokio::net::TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        204 => "No Content",
        404 => "Not Found",
        _ => "Error",
    };
    let response = if status == 204 {
        format!("HTTP/1.1 204 {reason}\r\nConnection: close\r\n\r\n")
    } else {
        format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    };
    let _ = sock.write_all(response.as_bytes()).await;
}

/// An agent wired to the stub hub, with fast retries and permissive
/// thresholds. The returned tempdir owns all on-disk state.
pub fn test_agent(hub_url: &str) -> (Arc<Agent>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();

    let retry = BackoffConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts: 2,
    };
    let breaker = BreakerConfig {
        failure_threshold: 100,
        success_threshold: 1,
        open_timeout: Duration::from_millis(10),
    };
    let client = Arc::new(
        HubClient::with_config(hub_url, Some("tok-test".to_string()), retry, breaker).unwrap(),
    );

    let pair = KeyPair::generate();
    let audit_dir = dir.path().join("audit");
    let audit =
        Arc::new(AuditLogger::new(&audit_dir, "agent-test", pair.signing_key().clone()).unwrap());
    let spool = Arc::new(ResultSpool::new(&dir.path().join("spool")).unwrap());
    let metrics = Arc::new(Metrics::new());

    let policy = Policy {
        version: 1,
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        signature: String::new(),
        capabilities: Capabilities {
            exec: Some(ExecCapability {
                enabled: true,
                allowed_binaries: vec!["echo".to_string(), "sleep".to_string()],
                allowed_paths: vec![],
                max_execution_sec: 300,
            }),
            script: None,
            file: None,
        },
    };
    let executor = Arc::new(JobExecutor::new(
        "agent-test".to_string(),
        Arc::new(Enforcer::new(policy).unwrap()),
        client.clone(),
        None,
        audit.clone(),
        metrics.clone(),
    ));

    let config = AgentConfig {
        agent_id: "agent-test".to_string(),
        hub_url: hub_url.to_string(),
        agent_token: "tok-test".to_string(),
        heartbeat_sec: 60,
        poll_interval_sec: 30,
    };
    let config_path = dir.path().join("config.json");
    config.save(&config_path).unwrap();

    let agent = Arc::new(Agent::for_tests(
        config,
        config_path,
        client,
        executor,
        spool,
        audit,
        metrics,
    ));
    (agent, dir)
}
