//! File download handler.
//!
//! Streams the body to `<dest>.tmp` while hashing, verifies the expected
//! SHA-256, then renames into place with owner-only permissions. A hash
//! mismatch or transfer failure leaves no partial file behind.

use super::JobExecutor;
use crate::jobs::result::{error_result, format_result, parse_payload};
use chrono::Utc;
use futures::StreamExt as _;
use jtnt_common::types::{DownloadPayload, Job, JobResult, JobStatus};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt as _;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub(crate) async fn run(executor: &JobExecutor, job: &Job) -> JobResult {
    let started_at = Utc::now();

    let payload: DownloadPayload = match parse_payload(&job.payload) {
        Ok(payload) => payload,
        Err(err) => return error_result(executor.agent_id(), started_at, err),
    };

    if let Err(violation) = executor.enforcer().can_write_file(&payload.dest_path, 0) {
        return executor.deny(job, &violation, &payload.dest_path, started_at);
    }

    let dest = PathBuf::from(&payload.dest_path);
    if let Some(dir) = dest.parent() {
        if let Err(err) = std::fs::create_dir_all(dir) {
            return error_result(
                executor.agent_id(),
                started_at,
                format!("failed to create directory: {err}"),
            );
        }
    }

    if let Err(err) = download_file(&payload.url, &dest, &payload.sha256).await {
        return error_result(executor.agent_id(), started_at, err);
    }

    format_result(
        executor.agent_id(),
        JobStatus::Success,
        started_at,
        Utc::now(),
        0,
        None,
        None,
        None,
        Vec::new(),
    )
}

async fn download_file(url: &str, dest: &Path, expected_sha256: &str) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|err| format!("failed to build download client: {err}"))?;

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|err| format!("download failed: {err}"))?;
    if !resp.status().is_success() {
        return Err(format!("download failed with status {}", resp.status()));
    }

    let tmp = tmp_path(dest);
    let result = stream_to_file(resp, &tmp, expected_sha256).await;
    if let Err(err) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }

    std::fs::rename(&tmp, dest).map_err(|err| {
        let _ = std::fs::remove_file(&tmp);
        format!("failed to move file into place: {err}")
    })?;
    set_owner_only(dest).map_err(|err| format!("failed to set permissions: {err}"))?;
    Ok(())
}

async fn stream_to_file(
    resp: reqwest::Response,
    tmp: &Path,
    expected_sha256: &str,
) -> Result<(), String> {
    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|err| format!("failed to create file: {err}"))?;

    let mut hasher = Sha256::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| format!("download interrupted: {err}"))?;
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|err| format!("failed to write file: {err}"))?;
    }
    file.flush()
        .await
        .map_err(|err| format!("failed to flush file: {err}"))?;
    drop(file);

    if !expected_sha256.is_empty() {
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected_sha256) {
            return Err(format!(
                "hash mismatch: expected {expected_sha256}, got {actual}"
            ));
        }
    }
    Ok(())
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::test_executor_with_file_capability;
    use jtnt_common::types::JobKind;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    /// Serve one HTTP response on an ephemeral port and return its URL.
    async fn serve_once(body: Vec<u8>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = sock.read(&mut buf).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            sock.write_all(header.as_bytes()).await.unwrap();
            sock.write_all(&body).await.unwrap();
        });
        format!("http://{addr}/artifact.bin")
    }

    fn download_job(url: &str, dest: &Path, sha256: &str) -> Job {
        Job {
            job_id: "job-dl".to_string(),
            kind: JobKind::Download,
            created_at: None,
            timeout_sec: 30,
            payload: serde_json::json!({
                "url": url,
                "dest_path": dest.to_str().unwrap(),
                "sha256": sha256,
            }),
        }
    }

    #[tokio::test]
    async fn test_download_with_matching_hash() {
        let audit_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let executor = test_executor_with_file_capability(
            audit_dir.path(),
            target_dir.path().to_str().unwrap(),
        );

        let body = b"artifact contents".to_vec();
        let sha = hex::encode(Sha256::digest(&body));
        let url = serve_once(body.clone()).await;
        let dest = target_dir.path().join("artifact.bin");

        let result = run(&executor, &download_job(&url, &dest, &sha)).await;
        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(std::fs::read(&dest).unwrap(), body);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_no_file() {
        let audit_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let executor = test_executor_with_file_capability(
            audit_dir.path(),
            target_dir.path().to_str().unwrap(),
        );

        let url = serve_once(b"unexpected bytes".to_vec()).await;
        let dest = target_dir.path().join("artifact.bin");
        let wrong_sha = hex::encode(Sha256::digest(b"something else"));

        let result = run(&executor, &download_job(&url, &dest, &wrong_sha)).await;
        assert_eq!(result.status, JobStatus::Error);
        assert!(result.error_message.contains("hash mismatch"));
        assert!(!dest.exists());
        assert!(!tmp_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_write_policy_denied() {
        let audit_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let executor = test_executor_with_file_capability(
            audit_dir.path(),
            target_dir.path().to_str().unwrap(),
        );

        let dest = Path::new("/etc/forbidden.bin");
        let result = run(
            &executor,
            &download_job("http://127.0.0.1:1/x", dest, ""),
        )
        .await;
        assert_eq!(result.status, JobStatus::Error);
        assert!(result.error_message.contains("policy violation"));
    }

    #[tokio::test]
    async fn test_empty_expected_hash_skips_check() {
        let audit_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let executor = test_executor_with_file_capability(
            audit_dir.path(),
            target_dir.path().to_str().unwrap(),
        );

        let url = serve_once(b"whatever".to_vec()).await;
        let dest = target_dir.path().join("unchecked.bin");
        let result = run(&executor, &download_job(&url, &dest, "")).await;
        assert_eq!(result.status, JobStatus::Success);
        assert!(dest.exists());
    }

    #[test]
    fn test_tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/a/b/file.bin")),
            PathBuf::from("/a/b/file.bin.tmp")
        );
    }
}
