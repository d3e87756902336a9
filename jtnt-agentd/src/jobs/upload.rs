//! File upload handler.
//!
//! Uploads a file, or every regular file under a directory, to presigned
//! URLs obtained from the hub's artifact-init endpoint. Each uploaded file
//! contributes an `ArtifactInfo` (name, size, hex SHA-256) to the result.

use super::JobExecutor;
use crate::jobs::result::{error_result, format_result, parse_payload};
use chrono::Utc;
use jtnt_common::types::{
    ArtifactInfo, ArtifactInitRequest, ArtifactInitResponse, Job, JobResult, JobStatus,
    UploadPayload, UploadUrl,
};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub(crate) async fn run(executor: &JobExecutor, job: &Job) -> JobResult {
    let started_at = Utc::now();

    let payload: UploadPayload = match parse_payload(&job.payload) {
        Ok(payload) => payload,
        Err(err) => return error_result(executor.agent_id(), started_at, err),
    };

    if let Err(violation) = executor.enforcer().can_read_file(&payload.source_path) {
        return executor.deny(job, &violation, &payload.source_path, started_at);
    }

    let source = PathBuf::from(&payload.source_path);
    let metadata = match std::fs::metadata(&source) {
        Ok(metadata) => metadata,
        Err(err) => {
            return error_result(
                executor.agent_id(),
                started_at,
                format!("failed to stat file: {err}"),
            );
        }
    };

    // The effective ceiling is the smaller of the payload limit and the
    // policy maximum; zero means "policy only".
    let policy_max = executor.enforcer().max_file_size_bytes();
    let max_size = match payload.max_size_bytes {
        0 => policy_max,
        limit if policy_max == 0 => limit,
        limit => limit.min(policy_max),
    };

    let files = if metadata.is_dir() {
        match collect_files(&source) {
            Ok(files) => files,
            Err(err) => {
                return error_result(
                    executor.agent_id(),
                    started_at,
                    format!("failed to walk directory: {err}"),
                );
            }
        }
    } else {
        vec![source.clone()]
    };

    let mut artifacts = Vec::with_capacity(files.len());
    for file in &files {
        match upload_file(executor, &job.job_id, file, max_size).await {
            Ok(artifact) => artifacts.push(artifact),
            Err(err) => return error_result(executor.agent_id(), started_at, err),
        }
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
        artifacts,
    )
}

/// Regular files under `dir`, depth-first.
fn collect_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

async fn upload_file(
    executor: &JobExecutor,
    job_id: &str,
    path: &Path,
    max_size: u64,
) -> Result<ArtifactInfo, String> {
    let data = std::fs::read(path).map_err(|err| format!("failed to read file: {err}"))?;

    if max_size > 0 && data.len() as u64 > max_size {
        return Err(format!(
            "file size {} exceeds maximum {max_size}",
            data.len()
        ));
    }

    let artifact = ArtifactInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size: data.len() as u64,
        sha256: hex::encode(Sha256::digest(&data)),
    };

    let upload_urls = initialize_upload(executor, job_id, &artifact).await?;
    let destination = upload_urls
        .first()
        .ok_or_else(|| "no upload URL received".to_string())?;

    send_to_presigned_url(destination, data).await?;
    Ok(artifact)
}

async fn initialize_upload(
    executor: &JobExecutor,
    job_id: &str,
    artifact: &ArtifactInfo,
) -> Result<Vec<UploadUrl>, String> {
    let request = ArtifactInitRequest {
        job_id: job_id.to_string(),
        files: vec![artifact.clone()],
    };
    let data = executor
        .client()
        .post("/api/v1/agent/artifacts/init", &request)
        .await
        .map_err(|err| format!("failed to initialize upload: {err}"))?;
    let response: ArtifactInitResponse = serde_json::from_slice(&data)
        .map_err(|err| format!("failed to parse artifact-init response: {err}"))?;
    Ok(response.upload_urls)
}

async fn send_to_presigned_url(destination: &UploadUrl, data: Vec<u8>) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .timeout(UPLOAD_TIMEOUT)
        .build()
        .map_err(|err| format!("failed to build upload client: {err}"))?;

    let method: reqwest::Method = destination
        .method
        .parse()
        .map_err(|_| format!("invalid upload method: {}", destination.method))?;

    let mut req = client.request(method, &destination.url).body(data);
    for (key, value) in &destination.headers {
        req = req.header(key, value);
    }

    let resp = req
        .send()
        .await
        .map_err(|err| format!("upload failed: {err}"))?;
    if !resp.status().is_success() {
        return Err(format!("upload failed with status {}", resp.status()));
    }
    Ok(())
}
