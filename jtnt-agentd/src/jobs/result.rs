//! Shared result plumbing for job handlers: the bounded tail buffer, the
//! result envelope helper, and payload parsing.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use jtnt_common::types::{ArtifactInfo, JobResult, JobStatus};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hard cap on captured stream tails: 10 KiB per stream.
pub const MAX_TAIL_BYTES: usize = 10 * 1024;

/// Ring buffer that always retains the last `cap` bytes written.
///
/// Earlier bytes are discarded as they arrive, so memory stays bounded no
/// matter how much a child process writes.
#[derive(Debug)]
pub struct TailBuffer {
    buf: VecDeque<u8>,
    cap: usize,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(MAX_TAIL_BYTES)),
            cap,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        if data.len() >= self.cap {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.cap..]);
            return;
        }
        let overflow = (self.len() + data.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    /// Base64 of the retained tail; empty string when nothing was written.
    pub fn to_base64(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        BASE64.encode(self.bytes())
    }

    /// Drain `reader` to completion, retaining only the tail.
    pub async fn capture<R: AsyncRead + Unpin>(&mut self, reader: &mut R) {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => self.write(&chunk[..n]),
            }
        }
    }
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::new(MAX_TAIL_BYTES)
    }
}

/// Assemble the common result envelope.
#[allow(clippy::too_many_arguments)]
pub fn format_result(
    agent_id: &str,
    status: JobStatus,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    exit_code: i32,
    stdout: Option<&TailBuffer>,
    stderr: Option<&TailBuffer>,
    error: Option<String>,
    artifacts: Vec<ArtifactInfo>,
) -> JobResult {
    JobResult {
        agent_id: agent_id.to_string(),
        status,
        started_at,
        finished_at,
        exit_code,
        stdout_tail: stdout.map(TailBuffer::to_base64).unwrap_or_default(),
        stderr_tail: stderr.map(TailBuffer::to_base64).unwrap_or_default(),
        error_message: error.unwrap_or_default(),
        artifacts,
    }
}

/// Shorthand for an error result with no captured output.
pub fn error_result(
    agent_id: &str,
    started_at: DateTime<Utc>,
    message: impl std::fmt::Display,
) -> JobResult {
    format_result(
        agent_id,
        JobStatus::Error,
        started_at,
        Utc::now(),
        -1,
        None,
        None,
        Some(message.to_string()),
        Vec::new(),
    )
}

/// Parse a job's free-form payload into its typed form.
pub fn parse_payload<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, String> {
    serde_json::from_value(payload.clone()).map_err(|err| format!("invalid payload: {err}"))
}
