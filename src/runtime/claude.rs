//! Claude CLI backend.
//!
//! Drives the `claude` binary in print mode with stream-json output. The
//! prompt goes in on stdin; every stdout line is appended to the step log.
//! Session ids are read back out of the log — the id the CLI reports is the
//! one that counts, never the one we asked for.

use super::backend::{Backend, ExecRequest, Invocation, ResumeRequest};
use crate::errors::RuntimeError;
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

static SESSION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""session_id"\s*:\s*"([0-9a-fA-F-]{8,})""#).unwrap()
});

/// Stderr fragments that indicate a transient service condition.
const RETRYABLE_MARKERS: &[&str] = &[
    "overloaded",
    "rate limit",
    "rate_limit",
    "timeout",
    "timed out",
    "503",
    "529",
    "service unavailable",
    "connection reset",
];

#[derive(Debug)]
pub struct ClaudeBackend {
    cmd: String,
}

impl ClaudeBackend {
    pub fn new(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
        }
    }
}

#[async_trait]
impl Backend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    fn init(&self) -> Result<(), RuntimeError> {
        // Presence check only; auth failures surface on first invocation.
        which_exists(&self.cmd).then_some(()).ok_or_else(|| {
            RuntimeError::SpawnFailed {
                command: self.cmd.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "backend binary not found on PATH",
                ),
            }
        })
    }

    fn build_exec_args(&self, req: &ExecRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            req.max_turns.to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if !req.system_prompt.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(req.system_prompt.to_string());
        }
        if let Some(session) = req.session_id {
            args.push("--session-id".to_string());
            args.push(session.to_string());
        }
        args
    }

    fn build_resume_args(&self, req: &ResumeRequest<'_>) -> Vec<String> {
        vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            req.max_turns.to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--resume".to_string(),
            req.session_id.to_string(),
        ]
    }

    async fn invoke(
        &self,
        workspace: &Path,
        args: &[String],
        prompt: &str,
        log_path: &Path,
    ) -> Result<Invocation, RuntimeError> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;

        let mut child = Command::new(&self.cmd)
            .args(args)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::SpawnFailed {
                command: self.cmd.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Io(std::io::Error::other("no stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Io(std::io::Error::other("no stderr pipe")))?;

        let stderr_task = tokio::spawn(async move {
            let mut out = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                out.push_str(&line);
                out.push('\n');
            }
            out
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            log.write_all(line.as_bytes()).await?;
            log.write_all(b"\n").await?;
        }
        log.flush().await?;

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        Ok(Invocation {
            exit_code: status.code().unwrap_or(-1),
            stderr: stderr_text,
        })
    }

    fn is_retryable(&self, exit_code: i32, stderr: &str) -> bool {
        if exit_code == crate::errors::exit::BACKEND_RETRYABLE {
            return true;
        }
        let lower = stderr.to_lowercase();
        RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
    }

    fn extract_text(&self, log: &str) -> Option<String> {
        // The final result event carries the assistant's full text.
        for line in log.lines().rev() {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if value.get("type").and_then(|t| t.as_str()) == Some("result") {
                return value
                    .get("result")
                    .and_then(|r| r.as_str())
                    .map(String::from);
            }
        }
        None
    }

    fn extract_session_id(&self, log: &str) -> Option<String> {
        SESSION_ID
            .captures(log)
            .map(|caps| caps[1].to_string())
    }

    fn supports_sessions(&self) -> bool {
        true
    }

    fn supports_named_sessions(&self) -> bool {
        true
    }
}

fn which_exists(cmd: &str) -> bool {
    if cmd.contains('/') {
        return Path::new(cmd).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(cmd).exists())
        })
        .unwrap_or(false)
}
