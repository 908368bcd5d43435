//! Backend contract: one AI CLI behind a uniform interface.
//!
//! A backend knows how to build its command line, run it, and read its own
//! output log. The default methods are no-op stubs so a minimal backend only
//! implements what it supports; capability probes (`supports_sessions`,
//! `supports_named_sessions`) tell the callers what to expect.

use crate::errors::RuntimeError;
use async_trait::async_trait;
use std::path::Path;

/// One exec request, before prompt wrapping.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub workspace: &'a Path,
    pub system_prompt: &'a str,
    pub log_path: &'a Path,
    pub max_turns: u32,
    /// Requested named session. Backends without named-session support
    /// ignore this; the actual id always comes from the output log.
    pub session_id: Option<&'a str>,
}

/// One resume request against an existing session.
#[derive(Debug, Clone)]
pub struct ResumeRequest<'a> {
    pub workspace: &'a Path,
    pub session_id: &'a str,
    pub log_path: &'a Path,
    pub max_turns: u32,
}

/// What one invocation produced, before classification.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub exit_code: i32,
    pub stderr: String,
}

#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// One-time startup check (binary present, auth available).
    fn init(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn build_exec_args(&self, req: &ExecRequest<'_>) -> Vec<String>;

    fn build_resume_args(&self, _req: &ResumeRequest<'_>) -> Vec<String> {
        Vec::new()
    }

    /// Run the CLI with `prompt` on stdin, streaming stdout to `log_path`.
    /// Returns the raw exit code and captured stderr; classification happens
    /// in the runtime.
    async fn invoke(
        &self,
        workspace: &Path,
        args: &[String],
        prompt: &str,
        log_path: &Path,
    ) -> Result<Invocation, RuntimeError>;

    /// Whether an exit is worth retrying (timeouts, 5xx, rate limits).
    fn is_retryable(&self, _exit_code: i32, _stderr: &str) -> bool {
        false
    }

    /// Final assistant text from an output log.
    fn extract_text(&self, _log: &str) -> Option<String> {
        None
    }

    /// The session id the backend actually used, from an output log.
    fn extract_session_id(&self, _log: &str) -> Option<String> {
        None
    }

    fn supports_sessions(&self) -> bool {
        false
    }

    fn supports_named_sessions(&self) -> bool {
        false
    }
}

/// Resolve a backend driver by name (`RUNTIME_BACKEND`).
pub fn backend_for(
    name: &str,
    cmd: &str,
) -> Result<std::sync::Arc<dyn Backend>, RuntimeError> {
    match name {
        "claude" => Ok(std::sync::Arc::new(super::claude::ClaudeBackend::new(cmd))),
        "mock" => Ok(std::sync::Arc::new(super::mock::MockBackend::always_pass())),
        other => Err(RuntimeError::UnknownBackend {
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_for_known_names() {
        assert_eq!(backend_for("claude", "claude").unwrap().name(), "claude");
        assert_eq!(backend_for("mock", "").unwrap().name(), "mock");
    }

    #[test]
    fn test_backend_for_unknown_name() {
        let err = backend_for("gpt-telepathy", "x").unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownBackend { .. }));
    }
}
