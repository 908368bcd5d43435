//! Scriptable mock backend for tests.
//!
//! A mock is loaded with a sequence of turns; each invocation pops the next
//! one, writes its canned log content, and reports its exit code. An empty
//! script yields passing turns forever. The mock intentionally does not
//! support named sessions: it ignores any requested id and emits its own,
//! which exercises the session-id plumbing the same way real backends that
//! lack named sessions do.

use super::backend::{Backend, ExecRequest, Invocation, ResumeRequest};
use crate::errors::RuntimeError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// One scripted invocation outcome.
#[derive(Debug, Clone)]
pub struct MockTurn {
    pub exit_code: i32,
    pub log: String,
    pub retryable: bool,
    pub stderr: String,
}

impl MockTurn {
    pub fn pass(log: &str) -> Self {
        Self {
            exit_code: 0,
            log: log.to_string(),
            retryable: false,
            stderr: String::new(),
        }
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            log: String::new(),
            retryable: false,
            stderr: stderr.to_string(),
        }
    }

    pub fn retryable(exit_code: i32, stderr: &str) -> Self {
        Self {
            retryable: true,
            ..Self::fail(exit_code, stderr)
        }
    }
}

/// A record of one call the mock received.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub args: Vec<String>,
    pub prompt: String,
    pub workspace: std::path::PathBuf,
}

#[derive(Debug)]
pub struct MockBackend {
    script: Mutex<std::collections::VecDeque<MockTurn>>,
    calls: Mutex<Vec<MockCall>>,
    sessions: AtomicU32,
    supports_sessions: bool,
    /// Retryability of the most recent turn, consulted by `is_retryable`.
    last_retryable: Mutex<bool>,
}

impl MockBackend {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            script: Mutex::new(turns.into()),
            calls: Mutex::new(Vec::new()),
            sessions: AtomicU32::new(0),
            supports_sessions: true,
            last_retryable: Mutex::new(false),
        }
    }

    /// A mock whose every turn succeeds with an empty-result log.
    pub fn always_pass() -> Self {
        Self::new(Vec::new())
    }

    pub fn without_sessions(mut self) -> Self {
        self.supports_sessions = false;
        self
    }

    /// Number of invocations so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn build_exec_args(&self, req: &ExecRequest<'_>) -> Vec<String> {
        // Requested session ids are recorded but deliberately not honored.
        let mut args = vec!["exec".to_string(), format!("turns={}", req.max_turns)];
        if let Some(session) = req.session_id {
            args.push(format!("requested-session={}", session));
        }
        args
    }

    fn build_resume_args(&self, req: &ResumeRequest<'_>) -> Vec<String> {
        vec!["resume".to_string(), req.session_id.to_string()]
    }

    async fn invoke(
        &self,
        workspace: &Path,
        args: &[String],
        prompt: &str,
        log_path: &Path,
    ) -> Result<Invocation, RuntimeError> {
        let turn = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockTurn::pass(r#"{"type":"result","result":"ok"}"#));

        self.calls.lock().unwrap().push(MockCall {
            args: args.to_vec(),
            prompt: prompt.to_string(),
            workspace: workspace.to_path_buf(),
        });
        *self.last_retryable.lock().unwrap() = turn.retryable;

        let session = self.sessions.fetch_add(1, Ordering::SeqCst);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = turn.log.clone();
        if self.supports_sessions {
            content.push_str(&format!(
                "\n{{\"type\":\"system\",\"session_id\":\"mock-session-{:04}\"}}\n",
                session
            ));
        }
        crate::util::append_line(log_path, &content).map_err(|e| {
            RuntimeError::Io(std::io::Error::other(e.to_string()))
        })?;

        Ok(Invocation {
            exit_code: turn.exit_code,
            stderr: turn.stderr,
        })
    }

    fn is_retryable(&self, exit_code: i32, _stderr: &str) -> bool {
        exit_code == crate::errors::exit::BACKEND_RETRYABLE
            || *self.last_retryable.lock().unwrap()
    }

    fn extract_text(&self, log: &str) -> Option<String> {
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
        log.lines().rev().find_map(|line| {
            serde_json::from_str::<serde_json::Value>(line)
                .ok()?
                .get("session_id")?
                .as_str()
                .map(String::from)
        })
    }

    fn supports_sessions(&self) -> bool {
        self.supports_sessions
    }

    fn supports_named_sessions(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_scripted_turns_pop_in_order() {
        let dir = tempdir().unwrap();
        let backend = MockBackend::new(vec![
            MockTurn::pass(r#"{"type":"result","result":"one"}"#),
            MockTurn::fail(5, "boom"),
        ]);
        let log = dir.path().join("step.log");

        let first = backend
            .invoke(dir.path(), &[], "p", &log)
            .await
            .unwrap();
        assert_eq!(first.exit_code, 0);

        let second = backend
            .invoke(dir.path(), &[], "p", &log)
            .await
            .unwrap();
        assert_eq!(second.exit_code, 5);
        assert_eq!(second.stderr, "boom");

        // Script exhausted: defaults to pass
        let third = backend.invoke(dir.path(), &[], "p", &log).await.unwrap();
        assert_eq!(third.exit_code, 0);
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_ignores_requested_session_id() {
        let dir = tempdir().unwrap();
        let backend = MockBackend::always_pass();
        let log = dir.path().join("step.log");

        let req = ExecRequest {
            workspace: dir.path(),
            system_prompt: "",
            log_path: &log,
            max_turns: 10,
            session_id: Some("requested-id"),
        };
        let args = backend.build_exec_args(&req);
        backend.invoke(dir.path(), &args, "p", &log).await.unwrap();

        let content = std::fs::read_to_string(&log).unwrap();
        let actual = backend.extract_session_id(&content).unwrap();
        assert_ne!(actual, "requested-id");
        assert!(actual.starts_with("mock-session-"));
        assert!(!backend.supports_named_sessions());
    }

    #[tokio::test]
    async fn test_extract_text_reads_result_event() {
        let dir = tempdir().unwrap();
        let backend = MockBackend::new(vec![MockTurn::pass(
            r#"{"type":"result","result":"<result>PASS</result>"}"#,
        )]);
        let log = dir.path().join("step.log");
        backend.invoke(dir.path(), &[], "p", &log).await.unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            backend.extract_text(&content).as_deref(),
            Some("<result>PASS</result>")
        );
    }
}
