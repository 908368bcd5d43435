//! Runtime: one AI CLI invocation behind retry, sessions and prompt
//! wrapping.
//!
//! The runtime owns a backend driver, the retry policy and the resolved
//! prompt wrappers. Callers get three synchronous-to-them operations:
//! `exec_once`, `exec_once_with_session`, `resume`. The session id returned
//! is always the one the backend actually used, parsed from its log — a
//! backend free to ignore a requested name must not leak the requested id
//! back to anything that stores it.

pub mod backend;
pub mod claude;
pub mod mock;
pub mod prompt;
pub mod retry;

pub use backend::{Backend, ExecRequest, Invocation, ResumeRequest, backend_for};
pub use mock::{MockBackend, MockTurn};
pub use prompt::PromptWrappers;
pub use retry::{RetryPolicy, retry_with_policy};

use crate::config::Config;
use crate::errors::RuntimeError;
use std::path::Path;
use std::sync::Arc;

/// Result of one exec: the exit code and the session the backend reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub session_id: Option<String>,
}

/// Parameters for one work-step execution.
#[derive(Debug, Clone)]
pub struct ExecParams<'a> {
    pub workspace: &'a Path,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub log_path: &'a Path,
    pub max_turns: u32,
    /// Apply prompt wrappers (work steps only; summaries and supervisors
    /// pass false).
    pub wrap: bool,
}

pub struct Runtime {
    backend: Arc<dyn Backend>,
    policy: RetryPolicy,
    wrappers: PromptWrappers,
}

impl Runtime {
    /// Build the runtime the config asks for and run the backend's init
    /// check.
    pub fn from_config(config: &Config) -> Result<Self, RuntimeError> {
        let backend = backend_for(&config.backend, &config.backend_cmd)?;
        backend.init()?;
        Ok(Self {
            backend,
            policy: config.retry.clone(),
            wrappers: PromptWrappers::resolve(config)?,
        })
    }

    /// Build a runtime around an explicit backend (tests, embedded use).
    pub fn with_backend(
        backend: Arc<dyn Backend>,
        policy: RetryPolicy,
        wrappers: PromptWrappers,
    ) -> Self {
        Self {
            backend,
            policy,
            wrappers,
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// One fresh call. Retries per policy on retryable classifications.
    pub async fn exec_once(
        &self,
        params: &ExecParams<'_>,
    ) -> Result<ExecOutcome, RuntimeError> {
        self.exec_inner(params, None).await
    }

    /// One fresh call requesting a named session. Backends without named
    /// sessions ignore the request; the outcome carries the actual id.
    pub async fn exec_once_with_session(
        &self,
        params: &ExecParams<'_>,
        session_id: &str,
    ) -> Result<ExecOutcome, RuntimeError> {
        let requested = self
            .backend
            .supports_named_sessions()
            .then_some(session_id);
        self.exec_inner(params, requested).await
    }

    /// Continue an existing session with a follow-up prompt.
    pub async fn resume(
        &self,
        workspace: &Path,
        session_id: &str,
        prompt: &str,
        log_path: &Path,
        max_turns: u32,
    ) -> Result<i32, RuntimeError> {
        if !self.backend.supports_sessions() {
            return Err(RuntimeError::ResumeUnsupported {
                name: self.backend.name().to_string(),
            });
        }
        let req = ResumeRequest {
            workspace,
            session_id,
            log_path,
            max_turns,
        };
        let args = self.backend.build_resume_args(&req);
        let backend = Arc::clone(&self.backend);
        let prompt = prompt.to_string();
        let invocation = retry_with_policy(&self.policy, |_| {
            let backend = Arc::clone(&backend);
            let args = args.clone();
            let prompt = prompt.clone();
            async move {
                let inv = backend.invoke(workspace, &args, &prompt, log_path).await?;
                classify(backend.as_ref(), inv)
            }
        })
        .await?;
        Ok(invocation.exit_code)
    }

    async fn exec_inner(
        &self,
        params: &ExecParams<'_>,
        session_id: Option<&str>,
    ) -> Result<ExecOutcome, RuntimeError> {
        let (system_prompt, user_prompt) = if params.wrap {
            (
                self.wrappers.wrap_system(params.system_prompt),
                self.wrappers.wrap_user(params.user_prompt),
            )
        } else {
            (
                params.system_prompt.to_string(),
                params.user_prompt.to_string(),
            )
        };

        let req = ExecRequest {
            workspace: params.workspace,
            system_prompt: &system_prompt,
            log_path: params.log_path,
            max_turns: params.max_turns,
            session_id,
        };
        let args = self.backend.build_exec_args(&req);
        let backend = Arc::clone(&self.backend);
        let workspace = params.workspace;
        let log_path = params.log_path;

        let invocation = retry_with_policy(&self.policy, |_| {
            let backend = Arc::clone(&backend);
            let args = args.clone();
            let user_prompt = user_prompt.clone();
            async move {
                let inv = backend
                    .invoke(workspace, &args, &user_prompt, log_path)
                    .await?;
                classify(backend.as_ref(), inv)
            }
        })
        .await?;

        let session_id = std::fs::read_to_string(params.log_path)
            .ok()
            .and_then(|log| self.backend.extract_session_id(&log));

        Ok(ExecOutcome {
            exit_code: invocation.exit_code,
            session_id,
        })
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Turn a raw invocation into a typed error when the exit is nonzero.
fn classify(backend: &dyn Backend, inv: Invocation) -> Result<Invocation, RuntimeError> {
    if inv.exit_code == 0 {
        return Ok(inv);
    }
    Err(RuntimeError::BackendExit {
        exit_code: inv.exit_code,
        retryable: backend.is_retryable(inv.exit_code, &inv.stderr),
        stderr: inv.stderr,
    })
}
