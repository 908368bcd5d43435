//! PR / merge coordination.
//!
//! The GitHub API is an external collaborator consumed through the
//! [`GitHub`] trait; the production implementation shells out to the `gh`
//! CLI and tests script a [`MockGitHub`]. The coordinator owns the
//! `needs_merge` path: attempt the merge, then hand the outcome to the
//! lifecycle engine as an event — it never mutates state directly.

use crate::errors::SchedulerError;
use crate::lifecycle::LifecycleEngine;
use crate::worker::WorkerDir;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// What one merge attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged,
    Conflict { files: Vec<String> },
    Failed { message: String },
}

/// One PR review, as much of it as the coordinator cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewSummary {
    pub state: String,
    pub body: String,
}

#[async_trait]
pub trait GitHub: Send + Sync {
    /// Open a PR for the branch; returns the PR number.
    async fn open_pr(
        &self,
        workspace: &Path,
        title: &str,
        body: &str,
        branch: &str,
    ) -> Result<u64>;

    async fn merge(&self, pr: u64) -> Result<MergeOutcome>;

    async fn close_pr(&self, pr: u64) -> Result<()>;

    async fn add_label(&self, pr: u64, label: &str) -> Result<()>;

    async fn list_comments(&self, pr: u64) -> Result<Vec<String>>;

    async fn list_reviews(&self, pr: u64) -> Result<Vec<ReviewSummary>>;
}

/// `gh` CLI implementation.
pub struct GhCli {
    repo_dir: std::path::PathBuf,
}

impl GhCli {
    pub fn new(repo_dir: &Path) -> Self {
        Self {
            repo_dir: repo_dir.to_path_buf(),
        }
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("gh")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .context("Failed to run gh")?;
        if !output.status.success() {
            bail!(
                "gh {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl GitHub for GhCli {
    async fn open_pr(
        &self,
        workspace: &Path,
        title: &str,
        body: &str,
        branch: &str,
    ) -> Result<u64> {
        let output = tokio::process::Command::new("gh")
            .args([
                "pr", "create", "--title", title, "--body", body, "--head", branch,
            ])
            .current_dir(workspace)
            .output()
            .await
            .context("Failed to run gh pr create")?;
        if !output.status.success() {
            bail!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        // gh prints the PR URL; the number is its last path segment.
        let url = String::from_utf8_lossy(&output.stdout);
        url.trim()
            .rsplit('/')
            .next()
            .and_then(|n| n.parse().ok())
            .with_context(|| format!("Could not parse PR number from '{}'", url.trim()))
    }

    async fn merge(&self, pr: u64) -> Result<MergeOutcome> {
        let pr_arg = pr.to_string();
        let result = self.gh(&["pr", "merge", &pr_arg, "--squash", "--delete-branch"]).await;
        match result {
            Ok(_) => Ok(MergeOutcome::Merged),
            Err(e) => {
                let message = e.to_string();
                let lower = message.to_lowercase();
                if lower.contains("not mergeable") || lower.contains("conflict") {
                    // Best effort: the PR's file list approximates the
                    // conflicting set for batching purposes.
                    let files = self
                        .gh(&[
                            "pr", "view", &pr_arg, "--json", "files", "--jq",
                            ".files[].path",
                        ])
                        .await
                        .map(|out| out.lines().map(String::from).collect())
                        .unwrap_or_default();
                    Ok(MergeOutcome::Conflict { files })
                } else {
                    Ok(MergeOutcome::Failed { message })
                }
            }
        }
    }

    async fn close_pr(&self, pr: u64) -> Result<()> {
        self.gh(&["pr", "close", &pr.to_string()]).await.map(|_| ())
    }

    async fn add_label(&self, pr: u64, label: &str) -> Result<()> {
        self.gh(&["pr", "edit", &pr.to_string(), "--add-label", label])
            .await
            .map(|_| ())
    }

    async fn list_comments(&self, pr: u64) -> Result<Vec<String>> {
        let out = self
            .gh(&[
                "pr", "view", &pr.to_string(), "--json", "comments", "--jq",
                ".comments[].body",
            ])
            .await?;
        Ok(out.lines().map(String::from).collect())
    }

    async fn list_reviews(&self, pr: u64) -> Result<Vec<ReviewSummary>> {
        let out = self
            .gh(&[
                "pr", "view", &pr.to_string(), "--json", "reviews", "--jq",
                ".reviews[] | \"\\(.state)\\t\\(.body)\"",
            ])
            .await?;
        Ok(out
            .lines()
            .map(|line| {
                let (state, body) = line.split_once('\t').unwrap_or((line, ""));
                ReviewSummary {
                    state: state.to_string(),
                    body: body.to_string(),
                }
            })
            .collect())
    }
}

/// Scriptable GitHub double for tests: merge outcomes are queued per PR and
/// fall back to `Merged` when the queue is empty.
#[derive(Default)]
pub struct MockGitHub {
    next_pr: std::sync::atomic::AtomicU64,
    outcomes: std::sync::Mutex<std::collections::HashMap<u64, std::collections::VecDeque<MergeOutcome>>>,
    merges: std::sync::Mutex<Vec<u64>>,
    labels: std::sync::Mutex<Vec<(u64, String)>>,
}

impl MockGitHub {
    pub fn new() -> Self {
        Self {
            next_pr: std::sync::atomic::AtomicU64::new(100),
            ..Self::default()
        }
    }

    pub fn script_merge(&self, pr: u64, outcome: MergeOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(pr)
            .or_default()
            .push_back(outcome);
    }

    /// PRs merged so far, in order.
    pub fn merged(&self) -> Vec<u64> {
        self.merges.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<(u64, String)> {
        self.labels.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitHub for MockGitHub {
    async fn open_pr(&self, _: &Path, _: &str, _: &str, _: &str) -> Result<u64> {
        Ok(self
            .next_pr
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }

    async fn merge(&self, pr: u64) -> Result<MergeOutcome> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&pr)
            .and_then(|q| q.pop_front())
            .unwrap_or(MergeOutcome::Merged);
        if outcome == MergeOutcome::Merged {
            self.merges.lock().unwrap().push(pr);
        }
        Ok(outcome)
    }

    async fn close_pr(&self, _pr: u64) -> Result<()> {
        Ok(())
    }

    async fn add_label(&self, pr: u64, label: &str) -> Result<()> {
        self.labels.lock().unwrap().push((pr, label.to_string()));
        Ok(())
    }

    async fn list_comments(&self, _pr: u64) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_reviews(&self, _pr: u64) -> Result<Vec<ReviewSummary>> {
        Ok(Vec::new())
    }
}

/// Drives `needs_merge` workers to a terminal or waiting state.
pub struct MergeCoordinator {
    github: Arc<dyn GitHub>,
    engine: Arc<LifecycleEngine>,
}

impl MergeCoordinator {
    pub fn new(github: Arc<dyn GitHub>, engine: Arc<LifecycleEngine>) -> Self {
        Self { github, engine }
    }

    /// Attempt to merge one worker's PR and report the outcome as a
    /// lifecycle event. A worker without a recorded PR counts as a merge
    /// failure (the attempt guard bounds how often this can recur).
    pub async fn process(&self, worker: &WorkerDir) -> Result<MergeOutcome, SchedulerError> {
        let state = worker
            .git_state_store()
            .load()
            .map_err(SchedulerError::Other)?;
        let Some(pr) = state.pr else {
            self.engine.emit_event(
                worker,
                "merge.failed",
                "merge",
                &serde_json::json!({"reason": "no PR recorded for worker"}),
            )?;
            return Ok(MergeOutcome::Failed {
                message: "no PR recorded for worker".into(),
            });
        };

        let outcome = self
            .github
            .merge(pr)
            .await
            .map_err(SchedulerError::Other)?;
        match &outcome {
            MergeOutcome::Merged => {
                tracing::info!(task = %worker.task_id(), pr, "PR merged");
                self.engine.emit_event(
                    worker,
                    "merge.succeeded",
                    "merge",
                    &serde_json::json!({"pr": pr}),
                )?;
            }
            MergeOutcome::Conflict { files } => {
                tracing::warn!(task = %worker.task_id(), pr, ?files, "merge conflict");
                self.engine.emit_event(
                    worker,
                    "merge.conflict",
                    "merge",
                    &serde_json::json!({"pr": pr, "files": files}),
                )?;
            }
            MergeOutcome::Failed { message } => {
                tracing::warn!(task = %worker.task_id(), pr, %message, "merge failed");
                self.engine.emit_event(
                    worker,
                    "merge.failed",
                    "merge",
                    &serde_json::json!({"pr": pr, "reason": message}),
                )?;
            }
        }
        Ok(outcome)
    }
}
