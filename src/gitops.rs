//! Git plumbing for worker workspaces.
//!
//! In-repo operations (snapshot commits, diffs, resets) go through libgit2;
//! operations that touch the remote or the worktree registry (fetch, rebase,
//! force-push, worktree add/remove) shell out to the `git` binary, which is
//! what owns that behavior in the field.

use anyhow::{Context, Result, bail};
use git2::{DiffOptions, Repository, Signature};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Stage everything and create a snapshot commit. Returns the commit sha.
/// Handles the unborn-branch case for fresh workspaces.
pub fn snapshot_commit(workspace: &Path, message: &str) -> Result<String> {
    let repo = Repository::open(workspace).context("Failed to open git repository")?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now("foreman", "foreman@localhost")?;

    let head = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let commit_id = match head {
        Some(parent) => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?,
        None => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
    };
    Ok(commit_id.to_string())
}

/// Paths changed between a snapshot commit and the current working tree,
/// untracked files included.
pub fn changed_files_since(workspace: &Path, before_sha: &str) -> Result<Vec<PathBuf>> {
    let repo = Repository::open(workspace).context("Failed to open git repository")?;
    let before = repo.find_commit(git2::Oid::from_str(before_sha)?)?;
    let before_tree = before.tree()?;

    let mut opts = DiffOptions::new();
    opts.include_untracked(true);
    let diff = repo.diff_tree_to_workdir_with_index(Some(&before_tree), Some(&mut opts))?;

    let mut files = Vec::new();
    diff.foreach(
        &mut |delta, _| {
            if let Some(path) = delta.new_file().path() {
                files.push(path.to_path_buf());
            }
            true
        },
        None,
        None,
        None,
    )?;
    files.sort();
    files.dedup();
    Ok(files)
}

/// Hard-reset the workspace to a commit, discarding uncommitted work.
pub fn reset_hard(workspace: &Path, sha: &str) -> Result<()> {
    let repo = Repository::open(workspace).context("Failed to open git repository")?;
    let object = repo.find_object(git2::Oid::from_str(sha)?, None)?;
    repo.reset(&object, git2::ResetType::Hard, None)?;
    Ok(())
}

/// Sha of HEAD, or None on an unborn branch.
pub fn head_sha(workspace: &Path) -> Option<String> {
    let repo = Repository::open(workspace).ok()?;
    let head = repo.head().ok()?.peel_to_commit().ok()?;
    Some(head.id().to_string())
}

/// Subject lines of the most recent commits, newest first.
pub fn recent_commits(workspace: &Path, limit: usize) -> Vec<String> {
    let Ok(repo) = Repository::open(workspace) else {
        return Vec::new();
    };
    let Ok(mut walk) = repo.revwalk() else {
        return Vec::new();
    };
    if walk.push_head().is_err() {
        return Vec::new();
    }
    walk.filter_map(|oid| oid.ok())
        .take(limit)
        .filter_map(|oid| {
            repo.find_commit(oid)
                .ok()
                .and_then(|c| c.summary().map(String::from))
        })
        .collect()
}

/// Name of the branch the workspace is on.
pub fn current_branch(workspace: &Path) -> Result<String> {
    let repo = Repository::open(workspace).context("Failed to open git repository")?;
    let head = repo.head().context("Workspace has no HEAD")?;
    head.shorthand()
        .map(String::from)
        .context("HEAD is not a named branch")
}

/// Whether a directory is inside a git work tree.
pub fn is_git_workspace(workspace: &Path) -> bool {
    Repository::open(workspace).is_ok()
}

/// Create a worktree for `branch` off `base` at `dest`.
pub fn worktree_add(repo_root: &Path, dest: &Path, branch: &str, base: &str) -> Result<()> {
    run_git(
        repo_root,
        &[
            "worktree",
            "add",
            "-b",
            branch,
            &dest.to_string_lossy(),
            base,
        ],
    )?;
    Ok(())
}

/// Remove a worker's worktree. Prunes the registry in the main repository
/// when it can be found; tolerates a workspace that is already gone.
pub fn remove_worktree(workspace: &Path) -> Result<()> {
    if !workspace.exists() {
        return Ok(());
    }
    let common_dir = git_output(workspace, &["rev-parse", "--git-common-dir"]).ok();
    std::fs::remove_dir_all(workspace)
        .with_context(|| format!("Failed to remove {}", workspace.display()))?;
    if let Some(common) = common_dir {
        let common = PathBuf::from(common.trim());
        if let Some(main_repo) = common.parent() {
            let _ = run_git(main_repo, &["worktree", "prune"]);
        }
    }
    Ok(())
}

/// Rebase the workspace branch onto the remote default branch and
/// force-push-with-lease. Returns false (after aborting the rebase) when the
/// rebase hits conflicts; idempotent on an already-rebased branch.
pub fn rebase_onto_default(workspace: &Path, default_branch: &str) -> Result<bool> {
    run_git(workspace, &["fetch", "origin", default_branch])?;
    let target = format!("origin/{}", default_branch);
    if run_git(workspace, &["rebase", &target]).is_err() {
        let _ = run_git(workspace, &["rebase", "--abort"]);
        return Ok(false);
    }
    run_git(workspace, &["push", "--force-with-lease", "origin", "HEAD"])?;
    Ok(true)
}

/// Fetch and fast-forward the workspace onto its upstream.
pub fn sync_with_remote(workspace: &Path) -> Result<()> {
    run_git(workspace, &["fetch", "origin"])?;
    run_git(workspace, &["pull", "--ff-only"])?;
    Ok(())
}

/// Push the current branch, creating the upstream if needed.
pub fn push_branch(workspace: &Path, branch: &str) -> Result<()> {
    run_git(workspace, &["push", "--set-upstream", "origin", branch])?;
    Ok(())
}

fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run git {:?}", args))?;
    if !output.status.success() {
        bail!(
            "git {:?} failed ({}): {}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn git_output(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run git {:?}", args))?;
    if !output.status.success() {
        bail!(
            "git {:?} failed ({}): {}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
