//! Kanban store: the project's master task list in one Markdown file.
//!
//! Each task is a list item of the exact form
//! `- [<S>] **[<ID>]** <brief>` followed by indented sub-lines declaring
//! `Description:`, `Priority:` and `Dependencies:`. Every mutating operation
//! runs under an exclusive file lock with bounded retries, and writes go
//! through write-to-temp + rename so concurrent readers never observe a
//! corrupt interleaving.

use crate::errors::KanbanError;
use crate::util::{with_file_lock, write_atomic};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static TASK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- \[(.)\] \*\*\[([A-Z]{2,10}-[0-9]{1,4})\]\*\* (.*)$").unwrap()
});

static TASK_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2,10}-[0-9]{1,4}$").unwrap());

/// Kanban status, one character per task line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// `' '` — ready to be picked up
    #[default]
    Pending,
    /// `'='` — a worker is on it
    InProgress,
    /// `'P'` — PR open, pending approval/merge
    PendingApproval,
    /// `'x'` — merged to the default branch
    Done,
    /// `'*'` — terminally failed
    Failed,
    /// `'N'` — will not be planned
    NotPlanned,
}

impl TaskStatus {
    pub fn as_char(self) -> char {
        match self {
            TaskStatus::Pending => ' ',
            TaskStatus::InProgress => '=',
            TaskStatus::PendingApproval => 'P',
            TaskStatus::Done => 'x',
            TaskStatus::Failed => '*',
            TaskStatus::NotPlanned => 'N',
        }
    }

    pub fn from_char(ch: char) -> Result<Self, KanbanError> {
        match ch {
            ' ' => Ok(TaskStatus::Pending),
            '=' => Ok(TaskStatus::InProgress),
            'P' => Ok(TaskStatus::PendingApproval),
            'x' => Ok(TaskStatus::Done),
            '*' => Ok(TaskStatus::Failed),
            'N' => Ok(TaskStatus::NotPlanned),
            other => Err(KanbanError::InvalidStatus { ch: other }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::NotPlanned
        )
    }
}

/// One task parsed from the kanban file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub brief: String,
    pub priority: i32,
    pub deps: Vec<String>,
    pub has_plan: bool,
}

/// The set of tasks eligible for scheduling, plus diagnostics.
#[derive(Debug, Default)]
pub struct ReadySet {
    /// Pending tasks with all dependencies done, in file order.
    pub ready: Vec<Task>,
    /// Task ids participating in a dependency cycle (reported, never picked).
    pub cycles: Vec<String>,
}

/// Per-status counts for the status display.
#[derive(Debug, Default, Clone, Serialize)]
pub struct KanbanReport {
    pub pending: usize,
    pub in_progress: usize,
    pub pending_approval: usize,
    pub done: usize,
    pub failed: usize,
    pub not_planned: usize,
}

impl KanbanReport {
    pub fn total(&self) -> usize {
        self.pending
            + self.in_progress
            + self.pending_approval
            + self.done
            + self.failed
            + self.not_planned
    }
}

/// Handle on the kanban file. Cheap to clone; all state is on disk.
#[derive(Debug, Clone)]
pub struct KanbanStore {
    path: PathBuf,
    plans_dir: PathBuf,
}

impl KanbanStore {
    pub fn new(path: impl Into<PathBuf>, plans_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            plans_dir: plans_dir.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse every task in file order.
    pub fn get_all_tasks(&self) -> Result<Vec<Task>, KanbanError> {
        let content = self.read()?;
        Ok(self.parse(&content))
    }

    /// Tasks whose status is pending and whose dependencies are all done.
    ///
    /// Self-dependent tasks and members of dependency cycles are excluded
    /// from the ready set and reported in `cycles`. The snapshot is taken
    /// under the kanban lock so invariant §8.7 holds at pick time.
    pub fn get_ready_tasks(&self, exclude_in_progress: bool) -> Result<ReadySet, KanbanError> {
        let tasks = with_file_lock(&self.path, || {
            let content = self.read()?;
            Ok(self.parse(&content))
        })
        .map_err(KanbanError::Other)?;

        let by_id: HashMap<&str, &Task> =
            tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let cyclic = find_cycles(&tasks);

        let mut ready = Vec::new();
        for task in &tasks {
            let candidate = match task.status {
                TaskStatus::Pending => true,
                // Callers resuming interrupted runs ask for in-progress too.
                TaskStatus::InProgress => !exclude_in_progress,
                _ => false,
            };
            if !candidate {
                continue;
            }
            if cyclic.contains(&task.id) {
                continue;
            }
            let deps_done = task.deps.iter().all(|d| {
                by_id
                    .get(d.as_str())
                    .map(|t| t.status == TaskStatus::Done)
                    .unwrap_or(false)
            });
            if deps_done {
                ready.push(task.clone());
            }
        }

        let mut cycles: Vec<String> = cyclic.into_iter().collect();
        cycles.sort();
        Ok(ReadySet { ready, cycles })
    }

    /// Atomically substitute the status character of one task, preserving
    /// all other line content. Fails if the task is not present.
    pub fn set_status(&self, id: &str, new_status: TaskStatus) -> Result<(), KanbanError> {
        if !TASK_ID.is_match(id) {
            return Err(KanbanError::InvalidTaskId { id: id.to_string() });
        }
        with_file_lock(&self.path, || {
            let content = self.read().map_err(anyhow::Error::from)?;
            let needle = format!("**[{}]**", id);
            let mut found = false;
            let mut lines: Vec<String> = Vec::with_capacity(content.lines().count());
            for line in content.lines() {
                if !found && line.contains(&needle) && TASK_LINE.is_match(line) {
                    // "- [" is 4 bytes; the status char sits at byte 3.
                    let mut rebuilt = String::with_capacity(line.len());
                    rebuilt.push_str("- [");
                    rebuilt.push(new_status.as_char());
                    rebuilt.push_str(&line[4..]);
                    lines.push(rebuilt);
                    found = true;
                } else {
                    lines.push(line.to_string());
                }
            }
            if !found {
                return Err(anyhow::Error::new(KanbanError::TaskNotFound {
                    id: id.to_string(),
                }));
            }
            let mut out = lines.join("\n");
            if content.ends_with('\n') {
                out.push('\n');
            }
            write_atomic(&self.path, out.as_bytes())
        })
        .map_err(|e| match e.downcast::<KanbanError>() {
            Ok(k) => k,
            Err(other) => KanbanError::Other(other),
        })
    }

    /// Whether a plan file exists for the task.
    pub fn has_plan(&self, id: &str) -> bool {
        self.plans_dir.join(format!("{}-plan.md", id)).exists()
    }

    /// Length of the longest dependency chain below this task.
    /// A task with no dependencies has depth 0; cycles contribute nothing.
    pub fn get_dependency_depth(&self, id: &str) -> Result<u32, KanbanError> {
        let tasks = self.get_all_tasks()?;
        let by_id: HashMap<&str, &Task> =
            tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        if !by_id.contains_key(id) {
            return Err(KanbanError::TaskNotFound { id: id.to_string() });
        }
        let mut memo: HashMap<String, u32> = HashMap::new();
        let mut visiting: HashSet<String> = HashSet::new();
        Ok(depth_of(id, &by_id, &mut memo, &mut visiting))
    }

    /// Per-status counts.
    pub fn report(&self) -> Result<KanbanReport, KanbanError> {
        let mut report = KanbanReport::default();
        for task in self.get_all_tasks()? {
            match task.status {
                TaskStatus::Pending => report.pending += 1,
                TaskStatus::InProgress => report.in_progress += 1,
                TaskStatus::PendingApproval => report.pending_approval += 1,
                TaskStatus::Done => report.done += 1,
                TaskStatus::Failed => report.failed += 1,
                TaskStatus::NotPlanned => report.not_planned += 1,
            }
        }
        Ok(report)
    }

    fn read(&self) -> Result<String, KanbanError> {
        std::fs::read_to_string(&self.path).map_err(|source| KanbanError::ReadFailed {
            path: self.path.clone(),
            source,
        })
    }

    fn parse(&self, content: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = Vec::new();
        for line in content.lines() {
            if let Some(caps) = TASK_LINE.captures(line) {
                let status_ch = caps[1].chars().next().unwrap_or(' ');
                let Ok(status) = TaskStatus::from_char(status_ch) else {
                    continue;
                };
                let id = caps[2].to_string();
                let has_plan = self.has_plan(&id);
                tasks.push(Task {
                    id,
                    status,
                    brief: caps[3].trim().to_string(),
                    priority: 100,
                    deps: Vec::new(),
                    has_plan,
                });
            } else if let Some(task) = tasks.last_mut() {
                let trimmed = line.trim_start().trim_start_matches("- ").trim();
                if let Some(value) = trimmed.strip_prefix("Priority:") {
                    if let Ok(p) = value.trim().parse() {
                        task.priority = p;
                    }
                } else if let Some(value) = trimmed.strip_prefix("Dependencies:") {
                    let value = value.trim();
                    if !value.eq_ignore_ascii_case("none") && !value.is_empty() {
                        task.deps = value
                            .split(',')
                            .map(|d| d.trim().to_string())
                            .filter(|d| !d.is_empty())
                            .collect();
                    }
                }
            }
        }
        tasks
    }
}

/// All task ids that participate in a dependency cycle (self-loops included),
/// found by DFS with a visiting set.
fn find_cycles(tasks: &[Task]) -> HashSet<String> {
    let deps: HashMap<&str, &Vec<String>> =
        tasks.iter().map(|t| (t.id.as_str(), &t.deps)).collect();

    let mut cyclic: HashSet<String> = HashSet::new();
    let mut done: HashSet<&str> = HashSet::new();

    for task in tasks {
        if done.contains(task.id.as_str()) {
            continue;
        }
        let mut visiting: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        dfs(
            task.id.as_str(),
            &deps,
            &mut visiting,
            &mut on_path,
            &mut done,
            &mut cyclic,
        );
    }
    cyclic
}

fn dfs<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, &'a Vec<String>>,
    visiting: &mut Vec<&'a str>,
    on_path: &mut HashSet<&'a str>,
    done: &mut HashSet<&'a str>,
    cyclic: &mut HashSet<String>,
) {
    if done.contains(id) {
        return;
    }
    if on_path.contains(id) {
        // Everyone from the first occurrence of `id` on the path is cyclic.
        let start = visiting.iter().position(|v| *v == id).unwrap_or(0);
        for member in &visiting[start..] {
            cyclic.insert((*member).to_string());
        }
        return;
    }
    visiting.push(id);
    on_path.insert(id);
    if let Some(children) = deps.get(id) {
        for child in children.iter() {
            if child == id {
                cyclic.insert(id.to_string());
            } else if deps.contains_key(child.as_str()) {
                dfs(child.as_str(), deps, visiting, on_path, done, cyclic);
            }
        }
    }
    visiting.pop();
    on_path.remove(id);
    done.insert(id);
}

fn depth_of(
    id: &str,
    by_id: &HashMap<&str, &Task>,
    memo: &mut HashMap<String, u32>,
    visiting: &mut HashSet<String>,
) -> u32 {
    if let Some(d) = memo.get(id) {
        return *d;
    }
    if !visiting.insert(id.to_string()) {
        return 0;
    }
    let depth = by_id
        .get(id)
        .map(|t| {
            t.deps
                .iter()
                .filter(|d| by_id.contains_key(d.as_str()))
                .map(|d| depth_of(d, by_id, memo, visiting) + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    visiting.remove(id);
    memo.insert(id.to_string(), depth);
    depth
}
