//! Step result files.
//!
//! Every step — LLM or deterministic — funnels its outcome into one JSON
//! file under `<worker>/results/`, named `<epoch>-<step-id>-result.json`.
//! The pipeline executor routes on these files and the parent orchestrator
//! reads only them; no error crosses a process boundary any other way.

use crate::util::{epoch_secs, now_iso, read_json, write_json_atomic};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The on-disk result schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub agent: String,
    /// One of the pipeline's declared gate values (PASS/FAIL/FIX/SKIP/...).
    pub gate_result: String,
    pub exit_code: i32,
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub timestamp: String,
}

impl StepResult {
    pub fn new(step_id: &str, agent: &str, gate_result: &str, exit_code: i32) -> Self {
        Self {
            step_id: step_id.to_string(),
            agent: agent.to_string(),
            gate_result: gate_result.to_string(),
            exit_code,
            outputs: serde_json::Map::new(),
            errors: Vec::new(),
            timestamp: now_iso(),
        }
    }

    pub fn pass(step_id: &str, agent: &str) -> Self {
        Self::new(step_id, agent, "PASS", 0)
    }

    pub fn fail(step_id: &str, agent: &str, exit_code: i32, error: &str) -> Self {
        let mut result = Self::new(step_id, agent, "FAIL", exit_code);
        if !error.is_empty() {
            result.errors.push(error.to_string());
        }
        result
    }

    pub fn with_output(mut self, key: &str, value: serde_json::Value) -> Self {
        self.outputs.insert(key.to_string(), value);
        self
    }

    pub fn output_str(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).and_then(|v| v.as_str())
    }

    /// Write into `results_dir` under the canonical name. Returns the path.
    pub fn write(&self, results_dir: &Path) -> Result<PathBuf> {
        let path = results_dir.join(format!("{}-{}-result.json", epoch_secs(), self.step_id));
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    /// The newest result for a step, by the epoch prefix in the file name.
    pub fn latest_for_step(results_dir: &Path, step_id: &str) -> Option<StepResult> {
        let suffix = format!("-{}-result.json", step_id);
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(results_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().ends_with(&suffix))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();
        let path = candidates.pop()?;
        read_json(&path).ok()
    }

    /// Every result in the directory, oldest first.
    pub fn all(results_dir: &Path) -> Vec<StepResult> {
        let Ok(entries) = std::fs::read_dir(results_dir) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().ends_with("-result.json"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        paths.iter().filter_map(|p| read_json(p).ok()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let result = StepResult::pass("execute", "ralph")
            .with_output("files_modified", serde_json::json!(["src/a.rs"]));
        let path = result.write(dir.path()).unwrap();
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .ends_with("-execute-result.json")
        );

        let loaded = StepResult::latest_for_step(dir.path(), "execute").unwrap();
        assert_eq!(loaded.gate_result, "PASS");
        assert_eq!(loaded.exit_code, 0);
        assert_eq!(
            loaded.outputs.get("files_modified"),
            Some(&serde_json::json!(["src/a.rs"]))
        );
    }

    #[test]
    fn test_latest_prefers_newest_epoch() {
        let dir = tempdir().unwrap();
        // Write two results with forced epoch prefixes
        let old = StepResult::new("test", "ralph", "FAIL", 59);
        write_json_atomic(&dir.path().join("100-test-result.json"), &old).unwrap();
        let new = StepResult::pass("test", "ralph");
        write_json_atomic(&dir.path().join("200-test-result.json"), &new).unwrap();

        let latest = StepResult::latest_for_step(dir.path(), "test").unwrap();
        assert_eq!(latest.gate_result, "PASS");
    }

    #[test]
    fn test_latest_matches_exact_step_only() {
        let dir = tempdir().unwrap();
        let result = StepResult::pass("pr", "open-pr");
        write_json_atomic(&dir.path().join("100-pr-result.json"), &result).unwrap();
        assert!(StepResult::latest_for_step(dir.path(), "review").is_none());
        assert!(StepResult::latest_for_step(dir.path(), "pr").is_some());
    }

    #[test]
    fn test_fail_carries_error() {
        let result = StepResult::fail("execute", "ralph", 59, "output missing");
        assert_eq!(result.gate_result, "FAIL");
        assert_eq!(result.errors, vec!["output missing"]);
    }

    #[test]
    fn test_empty_outputs_permitted() {
        let dir = tempdir().unwrap();
        StepResult::pass("sync", "git-sync").write(dir.path()).unwrap();
        let loaded = StepResult::latest_for_step(dir.path(), "sync").unwrap();
        assert!(loaded.outputs.is_empty());
        assert!(loaded.errors.is_empty());
    }
}
