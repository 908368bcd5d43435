//! Pipeline data model: ordered typed steps, gate-result mappings and the
//! built-in pipelines (default, fix, resolve, multi-pr-resolve).
//!
//! A pipeline is data, not code: each step names an agent handler, declares
//! routing overrides in its `jump_map`, and carries handler-specific config
//! as raw JSON. Routing vocabulary: `next`, `prev`, `self`, `abort`, or a
//! literal step id.

pub mod executor;
pub mod result_file;

pub use executor::{PipelineExecutor, PipelineOutcome, StepContext};
pub use result_file::StepResult;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Coarse status behind a gate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Success,
    Failure,
    Partial,
    Unknown,
}

/// How an unmapped gate result routes by default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultMapping {
    pub status: GateStatus,
    pub exit_code: i32,
    pub default_jump: String,
}

/// Built-in gate-result mappings. Pipelines may declare more.
pub fn builtin_mappings() -> HashMap<String, ResultMapping> {
    let mut mappings = HashMap::new();
    mappings.insert(
        "PASS".to_string(),
        ResultMapping {
            status: GateStatus::Success,
            exit_code: 0,
            default_jump: "next".to_string(),
        },
    );
    mappings.insert(
        "FAIL".to_string(),
        ResultMapping {
            status: GateStatus::Failure,
            exit_code: 1,
            default_jump: "abort".to_string(),
        },
    );
    mappings.insert(
        "FIX".to_string(),
        ResultMapping {
            status: GateStatus::Partial,
            exit_code: 0,
            default_jump: "prev".to_string(),
        },
    );
    mappings.insert(
        "SKIP".to_string(),
        ResultMapping {
            status: GateStatus::Success,
            exit_code: 0,
            default_jump: "next".to_string(),
        },
    );
    mappings
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Jump {
    Next,
    Prev,
    SelfStep,
    Abort,
    To(String),
}

impl Jump {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "next" => Jump::Next,
            "prev" => Jump::Prev,
            "self" => Jump::SelfStep,
            "abort" => Jump::Abort,
            step_id => Jump::To(step_id.to_string()),
        }
    }
}

/// One pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    /// Agent handler name (`ralph`, `code-review`, `open-pr`, ...).
    pub agent: String,
    /// Read-only steps never commit, whatever `commit_after` says.
    #[serde(default)]
    pub readonly: bool,
    /// Commit the workspace after the step and record it as a recovery
    /// checkpoint.
    #[serde(default)]
    pub commit_after: bool,
    /// Context-flag name gating this step; absent means always enabled.
    #[serde(default)]
    pub enabled_by: Option<String>,
    /// Gate result -> jump target, overriding the mapping defaults.
    #[serde(default)]
    pub jump_map: HashMap<String, String>,
    /// Handler-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Step {
    pub fn new(id: &str, agent: &str) -> Self {
        Self {
            id: id.to_string(),
            agent: agent.to_string(),
            readonly: false,
            commit_after: false,
            enabled_by: None,
            jump_map: HashMap::new(),
            config: serde_json::Value::Null,
        }
    }

    pub fn commit_after(mut self) -> Self {
        self.commit_after = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn enabled_by(mut self, flag: &str) -> Self {
        self.enabled_by = Some(flag.to_string());
        self
    }

    pub fn jump(mut self, gate: &str, target: &str) -> Self {
        self.jump_map.insert(gate.to_string(), target.to_string());
        self
    }

    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Retry budget for retryable handler exits.
    pub fn retry_max(&self) -> u32 {
        self.config
            .get("retry_max")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_u32(&self, key: &str) -> Option<u32> {
        self.config.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
    }
}

/// An ordered list of steps with a name used in resume decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipeline {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Pipeline {
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// The built-in pipeline with this name, if any.
    pub fn builtin(name: &str) -> Option<Pipeline> {
        match name {
            "default" => Some(default_pipeline()),
            "fix" => Some(fix_pipeline()),
            "resolve" => Some(resolve_pipeline()),
            "multi-pr-resolve" => Some(multi_pr_resolve_pipeline()),
            _ => None,
        }
    }
}

/// The worker's `pipeline-config.json`: the pipeline plus runtime context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: Pipeline,
    /// Extra gate mappings beyond the built-ins.
    #[serde(default)]
    pub mappings: HashMap<String, ResultMapping>,
    /// Context flags consulted by `enabled_by`.
    #[serde(default)]
    pub flags: HashMap<String, bool>,
}

impl PipelineConfig {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            mappings: HashMap::new(),
            flags: HashMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline config: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::util::write_json_atomic(path, self)
    }

    /// Built-ins plus this config's extra mappings.
    pub fn effective_mappings(&self) -> HashMap<String, ResultMapping> {
        let mut mappings = builtin_mappings();
        for (gate, mapping) in &self.mappings {
            mappings.insert(gate.clone(), mapping.clone());
        }
        mappings
    }
}

fn default_pipeline() -> Pipeline {
    Pipeline {
        name: "default".to_string(),
        steps: vec![
            Step::new("plan", "planner")
                .readonly()
                .enabled_by("needs_plan"),
            Step::new("execute", "ralph")
                .commit_after()
                .config(serde_json::json!({"prompt_kind": "execute", "retry_max": 2})),
            Step::new("test", "ralph")
                .commit_after()
                .jump("FIX", "execute")
                .config(serde_json::json!({"prompt_kind": "test", "retry_max": 1})),
            Step::new("review", "code-review")
                .readonly()
                .jump("FIX", "execute"),
            Step::new("pr", "open-pr"),
        ],
    }
}

fn fix_pipeline() -> Pipeline {
    Pipeline {
        name: "fix".to_string(),
        steps: vec![
            Step::new("fix", "ralph")
                .commit_after()
                .config(serde_json::json!({"prompt_kind": "fix"})),
            Step::new("push", "git-sync")
                .config(serde_json::json!({"mode": "push"})),
        ],
    }
}

fn resolve_pipeline() -> Pipeline {
    Pipeline {
        name: "resolve".to_string(),
        steps: vec![
            Step::new("sync", "git-sync").config(serde_json::json!({"mode": "fetch"})),
            Step::new("resolve", "ralph")
                .commit_after()
                .config(serde_json::json!({"prompt_kind": "resolve"})),
            Step::new("push", "git-sync")
                .config(serde_json::json!({"mode": "push"})),
        ],
    }
}

fn multi_pr_resolve_pipeline() -> Pipeline {
    Pipeline {
        name: "multi-pr-resolve".to_string(),
        steps: vec![
            Step::new("wait-turn", "batch-wait-turn"),
            Step::new("sync", "git-sync").config(serde_json::json!({"mode": "fetch"})),
            Step::new("plan", "planner")
                .readonly()
                .enabled_by("batch_lead"),
            Step::new("apply-plan", "ralph")
                .commit_after()
                .config(serde_json::json!({"prompt_kind": "apply_plan"})),
            Step::new("push", "git-sync")
                .config(serde_json::json!({"mode": "push"})),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_builtin_mappings_default_jumps() {
        let mappings = builtin_mappings();
        assert_eq!(mappings["PASS"].default_jump, "next");
        assert_eq!(mappings["FAIL"].default_jump, "abort");
        assert_eq!(mappings["FIX"].default_jump, "prev");
        assert_eq!(mappings["SKIP"].default_jump, "next");
        assert_eq!(mappings["PASS"].status, GateStatus::Success);
    }

    #[test]
    fn test_jump_parse() {
        assert_eq!(Jump::parse("next"), Jump::Next);
        assert_eq!(Jump::parse("prev"), Jump::Prev);
        assert_eq!(Jump::parse("self"), Jump::SelfStep);
        assert_eq!(Jump::parse("abort"), Jump::Abort);
        assert_eq!(Jump::parse("execute"), Jump::To("execute".into()));
    }

    #[test]
    fn test_builtin_pipelines_exist() {
        for name in ["default", "fix", "resolve", "multi-pr-resolve"] {
            let pipeline = Pipeline::builtin(name).unwrap();
            assert_eq!(pipeline.name, name);
            assert!(!pipeline.steps.is_empty());
        }
        assert!(Pipeline::builtin("nope").is_none());
    }

    #[test]
    fn test_default_pipeline_shape() {
        let pipeline = Pipeline::builtin("default").unwrap();
        let ids: Vec<_> = pipeline.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["plan", "execute", "test", "review", "pr"]);

        let plan = &pipeline.steps[0];
        assert!(plan.readonly);
        assert_eq!(plan.enabled_by.as_deref(), Some("needs_plan"));

        let test = &pipeline.steps[2];
        assert!(test.commit_after);
        assert_eq!(test.jump_map.get("FIX").map(String::as_str), Some("execute"));
        assert_eq!(test.retry_max(), 1);
    }

    #[test]
    fn test_multi_pr_resolve_waits_first() {
        let pipeline = Pipeline::builtin("multi-pr-resolve").unwrap();
        assert_eq!(pipeline.steps[0].agent, "batch-wait-turn");
    }

    #[test]
    fn test_pipeline_config_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline-config.json");
        let mut config = PipelineConfig::new(Pipeline::builtin("default").unwrap());
        config.flags.insert("needs_plan".into(), true);
        config.mappings.insert(
            "RETRY".into(),
            ResultMapping {
                status: GateStatus::Partial,
                exit_code: 0,
                default_jump: "self".into(),
            },
        );
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.pipeline, config.pipeline);
        assert_eq!(loaded.flags["needs_plan"], true);
        let effective = loaded.effective_mappings();
        assert!(effective.contains_key("PASS"));
        assert_eq!(effective["RETRY"].default_jump, "self");
    }

    #[test]
    fn test_custom_mapping_overrides_builtin() {
        let mut config = PipelineConfig::new(Pipeline::builtin("fix").unwrap());
        config.mappings.insert(
            "FAIL".into(),
            ResultMapping {
                status: GateStatus::Failure,
                exit_code: 1,
                default_jump: "self".into(),
            },
        );
        assert_eq!(config.effective_mappings()["FAIL"].default_jump, "self");
    }
}
