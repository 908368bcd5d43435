//! Single-shot agents: one backend call, tags out, result file written.
//!
//! Used for code-review, the multi-PR planner and the resume decider. The
//! gate result is whatever the `<result>` tag says; a clean exit without a
//! tag is an output-missing failure, not a pass.

use super::{AgentHost, system_prompt};
use crate::errors::{PipelineError, exit};
use crate::pipeline::{Step, StepResult};
use crate::runtime::ExecParams;
use crate::util::epoch_secs;
use crate::worker::WorkerDir;
use regex::Regex;
use std::sync::LazyLock;

static RESULT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<result>\s*([A-Z_]+)\s*</result>").unwrap());

pub(super) async fn run(
    host: &AgentHost,
    worker: &WorkerDir,
    step: &Step,
) -> Result<StepResult, PipelineError> {
    // Prerequisites first: a missing required path fails the step without
    // spending a backend call.
    if let Some(required) = step.config.get("required_paths").and_then(|v| v.as_array()) {
        for raw in required.iter().filter_map(|v| v.as_str()) {
            let path = worker.path().join(raw);
            if !path.exists() {
                return Ok(StepResult::fail(
                    &step.id,
                    &step.agent,
                    exit::AGENT_PREREQ_MISSING,
                    &format!("required path missing: {}", raw),
                ));
            }
        }
    }

    let kind = step.config_str("prompt_kind").unwrap_or(&step.agent);
    let prd = std::fs::read_to_string(worker.prd()).unwrap_or_default();
    let extra = step.config_str("prompt_context").unwrap_or("");
    let user_prompt = format!(
        "## TASK\n\n{}\n{}\n\nRespond with your analysis and a final \
         <result>...</result> tag.",
        prd, extra
    );

    let log_path = worker
        .logs_dir()
        .join(format!("{}-0-{}.log", step.id, epoch_secs()));
    let outcome = host
        .runtime
        .exec_once(&ExecParams {
            workspace: &worker.workspace(),
            system_prompt: &system_prompt(kind),
            user_prompt: &user_prompt,
            log_path: &log_path,
            max_turns: host.config.max_turns,
            wrap: true,
        })
        .await?;

    let log = std::fs::read_to_string(&log_path).unwrap_or_default();
    let text = host
        .runtime
        .backend()
        .extract_text(&log)
        .unwrap_or_else(|| log.clone());

    // The report keeps the agent's prose for humans.
    let report_path = worker.reports_dir().join(format!("{}-report.md", step.id));
    let _ = std::fs::write(&report_path, &text);

    let Some(gate) = RESULT_TAG.captures(&log).map(|c| c[1].to_string()) else {
        return Ok(StepResult::fail(
            &step.id,
            &step.agent,
            exit::AGENT_OUTPUT_MISSING,
            "agent finished without a result tag",
        ));
    };

    let mut result = StepResult::new(&step.id, &step.agent, &gate, outcome.exit_code)
        .with_output("report", serde_json::json!(report_path.to_string_lossy()));
    if let Some(session) = outcome.session_id {
        result = result.with_output("session_id", serde_json::json!(session));
    }

    // The planner's deliverable is a JSON plan; persist it where the step
    // config points so batch members can read it.
    if step.agent == "planner"
        && let Some(plan) = crate::util::extract_json_object(&text)
    {
        if let Some(plan_path) = step.config_str("plan_path") {
            let path = std::path::Path::new(plan_path);
            crate::util::write_atomic(path, plan.as_bytes())
                .map_err(PipelineError::Other)?;
            result = result.with_output("plan_path", serde_json::json!(plan_path));
        }
        result = result.with_output(
            "plan",
            serde_json::from_str(&plan).unwrap_or(serde_json::Value::Null),
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::mock_host;
    use crate::pipeline::Step;
    use crate::runtime::{MockBackend, MockTurn};
    use tempfile::tempdir;

    fn turn(result: &str) -> MockTurn {
        MockTurn::pass(&format!(r#"{{"type":"result","result":"{}"}}"#, result))
    }

    #[tokio::test]
    async fn test_gate_comes_from_result_tag() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Review me").unwrap();

        let (host, _) = mock_host(MockBackend::new(vec![turn(
            "Looks wrong in two places. <result>FIX</result>",
        )]));
        let step = Step::new("review", "code-review");
        let result = run(&host, &worker, &step).await.unwrap();
        assert_eq!(result.gate_result, "FIX");

        // Report written for humans
        let report = std::fs::read_to_string(
            worker.reports_dir().join("review-report.md"),
        )
        .unwrap();
        assert!(report.contains("two places"));
    }

    #[tokio::test]
    async fn test_missing_tag_is_output_missing() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Task").unwrap();

        let (host, _) = mock_host(MockBackend::new(vec![turn("I forgot the tag")]));
        let result = run(&host, &worker, &Step::new("review", "code-review"))
            .await
            .unwrap();
        assert_eq!(result.gate_result, "FAIL");
        assert_eq!(result.exit_code, exit::AGENT_OUTPUT_MISSING);
    }

    #[tokio::test]
    async fn test_missing_prerequisite_fails_without_backend_call() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();

        let (host, backend) = mock_host(MockBackend::always_pass());
        let step = Step::new("review", "code-review")
            .config(serde_json::json!({"required_paths": ["pr_url.txt"]}));
        let result = run(&host, &worker, &step).await.unwrap();
        assert_eq!(result.exit_code, exit::AGENT_PREREQ_MISSING);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_planner_extracts_and_persists_plan() {
        let dir = tempdir().unwrap();
        let worker = WorkerDir::create(dir.path(), "AB-1").unwrap();
        std::fs::write(worker.prd(), "Plan the batch").unwrap();
        let plan_path = dir.path().join("batch-plan.json");

        let (host, _) = mock_host(MockBackend::new(vec![turn(
            r#"Here: {\"prs\": [{\"task\": \"AB-1\", \"hint\": \"keep ours\"}]} <result>PASS</result>"#,
        )]));
        let step = Step::new("plan", "planner").config(serde_json::json!({
            "plan_path": plan_path.to_string_lossy(),
        }));
        let result = run(&host, &worker, &step).await.unwrap();
        assert_eq!(result.gate_result, "PASS");
        assert!(plan_path.exists());
        let plan: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&plan_path).unwrap()).unwrap();
        assert_eq!(plan["prs"][0]["hint"], "keep ours");
    }
}
