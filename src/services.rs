//! Background service scheduler.
//!
//! Housekeeping services (sync, metrics, pr-review-sync, ...) run alongside
//! the orchestrator on intervals. Each service carries an `if_running`
//! policy (skip or queue), bounded retries with exponential backoff, an
//! optional circuit breaker (open after N consecutive failures, half-open
//! after a cool-down, closed on the first success), and an optional
//! dependency on another service's recent success. All state persists to one
//! JSON file; restored running pids are verified alive before being trusted.

use crate::util::{epoch_secs, pid_alive, read_json, write_json_atomic};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IfRunning {
    /// Skip this firing if the previous run is still going.
    #[default]
    Skip,
    /// Remember the firing and run as soon as the previous run ends.
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Circuit {
    #[default]
    Closed,
    Open {
        since: u64,
    },
    HalfOpen,
}

/// Static definition of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDef {
    pub id: String,
    /// Shell command, run via `sh -c`.
    pub command: String,
    pub interval_secs: u64,
    #[serde(default)]
    pub if_running: IfRunning,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Consecutive failures that open the circuit; 0 disables the breaker.
    #[serde(default)]
    pub circuit_threshold: u32,
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_secs: u64,
    /// This service only fires if the named service has succeeded at least
    /// once.
    #[serde(default)]
    pub depends_on: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    30
}
fn default_circuit_cooldown() -> u64 {
    300
}

/// Persisted per-service state and metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceState {
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub circuit: Circuit,
    #[serde(default)]
    pub last_run_at: Option<u64>,
    #[serde(default)]
    pub last_success_at: Option<u64>,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub next_eligible_at: Option<u64>,
    #[serde(default)]
    pub running_pid: Option<u32>,
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub retries: u32,
    // Metrics
    #[serde(default)]
    pub runs: u64,
    #[serde(default)]
    pub failures: u64,
    #[serde(default)]
    pub total_duration_ms: u64,
}

impl ServiceState {
    pub fn success_rate(&self) -> f64 {
        if self.runs == 0 {
            return 1.0;
        }
        (self.runs - self.failures) as f64 / self.runs as f64
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStates {
    services: HashMap<String, ServiceState>,
}

pub struct ServiceScheduler {
    defs: Vec<ServiceDef>,
    states: HashMap<String, ServiceState>,
    children: HashMap<String, tokio::process::Child>,
    started: HashMap<String, std::time::Instant>,
    state_path: PathBuf,
}

impl ServiceScheduler {
    /// Load persisted state; running pids that no longer exist are cleared.
    pub fn new(defs: Vec<ServiceDef>, state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let mut states = read_json::<PersistedStates>(&state_path)
            .map(|p| p.services)
            .unwrap_or_default();
        for state in states.values_mut() {
            if let Some(pid) = state.running_pid
                && !pid_alive(pid)
            {
                state.running_pid = None;
            }
        }
        Self {
            defs,
            states,
            children: HashMap::new(),
            started: HashMap::new(),
            state_path,
        }
    }

    pub fn state(&self, id: &str) -> Option<&ServiceState> {
        self.states.get(id)
    }

    /// One scheduler pass: harvest finished runs, fire due services,
    /// persist.
    pub async fn tick(&mut self) -> Result<()> {
        self.harvest();
        let now = epoch_secs();

        for def in self.defs.clone() {
            // Circuit handling, in its own borrow scope.
            {
                let state = self.states.entry(def.id.clone()).or_default();
                if let Circuit::Open { since } = state.circuit {
                    if now.saturating_sub(since) >= def.circuit_cooldown_secs {
                        state.circuit = Circuit::HalfOpen;
                        tracing::info!(service = %def.id, "circuit half-open, probing");
                    } else {
                        continue;
                    }
                }
            }

            let (running, interval_due, backoff_ok, queued) = {
                let state = self.states.get(&def.id).expect("state just ensured");
                (
                    state.running_pid.is_some_and(pid_alive),
                    state
                        .last_run_at
                        .map(|t| now.saturating_sub(t) >= def.interval_secs)
                        .unwrap_or(true),
                    state.next_eligible_at.map(|t| now >= t).unwrap_or(true),
                    state.queued,
                )
            };

            if running {
                if def.if_running == IfRunning::Queue {
                    self.states.get_mut(&def.id).expect("present").queued = true;
                }
                continue;
            }
            if !(backoff_ok && (interval_due || queued)) {
                continue;
            }

            // Dependency gate: the other service must have succeeded once.
            if let Some(dep) = &def.depends_on {
                let dep_ok = self
                    .states
                    .get(dep)
                    .and_then(|s| s.last_success_at)
                    .is_some();
                if !dep_ok {
                    continue;
                }
            }

            self.launch(&def, now)?;
        }

        self.persist();
        Ok(())
    }

    fn launch(&mut self, def: &ServiceDef, now: u64) -> Result<()> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&def.command)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        {
            let state = self.states.entry(def.id.clone()).or_default();
            state.queued = false;
            state.last_run_at = Some(now);
        }
        match child {
            Ok(child) => {
                let pid = child.id();
                self.states.get_mut(&def.id).expect("present").running_pid = pid;
                self.children.insert(def.id.clone(), child);
                self.started.insert(def.id.clone(), std::time::Instant::now());
                tracing::debug!(service = %def.id, ?pid, "service launched");
            }
            Err(e) => {
                tracing::warn!(service = %def.id, error = %e, "service spawn failed");
                self.record_completion(&def.id, -1, 0);
            }
        }
        Ok(())
    }

    /// Collect exit statuses of finished runs, including runs inherited
    /// from a previous process (pid known, child handle gone).
    fn harvest(&mut self) {
        let ids: Vec<String> = self.states.keys().cloned().collect();
        for id in ids {
            if let Some(child) = self.children.get_mut(&id) {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let duration_ms = self
                            .started
                            .remove(&id)
                            .map(|t| t.elapsed().as_millis() as u64)
                            .unwrap_or(0);
                        self.children.remove(&id);
                        self.record_completion(&id, status.code().unwrap_or(-1), duration_ms);
                    }
                    Ok(None) => {}
                    Err(_) => {
                        self.children.remove(&id);
                        self.record_completion(&id, -1, 0);
                    }
                }
            } else if let Some(state) = self.states.get_mut(&id)
                && let Some(pid) = state.running_pid
                && !pid_alive(pid)
            {
                // Inherited run ended; the exit code is unknowable.
                state.running_pid = None;
                state.last_run_at = Some(epoch_secs());
            }
        }
    }

    fn record_completion(&mut self, id: &str, exit_code: i32, duration_ms: u64) {
        let Some(def) = self.defs.iter().find(|d| d.id == id).cloned() else {
            return;
        };
        let state = self.states.entry(id.to_string()).or_default();
        state.running_pid = None;
        state.runs += 1;
        state.total_duration_ms += duration_ms;
        state.last_exit_code = Some(exit_code);

        if exit_code == 0 {
            state.consecutive_failures = 0;
            state.retries = 0;
            state.next_eligible_at = None;
            state.last_success_at = Some(epoch_secs());
            if state.circuit != Circuit::Closed {
                tracing::info!(service = %id, "circuit closed");
            }
            state.circuit = Circuit::Closed;
        } else {
            state.failures += 1;
            state.consecutive_failures += 1;
            tracing::warn!(service = %id, exit_code, failures = state.consecutive_failures, "service run failed");

            if def.circuit_threshold > 0 && state.consecutive_failures >= def.circuit_threshold {
                state.circuit = Circuit::Open { since: epoch_secs() };
                tracing::warn!(service = %id, "circuit opened");
            } else if state.retries < def.max_retries {
                // Exponential backoff before the next attempt.
                let delay = def.backoff_secs.saturating_mul(1u64 << state.retries.min(16));
                state.retries += 1;
                state.next_eligible_at = Some(epoch_secs() + delay);
            } else {
                state.retries = 0;
                state.next_eligible_at = None;
            }
        }
        tracing::debug!(
            service = %id,
            duration_ms,
            success_rate = state.success_rate(),
            "service run recorded"
        );
    }

    fn persist(&self) {
        let persisted = PersistedStates {
            services: self.states.clone(),
        };
        if let Err(e) = write_json_atomic(&self.state_path, &persisted) {
            tracing::warn!(error = %e, "could not persist service state");
        }
    }
}

/// Sleep-free helper for tests and the doctor command: run ticks until all
/// launched children have been harvested or the deadline passes.
pub async fn settle(scheduler: &mut ServiceScheduler, deadline: Duration) -> Result<()> {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        scheduler.tick().await?;
        if scheduler.children.is_empty() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
