//! Resume-attempt accounting (`resume-state.json`).
//!
//! Tracks how many times a worker has been resumed and whether it is
//! terminal or cooling down. COMPLETE and ABORT decisions set terminal;
//! DEFER sets a cooldown; RETRY only increments.

use crate::util::{epoch_secs, now_iso, read_json, write_json_atomic};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// One resume attempt, for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeAttempt {
    pub timestamp: String,
    pub decision: String,
    pub pipeline: String,
    pub step: String,
    pub reason: String,
}

/// The persisted accounting record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub last_attempt_at: Option<String>,
    /// Epoch seconds until which the worker must not be resumed.
    #[serde(default)]
    pub cooldown_until: Option<u64>,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub terminal_reason: String,
    #[serde(default)]
    pub history: Vec<ResumeAttempt>,
}

impl Default for ResumeState {
    fn default() -> Self {
        Self {
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_attempt_at: None,
            cooldown_until: None,
            terminal: false,
            terminal_reason: String::new(),
            history: Vec::new(),
        }
    }
}

/// Store wrapping one `resume-state.json` file.
#[derive(Debug, Clone)]
pub struct ResumeStateStore {
    path: PathBuf,
}

impl ResumeStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read(&self) -> Result<ResumeState> {
        if self.path.exists() {
            read_json(&self.path)
        } else {
            Ok(ResumeState::default())
        }
    }

    pub fn write(&self, state: &ResumeState) -> Result<()> {
        write_json_atomic(&self.path, state)
    }

    /// Record a RETRY decision: bump the counter and append history.
    pub fn increment(
        &self,
        decision: &str,
        pipeline: &str,
        step: &str,
        reason: &str,
    ) -> Result<ResumeState> {
        let mut state = self.read()?;
        state.attempt_count += 1;
        state.last_attempt_at = Some(now_iso());
        state.history.push(ResumeAttempt {
            timestamp: now_iso(),
            decision: decision.to_string(),
            pipeline: pipeline.to_string(),
            step: step.to_string(),
            reason: reason.to_string(),
        });
        self.write(&state)?;
        Ok(state)
    }

    pub fn set_terminal(&self, reason: &str) -> Result<()> {
        let mut state = self.read()?;
        state.terminal = true;
        state.terminal_reason = reason.to_string();
        self.write(&state)
    }

    pub fn set_cooldown(&self, seconds: u64) -> Result<()> {
        let mut state = self.read()?;
        state.cooldown_until = Some(epoch_secs() + seconds);
        self.write(&state)
    }

    pub fn is_terminal(&self) -> bool {
        self.read().map(|s| s.terminal).unwrap_or(false)
    }

    pub fn is_cooling(&self) -> bool {
        self.read()
            .ok()
            .and_then(|s| s.cooldown_until)
            .map(|until| epoch_secs() < until)
            .unwrap_or(false)
    }

    pub fn max_exceeded(&self) -> bool {
        self.read()
            .map(|s| s.attempt_count >= s.max_attempts)
            .unwrap_or(false)
    }
}
