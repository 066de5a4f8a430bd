//! Run-state persistence.
//!
//! Two schema-versioned documents: the per-run `RunState` under
//! `runs/<id>/run_state.json` and the repo-wide `HarnessState` pointer at
//! `state/state.json`. Both are written atomically (temp file then rename)
//! so a crash mid-write never leaves a torn document; readers see either the
//! old state or the new one.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::LifecycleStatus;
use crate::io::events::utc_now_iso;
use crate::io::paths::HarnessPaths;

pub const RUN_STATE_SCHEMA_VERSION: u32 = 1;
pub const HARNESS_STATE_SCHEMA_VERSION: u32 = 1;

/// Checkpoint a forked run shares history with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkPoint {
    pub run_id: String,
    /// Last session number adopted from the source run.
    pub at_session: u32,
}

/// Durable state of one run. The single source of truth for resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    pub run_id: String,
    /// Operator-supplied task text handed to the provider each session.
    pub task: String,
    pub status: LifecycleStatus,
    /// Session record filenames, in dispatch order. A session appears here
    /// only after its record is sealed.
    pub sessions: Vec<String>,
    pub require_eval_pass: bool,
    /// Consecutive sessions with no actions and no status advance.
    pub no_progress_streak: u32,
    pub failed_sessions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<ForkPoint>,
    pub updated_at: String,
}

impl RunState {
    pub fn new(run_id: &str, task: &str, require_eval_pass: bool) -> Self {
        Self {
            schema_version: RUN_STATE_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            task: task.to_string(),
            status: LifecycleStatus::Pending,
            sessions: Vec::new(),
            require_eval_pass,
            no_progress_streak: 0,
            failed_sessions: 0,
            forked_from: None,
            updated_at: utc_now_iso(),
        }
    }

    /// Next session number (1-based).
    pub fn next_session(&self) -> u32 {
        self.sessions.len() as u32 + 1
    }
}

/// Repo-wide pointer to the most recent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessState {
    pub schema_version: u32,
    pub last_run_id: Option<String>,
    pub updated_at: String,
}

impl Default for HarnessState {
    fn default() -> Self {
        Self {
            schema_version: HARNESS_STATE_SCHEMA_VERSION,
            last_run_id: None,
            updated_at: utc_now_iso(),
        }
    }
}

/// Pretty JSON with a trailing newline, written via temp file then rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let mut rendered = serde_json::to_string_pretty(value).context("serialize json")?;
    rendered.push('\n');
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, rendered).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Load a run's state, failing loudly on schema drift.
pub fn load_run_state(paths: &HarnessPaths, run_id: &str) -> Result<RunState> {
    let path = paths.run_state_path(run_id);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&raw)
        .with_context(|| format!("parse run state {}", path.display()))?;
    anyhow::ensure!(
        state.schema_version == RUN_STATE_SCHEMA_VERSION,
        "run state {} has schema version {} (supported: {})",
        path.display(),
        state.schema_version,
        RUN_STATE_SCHEMA_VERSION
    );
    Ok(state)
}

/// Persist a run's state atomically, stamping `updated_at`.
pub fn write_run_state(paths: &HarnessPaths, state: &mut RunState) -> Result<()> {
    state.updated_at = utc_now_iso();
    let path = paths.run_state_path(&state.run_id);
    write_json_atomic(&path, state)?;
    debug!(run_id = %state.run_id, status = ?state.status, "wrote run state");
    Ok(())
}

pub fn load_harness_state(paths: &HarnessPaths) -> Result<HarnessState> {
    let path = paths.state_path();
    if !path.exists() {
        return Ok(HarnessState::default());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read state {}", path.display()))?;
    let state: HarnessState = serde_json::from_str(&raw)
        .with_context(|| format!("parse state {}", path.display()))?;
    anyhow::ensure!(
        state.schema_version == HARNESS_STATE_SCHEMA_VERSION,
        "state {} has schema version {} (supported: {})",
        path.display(),
        state.schema_version,
        HARNESS_STATE_SCHEMA_VERSION
    );
    Ok(state)
}

pub fn write_harness_state(paths: &HarnessPaths, state: &mut HarnessState) -> Result<()> {
    state.updated_at = utc_now_iso();
    write_json_atomic(&paths.state_path(), state)
}

/// Point `state.json` at a run.
pub fn record_last_run(paths: &HarnessPaths, run_id: &str) -> Result<()> {
    let mut state = load_harness_state(paths)?;
    state.last_run_id = Some(run_id.to_string());
    write_harness_state(paths, &mut state)
}
