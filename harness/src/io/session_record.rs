//! Sealed per-session records.
//!
//! One JSON document per session under `runs/<id>/sessions/<n>.json`. The
//! presence of the file is the seal: a record is written exactly once, at
//! the end of its session, and a write to an existing path is an error.
//! Resume logic relies on this to know which sessions actually happened.

use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{ActionOutcome, UsageCounters, Verdict};
use crate::io::paths::HarnessPaths;
use crate::io::run_state::write_json_atomic;

pub const SESSION_RECORD_SCHEMA_VERSION: u32 = 1;

/// One action's journey through the session: proposal, verdict, outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: String,
    /// Kind label as proposed. Kept as a string so unknown kinds are
    /// recordable as denials.
    pub kind: String,
    pub verdict: Verdict,
    pub outcome: ActionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub schema_version: u32,
    pub run_id: String,
    pub session: u32,
    /// Backend label (e.g. "codex", "scripted").
    pub provider: String,
    /// Provider summary, absent when the session failed before parsing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub actions: Vec<ActionRecord>,
    /// Sub-task ids whose status advanced this session.
    pub status_updates: Vec<String>,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage: UsageCounters,
    pub duration_ms: u64,
}

impl SessionRecord {
    pub fn denied_count(&self) -> usize {
        self.actions.iter().filter(|a| !a.verdict.is_approved()).count()
    }

    pub fn failed_action_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.outcome == ActionOutcome::Failed)
            .count()
    }
}

/// Seal a session record. Refuses to overwrite: a sealed session is history.
pub fn write_session_record(paths: &HarnessPaths, record: &SessionRecord) -> Result<()> {
    let path = paths.session_record_path(&record.run_id, record.session);
    anyhow::ensure!(
        !path.exists(),
        "session record {} already sealed",
        path.display()
    );
    write_json_atomic(&path, record)?;
    debug!(
        run_id = %record.run_id,
        session = record.session,
        failed = record.failed,
        "sealed session record"
    );
    Ok(())
}

pub fn load_session_record(
    paths: &HarnessPaths,
    run_id: &str,
    session: u32,
) -> Result<SessionRecord> {
    let path = paths.session_record_path(run_id, session);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read session record {}", path.display()))?;
    let record: SessionRecord = serde_json::from_str(&raw)
        .with_context(|| format!("parse session record {}", path.display()))?;
    anyhow::ensure!(
        record.schema_version == SESSION_RECORD_SCHEMA_VERSION,
        "session record {} has schema version {} (supported: {})",
        path.display(),
        record.schema_version,
        SESSION_RECORD_SCHEMA_VERSION
    );
    Ok(record)
}

/// Highest sealed session number for a run, scanning the sessions dir.
pub fn last_sealed_session(paths: &HarnessPaths, run_id: &str) -> Result<Option<u32>> {
    let dir = paths.sessions_dir(run_id);
    if !dir.exists() {
        return Ok(None);
    }
    let mut highest = None;
    for entry in fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        // Only bare record files count as seals, not envelopes or logs.
        let Some(stem) = name.strip_suffix(".json") else {
            continue;
        };
        if let Ok(session) = stem.parse::<u32>() {
            highest = Some(highest.map_or(session, |h: u32| h.max(session)));
        }
    }
    Ok(highest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DenialReason;

    fn record(run_id: &str, session: u32) -> SessionRecord {
        SessionRecord {
            schema_version: SESSION_RECORD_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            session,
            provider: "scripted".to_string(),
            summary: Some("did things".to_string()),
            actions: vec![
                ActionRecord {
                    action_id: "a1".to_string(),
                    kind: "shell_command".to_string(),
                    verdict: Verdict::Approved,
                    outcome: ActionOutcome::Succeeded,
                },
                ActionRecord {
                    action_id: "a2".to_string(),
                    kind: "shell_command".to_string(),
                    verdict: Verdict::denied(DenialReason::AllowListMiss, "nope"),
                    outcome: ActionOutcome::Skipped,
                },
            ],
            status_updates: vec!["t1".to_string()],
            failed: false,
            error: None,
            usage: UsageCounters::default(),
            duration_ms: 1200,
        }
    }

    #[test]
    fn record_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        let sealed = record("run_1", 1);
        write_session_record(&paths, &sealed).expect("write");
        let loaded = load_session_record(&paths, "run_1", 1).expect("load");
        assert_eq!(loaded, sealed);
        assert_eq!(loaded.denied_count(), 1);
    }

    /// A sealed record is history; double-sealing means replay and is a bug.
    #[test]
    fn sealing_twice_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        write_session_record(&paths, &record("run_1", 1)).expect("first");
        let err = write_session_record(&paths, &record("run_1", 1)).unwrap_err();
        assert!(err.to_string().contains("already sealed"));
    }

    #[test]
    fn last_sealed_session_ignores_non_record_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        write_session_record(&paths, &record("run_1", 1)).expect("one");
        write_session_record(&paths, &record("run_1", 3)).expect("three");
        fs::write(paths.session_envelope_path("run_1", 4), "{}").expect("write");
        fs::write(paths.session_provider_log_path("run_1", 4), "log").expect("write");
        assert_eq!(last_sealed_session(&paths, "run_1").expect("scan"), Some(3));
    }

    #[test]
    fn no_sessions_dir_means_no_seals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        assert_eq!(last_sealed_session(&paths, "run_x").expect("scan"), None);
    }
}
