//! Structured review findings over a run's artifacts.
//!
//! Complements the eval gate: where the gate answers pass/fail for the
//! completion policy, the review enumerates what an operator should look at
//! before trusting a run. Persisted to `runs/<id>/review.json`.

use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::core::types::Verdict;
use crate::io::events::{Event, EventBody, load_events};
use crate::io::ledger_store::load_ledger;
use crate::io::paths::HarnessPaths;
use crate::io::run_state::write_json_atomic;

pub const REVIEW_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Blocker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub schema_version: u32,
    pub run_id: String,
    pub findings: Vec<Finding>,
}

impl ReviewReport {
    pub fn worst_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Inspect a run and persist the findings. `min_severity` filters the
/// persisted report; everything below it is dropped.
#[instrument(skip_all, fields(run_id))]
pub fn run_review(
    paths: &HarnessPaths,
    run_id: &str,
    min_severity: Severity,
) -> Result<ReviewReport> {
    let mut findings = Vec::new();

    let ledger = load_ledger(paths)?;
    for task in ledger.sub_tasks.iter().filter(|t| !t.superseded) {
        if !task.status {
            findings.push(Finding {
                severity: Severity::Blocker,
                code: "incomplete_sub_task".to_string(),
                detail: format!("sub-task '{}' ({}) is not done", task.id, task.phase),
            });
        }
        if task.version > 1 {
            findings.push(Finding {
                severity: Severity::Info,
                code: "rebaselined_sub_task".to_string(),
                detail: format!(
                    "sub-task '{}' is at version {} (see rebaseline_notes.md)",
                    task.id, task.version
                ),
            });
        }
    }

    if !paths.events_path(run_id).exists() {
        findings.push(Finding {
            severity: Severity::Blocker,
            code: "missing_event_log".to_string(),
            detail: format!("no events.jsonl for run '{run_id}'"),
        });
    } else {
        let events = load_events(paths, run_id)?;
        findings.extend(event_findings(&events));
    }

    findings.retain(|f| f.severity >= min_severity);
    let report = ReviewReport {
        schema_version: REVIEW_SCHEMA_VERSION,
        run_id: run_id.to_string(),
        findings,
    };
    write_json_atomic(&paths.review_path(run_id), &report)?;
    Ok(report)
}

fn event_findings(events: &[Event]) -> Vec<Finding> {
    let mut findings = Vec::new();
    for event in events {
        match &event.body {
            EventBody::ActionVerdict {
                action_id,
                verdict: Verdict::Denied { reason, detail },
                ..
            } => findings.push(Finding {
                severity: Severity::Warning,
                code: "denied_action".to_string(),
                detail: format!("action '{action_id}' denied ({reason:?}): {detail}"),
            }),
            EventBody::SessionFailed { session, error } => findings.push(Finding {
                severity: Severity::Warning,
                code: "failed_session".to_string(),
                detail: format!("session {session} failed: {error}"),
            }),
            EventBody::StuckDetected { streak, .. } => findings.push(Finding {
                severity: Severity::Warning,
                code: "stuck_streak".to_string(),
                detail: format!("run stalled for {streak} consecutive sessions"),
            }),
            _ => {}
        }
    }
    findings
}

pub fn load_review(paths: &HarnessPaths, run_id: &str) -> Result<ReviewReport> {
    let path = paths.review_path(run_id);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read review {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse review {}", path.display()))
}
