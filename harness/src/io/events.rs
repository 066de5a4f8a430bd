//! Append-only event log.
//!
//! One JSON object per line under `runs/<id>/events.jsonl`. Events are the
//! audit trail: they are never rewritten, and a line that fails to parse is
//! an error, not something to skip over.

use std::fs::{self, OpenOptions};
use std::io::Write;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{ActionOutcome, DenialReason, Verdict};
use crate::io::paths::HarnessPaths;

/// UTC timestamp, second precision, RFC 3339 with trailing Z.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub ts: String,
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    SessionStarted {
        session: u32,
    },
    ActionVerdict {
        session: u32,
        action_id: String,
        verdict: Verdict,
    },
    ActionResult {
        session: u32,
        action_id: String,
        outcome: ActionOutcome,
    },
    StatusUpdated {
        session: u32,
        sub_task_id: String,
    },
    StatusUpdateRejected {
        session: u32,
        sub_task_id: String,
        error: String,
    },
    /// Claims withheld because the session had denied or failed actions.
    StatusUpdatesWithheld {
        session: u32,
        denied: u32,
        failed: u32,
    },
    SessionFinished {
        session: u32,
        actions: u32,
        advanced: u32,
    },
    SessionFailed {
        session: u32,
        error: String,
    },
    StuckDetected {
        session: u32,
        streak: u32,
    },
    InterventionRequested {
        note: String,
    },
    InterventionAcknowledged,
    MaxSessionsReached {
        max_sessions: u32,
    },
    RunCompleted {
        sessions: u32,
    },
    RunForked {
        source_run_id: String,
        at_session: u32,
    },
    EvalReportWritten {
        profile: String,
        passed: bool,
    },
}

/// Append one event. Single `write_all` of one line keeps concurrent readers
/// from ever seeing a torn record.
pub fn append_event(paths: &HarnessPaths, run_id: &str, body: EventBody) -> Result<()> {
    let path = paths.events_path(run_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let event = Event {
        ts: utc_now_iso(),
        body,
    };
    let mut line = serde_json::to_string(&event).context("serialize event")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append to {}", path.display()))?;
    debug!(run_id, event = ?event.body, "appended event");
    Ok(())
}

/// Load every event. A malformed line fails the whole read; the event log
/// is an audit artifact and partial views of it are worse than none.
pub fn load_events(paths: &HarnessPaths, run_id: &str) -> Result<Vec<Event>> {
    let path = paths.events_path(run_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read events {}", path.display()))?;
    let mut events = Vec::new();
    for (number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line)
            .with_context(|| format!("parse event at {}:{}", path.display(), number + 1))?;
        events.push(event);
    }
    Ok(events)
}

/// Convenience: emit an `ActionVerdict` while borrowing the verdict.
pub fn action_verdict_event(session: u32, action_id: &str, verdict: &Verdict) -> EventBody {
    EventBody::ActionVerdict {
        session,
        action_id: action_id.to_string(),
        verdict: verdict.clone(),
    }
}

/// Count denial events per run, used by eval checks and status output.
pub fn count_denials(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                &e.body,
                EventBody::ActionVerdict {
                    verdict: Verdict::Denied { .. },
                    ..
                }
            )
        })
        .count()
}

/// Helper for denial bodies used in tests and session bookkeeping.
pub fn denial(reason: DenialReason, detail: &str) -> Verdict {
    Verdict::denied(reason, detail)
}
