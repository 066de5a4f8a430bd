//! Deterministic eval gate.
//!
//! Checks run against persisted artifacts only: same artifacts, same report,
//! byte for byte. The report carries no timestamps; time lives in the event
//! log and metrics. Completion policy uses this gate when
//! `require_eval_pass` is set.

use std::fmt;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::io::config::HarnessConfig;
use crate::io::events::{count_denials, load_events};
use crate::io::ledger_store::load_ledger;
use crate::io::paths::HarnessPaths;
use crate::io::run_state::write_json_atomic;

pub const EVAL_REPORT_SCHEMA_VERSION: u32 = 1;

/// Built-in profile every workspace gets without configuration.
const DEFAULT_PROFILE: [&str; 4] = [
    "ledger_complete",
    "no_denied_actions",
    "required_artifacts",
    "events_parse",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// What the check looked at; failure detail when it did not pass.
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalReport {
    pub schema_version: u32,
    pub run_id: String,
    pub profile: String,
    pub checks: Vec<CheckResult>,
    pub passed: bool,
}

/// The named profile exists neither in config nor as a built-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProfileError {
    pub profile: String,
}

impl fmt::Display for UnknownProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown eval profile '{}'", self.profile)
    }
}

impl std::error::Error for UnknownProfileError {}

/// Run a profile's checks in order against the run's artifacts.
///
/// A check that errors internally becomes a failed [`CheckResult`] carrying
/// the error as evidence; only an unknown profile or check id is a caller
/// error.
#[instrument(skip_all, fields(run_id, profile))]
pub fn run(
    paths: &HarnessPaths,
    cfg: &HarnessConfig,
    run_id: &str,
    profile: &str,
) -> Result<EvalReport> {
    let check_ids = resolve_profile(cfg, profile)?;
    let mut checks = Vec::with_capacity(check_ids.len());
    for id in &check_ids {
        let result = match run_check(paths, run_id, id) {
            Ok(result) => result,
            Err(err) => {
                if err.downcast_ref::<UnknownCheckError>().is_some() {
                    return Err(err);
                }
                CheckResult {
                    name: id.clone(),
                    passed: false,
                    evidence: format!("check errored: {err}"),
                }
            }
        };
        checks.push(result);
    }
    let passed = checks.iter().all(|c| c.passed);
    debug!(passed, checks = checks.len(), "eval gate finished");
    Ok(EvalReport {
        schema_version: EVAL_REPORT_SCHEMA_VERSION,
        run_id: run_id.to_string(),
        profile: profile.to_string(),
        checks,
        passed,
    })
}

/// Persist the report atomically under `runs/<id>/eval/report.json`.
pub fn write_report(paths: &HarnessPaths, report: &EvalReport) -> Result<()> {
    write_json_atomic(&paths.eval_report_path(&report.run_id), report)
}

pub fn load_report(paths: &HarnessPaths, run_id: &str) -> Result<EvalReport> {
    let path = paths.eval_report_path(run_id);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read eval report {}", path.display()))?;
    let report: EvalReport = serde_json::from_str(&raw)
        .with_context(|| format!("parse eval report {}", path.display()))?;
    anyhow::ensure!(
        report.schema_version == EVAL_REPORT_SCHEMA_VERSION,
        "eval report {} has schema version {} (supported: {})",
        path.display(),
        report.schema_version,
        EVAL_REPORT_SCHEMA_VERSION
    );
    Ok(report)
}

/// Config profiles shadow built-ins of the same name.
fn resolve_profile(cfg: &HarnessConfig, profile: &str) -> Result<Vec<String>> {
    if let Some(ids) = cfg.eval.profiles.get(profile) {
        return Ok(ids.clone());
    }
    if profile == "default" {
        return Ok(DEFAULT_PROFILE.iter().map(|s| (*s).to_string()).collect());
    }
    Err(UnknownProfileError {
        profile: profile.to_string(),
    }
    .into())
}

#[derive(Debug, Clone)]
struct UnknownCheckError {
    check: String,
}

impl fmt::Display for UnknownCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown eval check '{}'", self.check)
    }
}

impl std::error::Error for UnknownCheckError {}

fn run_check(paths: &HarnessPaths, run_id: &str, id: &str) -> Result<CheckResult> {
    match id {
        "ledger_complete" => check_ledger_complete(paths),
        "no_denied_actions" => check_no_denied_actions(paths, run_id),
        "required_artifacts" => check_required_artifacts(paths, run_id),
        "events_parse" => check_events_parse(paths, run_id),
        other => Err(UnknownCheckError {
            check: other.to_string(),
        }
        .into()),
    }
}

fn check_ledger_complete(paths: &HarnessPaths) -> Result<CheckResult> {
    let ledger = load_ledger(paths)?;
    let (done, total) = ledger.completion_counts();
    Ok(CheckResult {
        name: "ledger_complete".to_string(),
        passed: ledger.is_complete(),
        evidence: format!("{done}/{total} sub-tasks done"),
    })
}

fn check_no_denied_actions(paths: &HarnessPaths, run_id: &str) -> Result<CheckResult> {
    let events = load_events(paths, run_id)?;
    let denials = count_denials(&events);
    Ok(CheckResult {
        name: "no_denied_actions".to_string(),
        passed: denials == 0,
        evidence: format!("{denials} denied actions in events.jsonl"),
    })
}

fn check_required_artifacts(paths: &HarnessPaths, run_id: &str) -> Result<CheckResult> {
    let required = [
        paths.run_state_path(run_id),
        paths.events_path(run_id),
        paths.progress_path(run_id),
    ];
    let missing: Vec<String> = required
        .iter()
        .filter(|p| !p.exists())
        .map(|p| p.display().to_string())
        .collect();
    Ok(CheckResult {
        name: "required_artifacts".to_string(),
        passed: missing.is_empty(),
        evidence: if missing.is_empty() {
            format!("{} artifacts present", required.len())
        } else {
            format!("missing: {}", missing.join(", "))
        },
    })
}

fn check_events_parse(paths: &HarnessPaths, run_id: &str) -> Result<CheckResult> {
    match load_events(paths, run_id) {
        Ok(events) => Ok(CheckResult {
            name: "events_parse".to_string(),
            passed: true,
            evidence: format!("{} events parsed", events.len()),
        }),
        Err(err) => Ok(CheckResult {
            name: "events_parse".to_string(),
            passed: false,
            evidence: format!("event log unreadable: {err}"),
        }),
    }
}
