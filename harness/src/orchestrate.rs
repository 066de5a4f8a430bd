//! Run-level orchestration: the lifecycle state machine over sessions.
//!
//! `run_task` drives sessions until the ledger is complete (and the eval
//! gate passes, when required), the run goes stuck or blocked, or the
//! session ceiling is hit. `resume` continues from the last committed state
//! without ever replaying a sealed session. `fork` branches a run at a
//! checkpoint. Intervention markers are honored at session boundaries only.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::types::LifecycleStatus;
use crate::evalgate::{self, EvalReport};
use crate::io::actions::ActionRunner;
use crate::io::config::{HarnessConfig, load_config};
use crate::io::events::{EventBody, append_event, utc_now_iso};
use crate::io::ledger_store::load_ledger;
use crate::io::paths::HarnessPaths;
use crate::io::provider::Provider;
use crate::io::run_state::{
    ForkPoint, RunState, load_harness_state, load_run_state, record_last_run, write_json_atomic,
    write_run_state,
};
use crate::io::session_record::{last_sealed_session, load_session_record};
use crate::session::execute_session;

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    /// Ledger complete and, when required, eval gate passed.
    Completed,
    /// Stuck streak hit the threshold or an intervention is pending.
    Blocked { reason: String },
    /// Session ceiling reached before completion.
    MaxSessions { max_sessions: u32 },
}

/// Summary of a `run_task`/`resume` invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub sessions_executed: u32,
    pub stop: RunStop,
}

/// Out-of-band intervention marker, written by `intervene` and acknowledged
/// by `resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionMarker {
    pub note: String,
    pub requested_at: String,
    pub acknowledged: bool,
}

/// Per-run metrics snapshot, refreshed whenever the run stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub sessions: u32,
    pub failed_sessions: u32,
    pub done_sub_tasks: u32,
    pub total_sub_tasks: u32,
    pub no_progress_streak: u32,
    pub completed: bool,
}

/// Start a new run for `task` and drive it until it stops.
pub fn run_task<P: Provider, A: ActionRunner>(
    paths: &HarnessPaths,
    task: &str,
    provider: &P,
    provider_name: &str,
    action_runner: &A,
) -> Result<RunOutcome> {
    let cfg = load_config(paths)?;
    let run_id = next_run_id();
    let mut run_state = RunState::new(&run_id, task, cfg.require_eval_pass);
    run_state.status = LifecycleStatus::Running;
    write_run_state(paths, &mut run_state)?;
    record_last_run(paths, &run_id)?;
    info!(run_id, "started run");

    drive(paths, &cfg, run_state, provider, provider_name, action_runner)
}

/// Resume the most recent run (or a specific one) from its last committed
/// state. Sealed sessions are adopted, never replayed. A blocked or
/// intervention-requested run resumes only by acknowledging the pending
/// intervention marker.
pub fn resume<P: Provider, A: ActionRunner>(
    paths: &HarnessPaths,
    run_id: Option<&str>,
    provider: &P,
    provider_name: &str,
    action_runner: &A,
) -> Result<RunOutcome> {
    let cfg = load_config(paths)?;
    let run_id = resolve_run_id(paths, run_id)?;
    let mut run_state = load_run_state(paths, &run_id)?;
    anyhow::ensure!(
        !run_state.status.is_terminal(),
        "run '{run_id}' is already {:?}",
        run_state.status
    );

    if matches!(
        run_state.status,
        LifecycleStatus::Blocked | LifecycleStatus::InterventionRequested
    ) {
        acknowledge_intervention(paths, &run_id)?;
        run_state.no_progress_streak = 0;
    }
    run_state.status = LifecycleStatus::Running;
    write_run_state(paths, &mut run_state)?;
    info!(run_id, "resumed run");

    drive(paths, &cfg, run_state, provider, provider_name, action_runner)
}

/// The session loop shared by `run_task` and `resume`.
#[instrument(skip_all, fields(run_id = %run_state.run_id))]
fn drive<P: Provider, A: ActionRunner>(
    paths: &HarnessPaths,
    cfg: &HarnessConfig,
    mut run_state: RunState,
    provider: &P,
    provider_name: &str,
    action_runner: &A,
) -> Result<RunOutcome> {
    let run_id = run_state.run_id.clone();
    let mut sessions_executed = 0u32;

    reconcile_sealed_sessions(paths, &mut run_state)?;
    write_run_state(paths, &mut run_state)?;

    let stop = loop {
        // Completion pre-check: a resumed run whose ledger is already done
        // must not dispatch another session.
        if run_complete(paths, cfg, &run_state)? {
            run_state.status = LifecycleStatus::Completed;
            write_run_state(paths, &mut run_state)?;
            append_event(
                paths,
                &run_id,
                EventBody::RunCompleted {
                    sessions: run_state.sessions.len() as u32,
                },
            )?;
            break RunStop::Completed;
        }

        // Interventions take effect at session boundaries only.
        if let Some(marker) = pending_intervention(paths, &run_id)? {
            run_state.status = LifecycleStatus::InterventionRequested;
            write_run_state(paths, &mut run_state)?;
            break RunStop::Blocked {
                reason: format!("intervention requested: {}", marker.note),
            };
        }

        if run_state.sessions.len() as u32 >= cfg.max_sessions {
            run_state.status = LifecycleStatus::Failed;
            write_run_state(paths, &mut run_state)?;
            append_event(
                paths,
                &run_id,
                EventBody::MaxSessionsReached {
                    max_sessions: cfg.max_sessions,
                },
            )?;
            break RunStop::MaxSessions {
                max_sessions: cfg.max_sessions,
            };
        }

        let outcome = execute_session(
            paths,
            &run_state,
            cfg,
            provider,
            provider_name,
            action_runner,
        )?;
        sessions_executed += 1;
        run_state.sessions.push(format!("{}.json", outcome.session));
        if outcome.failed {
            run_state.failed_sessions += 1;
        }
        if outcome.no_progress || outcome.failed {
            run_state.no_progress_streak += 1;
        } else {
            run_state.no_progress_streak = 0;
        }
        write_run_state(paths, &mut run_state)?;

        if run_state.no_progress_streak >= cfg.stuck_threshold {
            warn!(streak = run_state.no_progress_streak, "run is stuck");
            append_event(
                paths,
                &run_id,
                EventBody::StuckDetected {
                    session: outcome.session,
                    streak: run_state.no_progress_streak,
                },
            )?;
            run_state.status = LifecycleStatus::Blocked;
            write_run_state(paths, &mut run_state)?;
            break RunStop::Blocked {
                reason: format!(
                    "no progress in {} consecutive sessions",
                    run_state.no_progress_streak
                ),
            };
        }
    };

    write_metrics(paths, &run_state)?;
    info!(run_id, sessions_executed, stop = ?stop, "run stopped");
    Ok(RunOutcome {
        run_id,
        sessions_executed,
        stop,
    })
}

/// Adopt sealed session records the run state does not know about yet. This
/// is the crash-resume path: a crash after sealing a record but before the
/// run-state write must not cause a replay of that session.
fn reconcile_sealed_sessions(paths: &HarnessPaths, run_state: &mut RunState) -> Result<()> {
    let Some(last_sealed) = last_sealed_session(paths, &run_state.run_id)? else {
        return Ok(());
    };
    let known = run_state.sessions.len() as u32;
    for session in (known + 1)..=last_sealed {
        let record = load_session_record(paths, &run_state.run_id, session)?;
        info!(session, "adopting sealed session record");
        run_state.sessions.push(format!("{session}.json"));
        if record.failed {
            run_state.failed_sessions += 1;
        }
        if record.failed || (record.actions.is_empty() && record.status_updates.is_empty()) {
            run_state.no_progress_streak += 1;
        } else {
            run_state.no_progress_streak = 0;
        }
    }
    Ok(())
}

/// Completion policy: ledger complete AND (eval pass not required OR the
/// eval gate passes against current artifacts).
fn run_complete(paths: &HarnessPaths, cfg: &HarnessConfig, run_state: &RunState) -> Result<bool> {
    let ledger = load_ledger(paths)?;
    if !ledger.is_complete() {
        return Ok(false);
    }
    if !run_state.require_eval_pass {
        return Ok(true);
    }
    let report = run_eval(paths, cfg, &run_state.run_id)?;
    Ok(report.passed)
}

/// Run the configured eval profile and persist its report.
pub fn run_eval(paths: &HarnessPaths, cfg: &HarnessConfig, run_id: &str) -> Result<EvalReport> {
    let report = evalgate::run(paths, cfg, run_id, &cfg.eval_profile)?;
    evalgate::write_report(paths, &report)?;
    append_event(
        paths,
        run_id,
        EventBody::EvalReportWritten {
            profile: report.profile.clone(),
            passed: report.passed,
        },
    )?;
    Ok(report)
}

/// Request operator intervention on a run. Takes effect at the next session
/// boundary; a run that is mid-session finishes that session first.
pub fn intervene(paths: &HarnessPaths, run_id: Option<&str>, note: &str) -> Result<String> {
    let run_id = resolve_run_id(paths, run_id)?;
    let mut run_state = load_run_state(paths, &run_id)?;
    anyhow::ensure!(
        !run_state.status.is_terminal(),
        "run '{run_id}' is already {:?}",
        run_state.status
    );
    let marker = InterventionMarker {
        note: note.to_string(),
        requested_at: utc_now_iso(),
        acknowledged: false,
    };
    write_json_atomic(&paths.intervention_path(&run_id), &marker)?;
    append_event(
        paths,
        &run_id,
        EventBody::InterventionRequested {
            note: note.to_string(),
        },
    )?;
    run_state.status = LifecycleStatus::InterventionRequested;
    write_run_state(paths, &mut run_state)?;
    Ok(run_id)
}

fn pending_intervention(
    paths: &HarnessPaths,
    run_id: &str,
) -> Result<Option<InterventionMarker>> {
    let path = paths.intervention_path(run_id);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("read intervention marker {}", path.display()))?;
    let marker: InterventionMarker = serde_json::from_str(&raw)
        .with_context(|| format!("parse intervention marker {}", path.display()))?;
    if marker.acknowledged {
        return Ok(None);
    }
    Ok(Some(marker))
}

fn acknowledge_intervention(paths: &HarnessPaths, run_id: &str) -> Result<()> {
    if let Some(mut marker) = pending_intervention(paths, run_id)? {
        marker.acknowledged = true;
        write_json_atomic(&paths.intervention_path(run_id), &marker)?;
        append_event(paths, run_id, EventBody::InterventionAcknowledged)?;
    }
    Ok(())
}

/// Fork a run at a checkpoint session. The fork gets its own run directory,
/// adopts the source's sealed records up to `at_session` and starts
/// `running`; the source run is never mutated.
pub fn fork(paths: &HarnessPaths, source_run_id: &str, at_session: u32) -> Result<String> {
    let source = load_run_state(paths, source_run_id)?;
    anyhow::ensure!(
        at_session as usize <= source.sessions.len(),
        "run '{source_run_id}' has only {} sessions, cannot fork at {at_session}",
        source.sessions.len()
    );

    let fork_id = next_run_id();
    let mut fork_state = RunState::new(&fork_id, &source.task, source.require_eval_pass);
    fork_state.status = LifecycleStatus::Running;
    fork_state.forked_from = Some(ForkPoint {
        run_id: source_run_id.to_string(),
        at_session,
    });

    for session in 1..=at_session {
        let record = load_session_record(paths, source_run_id, session)?;
        let mut copy = record;
        copy.run_id = fork_id.clone();
        crate::io::session_record::write_session_record(paths, &copy)?;
        fork_state.sessions.push(format!("{session}.json"));
        if copy.failed {
            fork_state.failed_sessions += 1;
        }
    }

    write_run_state(paths, &mut fork_state)?;
    record_last_run(paths, &fork_id)?;
    append_event(
        paths,
        &fork_id,
        EventBody::RunForked {
            source_run_id: source_run_id.to_string(),
            at_session,
        },
    )?;
    info!(fork_id, source_run_id, at_session, "forked run");
    Ok(fork_id)
}

/// Read-only status summary for the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub run_id: String,
    pub status: LifecycleStatus,
    pub sessions: u32,
    pub failed_sessions: u32,
    pub no_progress_streak: u32,
    pub done_sub_tasks: u32,
    pub total_sub_tasks: u32,
}

pub fn status_report(paths: &HarnessPaths, run_id: Option<&str>) -> Result<StatusReport> {
    let run_id = resolve_run_id(paths, run_id)?;
    let run_state = load_run_state(paths, &run_id)?;
    let ledger = load_ledger(paths)?;
    let (done, total) = ledger.completion_counts();
    Ok(StatusReport {
        run_id,
        status: run_state.status,
        sessions: run_state.sessions.len() as u32,
        failed_sessions: run_state.failed_sessions,
        no_progress_streak: run_state.no_progress_streak,
        done_sub_tasks: done as u32,
        total_sub_tasks: total as u32,
    })
}

fn write_metrics(paths: &HarnessPaths, run_state: &RunState) -> Result<()> {
    let ledger = load_ledger(paths)?;
    let (done, total) = ledger.completion_counts();
    let metrics = RunMetrics {
        run_id: run_state.run_id.clone(),
        sessions: run_state.sessions.len() as u32,
        failed_sessions: run_state.failed_sessions,
        done_sub_tasks: done as u32,
        total_sub_tasks: total as u32,
        no_progress_streak: run_state.no_progress_streak,
        completed: run_state.status == LifecycleStatus::Completed,
    };
    write_json_atomic(&paths.metrics_path(&run_state.run_id), &metrics)
}

fn resolve_run_id(paths: &HarnessPaths, run_id: Option<&str>) -> Result<String> {
    if let Some(run_id) = run_id {
        return Ok(run_id.to_string());
    }
    load_harness_state(paths)?
        .last_run_id
        .ok_or_else(|| anyhow::anyhow!("no runs yet (run `harness run` first)"))
}

fn next_run_id() -> String {
    format!("run_{}", Utc::now().format("%Y%m%dT%H%M%S%3fZ"))
}
