//! Orchestration for a single session.
//!
//! One session: build the task envelope, invoke the provider, gate every
//! proposed action through policy, execute approved actions, apply
//! evidence-gated status claims, then seal the session record. The record is
//! sealed whether the session succeeded or failed; the ledger is only
//! touched on the happy path.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::ledger::{self, LedgerError};
use crate::core::policy;
use crate::core::types::{Action, ActionOutcome, DenialReason, UsageCounters, Verdict};
use crate::io::actions::{ActionContext, ActionRunner};
use crate::io::config::HarnessConfig;
use crate::io::events::{EventBody, action_verdict_event, append_event, utc_now_iso};
use crate::io::ledger_store::{load_ledger, save_ledger_guarded};
use crate::io::paths::HarnessPaths;
use crate::io::provider::{
    CONTRACT_VERSION, Provider, ProviderRequest, TaskEnvelope, action_from_raw, invoke_and_parse,
    write_envelope, write_response_schema,
};
use crate::io::run_state::RunState;
use crate::io::session_record::{
    ActionRecord, SESSION_RECORD_SCHEMA_VERSION, SessionRecord, load_session_record,
    write_session_record,
};

/// Result of one session, as seen by the orchestrator.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: u32,
    /// Sub-task ids whose status advanced.
    pub advanced: Vec<String>,
    pub denied: u32,
    pub failed_actions: u32,
    /// No actions executed and no status advanced.
    pub no_progress: bool,
    /// The provider misbehaved; the record is sealed as failed.
    pub failed: bool,
}

/// Execute one session against the given provider and action runner.
///
/// Always seals a session record and appends progress/usage, even when the
/// attempt fails. Returns `Err` only when the harness itself cannot operate
/// (unwritable artifacts, corrupt state); provider misbehavior is a sealed
/// failed record with `Ok`.
#[instrument(skip_all, fields(run_id = %run_state.run_id, session = run_state.next_session()))]
pub fn execute_session<P: Provider, A: ActionRunner>(
    paths: &HarnessPaths,
    run_state: &RunState,
    cfg: &HarnessConfig,
    provider: &P,
    provider_name: &str,
    action_runner: &A,
) -> Result<SessionOutcome> {
    let start = Instant::now();
    let deadline = start + cfg.session_timeout();
    let run_id = run_state.run_id.clone();
    let session = run_state.next_session();

    append_event(paths, &run_id, EventBody::SessionStarted { session })?;

    let ledger_before = load_ledger(paths)?;
    let continuity_summary = previous_summary(paths, &run_id, session)?;

    let envelope = TaskEnvelope {
        contract_version: CONTRACT_VERSION.to_string(),
        run_id: run_id.clone(),
        session,
        task: run_state.task.clone(),
        ledger: ledger_before.clone(),
        continuity_summary,
        allowed_actions: cfg.allowed_action_kinds.clone(),
    };
    let envelope_path = paths.session_envelope_path(&run_id, session);
    write_envelope(&envelope_path, &envelope)?;
    let schema_path = paths.sessions_dir(&run_id).join("response.schema.json");
    write_response_schema(&schema_path)?;

    let action_ctx = ActionContext {
        repo_root: paths.repo_root.clone(),
        log_path: paths.session_actions_log_path(&run_id, session),
        commits_path: paths.commits_path(&run_id),
        timeout: cfg.action_timeout(),
        output_limit_bytes: cfg.output_limit_bytes,
    };

    let mut records: Vec<ActionRecord> = Vec::new();
    let mut advanced: Vec<String> = Vec::new();
    let mut summary: Option<String> = None;
    let mut usage = UsageCounters::default();

    let attempt = (|| -> Result<()> {
        let request = ProviderRequest {
            workdir: paths.repo_root.clone(),
            envelope_path: envelope_path.clone(),
            response_path: paths.session_response_path(&run_id, session),
            response_schema_path: schema_path.clone(),
            log_path: paths.session_provider_log_path(&run_id, session),
            timeout: remaining_budget(deadline)?,
            output_limit_bytes: cfg.output_limit_bytes,
        };
        let response = invoke_and_parse(provider, &request)?;
        summary = Some(response.summary.clone());
        usage = response.usage;

        let policy_cfg = cfg.policy();
        for raw in &response.actions {
            let (verdict, action) = match action_from_raw(raw) {
                Ok(action) => {
                    let verdict = policy::evaluate(&action, &policy_cfg, &paths.repo_root);
                    (verdict, Some(action))
                }
                Err(err) => (
                    Verdict::denied(DenialReason::AllowListMiss, err.to_string()),
                    None,
                ),
            };
            append_event(paths, &run_id, action_verdict_event(session, &raw.id, &verdict))?;

            let outcome = match (&verdict, action) {
                (Verdict::Approved, Some(action)) => {
                    let outcome = run_action(action_runner, &action, &action_ctx)?;
                    append_event(
                        paths,
                        &run_id,
                        EventBody::ActionResult {
                            session,
                            action_id: action.id.clone(),
                            outcome,
                        },
                    )?;
                    outcome
                }
                _ => ActionOutcome::Skipped,
            };
            records.push(ActionRecord {
                action_id: raw.id.clone(),
                kind: raw.kind.clone(),
                verdict,
                outcome,
            });
        }

        let denied = records.iter().filter(|r| !r.verdict.is_approved()).count() as u32;
        let failed_actions = records
            .iter()
            .filter(|r| r.outcome == ActionOutcome::Failed)
            .count() as u32;

        // Status claims advance the ledger only for clean sessions: a denial
        // or failed action voids every claim in the same response.
        if denied > 0 || failed_actions > 0 {
            if !response.status_claims.is_empty() {
                warn!(denied, failed_actions, "withholding status claims");
                append_event(
                    paths,
                    &run_id,
                    EventBody::StatusUpdatesWithheld {
                        session,
                        denied,
                        failed: failed_actions,
                    },
                )?;
            }
        } else {
            let mut ledger_after = ledger_before.clone();
            for claim in &response.status_claims {
                match ledger::apply_status_update(
                    &mut ledger_after,
                    &claim.sub_task_id,
                    &claim.evidence,
                ) {
                    Ok(true) => {
                        advanced.push(claim.sub_task_id.clone());
                        append_event(
                            paths,
                            &run_id,
                            EventBody::StatusUpdated {
                                session,
                                sub_task_id: claim.sub_task_id.clone(),
                            },
                        )?;
                    }
                    Ok(false) => {}
                    Err(err @ LedgerError::IncompleteEvidence { .. })
                    | Err(err @ LedgerError::UnknownSubTask { .. }) => {
                        warn!(sub_task_id = %claim.sub_task_id, %err, "rejected status claim");
                        append_event(
                            paths,
                            &run_id,
                            EventBody::StatusUpdateRejected {
                                session,
                                sub_task_id: claim.sub_task_id.clone(),
                                error: err.to_string(),
                            },
                        )?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if !advanced.is_empty() {
                save_ledger_guarded(paths, &ledger_before, &ledger_after)?;
            }
        }
        Ok(())
    })();

    let (failed, error) = match &attempt {
        Ok(()) => (false, None),
        Err(err) => {
            warn!(%err, "session attempt failed");
            append_event(
                paths,
                &run_id,
                EventBody::SessionFailed {
                    session,
                    error: err.to_string(),
                },
            )?;
            (true, Some(err.to_string()))
        }
    };

    let record = SessionRecord {
        schema_version: SESSION_RECORD_SCHEMA_VERSION,
        run_id: run_id.clone(),
        session,
        provider: provider_name.to_string(),
        summary: summary.clone(),
        actions: records,
        status_updates: advanced.clone(),
        failed,
        error,
        usage,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    write_session_record(paths, &record)?;

    append_progress(paths, &run_id, &record)?;
    accumulate_usage(paths, &run_id, usage)?;

    if !failed {
        append_event(
            paths,
            &run_id,
            EventBody::SessionFinished {
                session,
                actions: record.actions.len() as u32,
                advanced: advanced.len() as u32,
            },
        )?;
    }

    let denied = record.denied_count() as u32;
    let failed_actions = record.failed_action_count() as u32;
    let no_progress = !failed && record.actions.is_empty() && advanced.is_empty();
    info!(
        session,
        denied, failed_actions, no_progress, failed, "session sealed"
    );
    Ok(SessionOutcome {
        session,
        advanced,
        denied,
        failed_actions,
        no_progress,
        failed,
    })
}

fn run_action<A: ActionRunner>(
    runner: &A,
    action: &Action,
    ctx: &ActionContext,
) -> Result<ActionOutcome> {
    runner
        .run(action, ctx)
        .with_context(|| format!("execute action '{}'", action.id))
}

fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("session timed out"));
    }
    Ok(remaining)
}

/// Summary of the latest sealed session, carried forward for continuity.
/// Failed sessions carry nothing: internal errors never feed the provider.
fn previous_summary(paths: &HarnessPaths, run_id: &str, session: u32) -> Result<Option<String>> {
    if session <= 1 {
        return Ok(None);
    }
    let record = load_session_record(paths, run_id, session - 1)?;
    if record.failed {
        return Ok(None);
    }
    Ok(record.summary)
}

fn append_progress(paths: &HarnessPaths, run_id: &str, record: &SessionRecord) -> Result<()> {
    let path = paths.progress_path(run_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let mut entry = format!("## Session {} — {}\n\n", record.session, utc_now_iso());
    if record.failed {
        entry.push_str("Failed: ");
        entry.push_str(record.error.as_deref().unwrap_or("unknown error"));
        entry.push('\n');
    } else {
        entry.push_str(record.summary.as_deref().unwrap_or("(no summary)"));
        entry.push('\n');
        if !record.status_updates.is_empty() {
            entry.push_str(&format!("\nAdvanced: {}\n", record.status_updates.join(", ")));
        }
    }
    entry.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(entry.as_bytes())
        .with_context(|| format!("append to {}", path.display()))
}

fn accumulate_usage(paths: &HarnessPaths, run_id: &str, usage: UsageCounters) -> Result<()> {
    let path = paths.usage_path(run_id);
    let mut total = if path.exists() {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read usage {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse usage {}", path.display()))?
    } else {
        UsageCounters::default()
    };
    total.add(usage);
    crate::io::run_state::write_json_atomic(&path, &total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ActionKind;
    use crate::io::events::{count_denials, load_events};
    use crate::io::provider::RawAction;
    use crate::test_support::{
        ScriptedActionRunner, ScriptedProvider, claim, init_root, response, shell_action,
    };

    fn setup(dir: &std::path::Path) -> (HarnessPaths, RunState, HarnessConfig) {
        let paths = init_root(dir);
        let run_state = RunState::new("run_test", "do the task", true);
        fs::create_dir_all(paths.run_dir("run_test")).expect("run dir");
        (paths, run_state, HarnessConfig::default())
    }

    #[test]
    fn clean_session_executes_actions_and_advances_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, run_state, cfg) = setup(dir.path());

        let provider = ScriptedProvider::respond_once(response(
            vec![shell_action("a1", "echo hello")],
            vec![claim("scaffold", 1)],
            "scaffolded the project",
        ));
        let runner = ScriptedActionRunner::succeed_all();

        let outcome =
            execute_session(&paths, &run_state, &cfg, &provider, "scripted", &runner)
                .expect("session");

        assert!(!outcome.failed);
        assert_eq!(outcome.advanced, vec!["scaffold".to_string()]);
        assert_eq!(outcome.denied, 0);
        assert!(!outcome.no_progress);

        let ledger = load_ledger(&paths).expect("ledger");
        let scaffold = ledger.sub_tasks.iter().find(|t| t.id == "scaffold").expect("entry");
        assert!(scaffold.status);

        let record = load_session_record(&paths, "run_test", 1).expect("record");
        assert_eq!(record.actions.len(), 1);
        assert!(record.actions[0].verdict.is_approved());
    }

    #[test]
    fn denied_action_withholds_every_status_claim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, run_state, cfg) = setup(dir.path());

        let provider = ScriptedProvider::respond_once(response(
            vec![
                shell_action("a1", "echo fine"),
                shell_action("a2", "rm -rf /"),
            ],
            vec![claim("scaffold", 1)],
            "tried to clean up",
        ));
        let runner = ScriptedActionRunner::succeed_all();

        let outcome =
            execute_session(&paths, &run_state, &cfg, &provider, "scripted", &runner)
                .expect("session");

        assert_eq!(outcome.denied, 1);
        assert!(outcome.advanced.is_empty());
        let ledger = load_ledger(&paths).expect("ledger");
        assert!(ledger.sub_tasks.iter().all(|t| !t.status));

        let events = load_events(&paths, "run_test").expect("events");
        assert_eq!(count_denials(&events), 1);
        assert!(events
            .iter()
            .any(|e| matches!(e.body, EventBody::StatusUpdatesWithheld { .. })));
    }

    #[test]
    fn unknown_action_kind_is_recorded_as_a_denial() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, run_state, cfg) = setup(dir.path());

        let provider = ScriptedProvider::respond_once(response(
            vec![RawAction {
                id: "a1".to_string(),
                kind: "format_disk".to_string(),
                payload: String::new(),
                targets: Vec::new(),
                network: false,
            }],
            Vec::new(),
            "tried something odd",
        ));
        let runner = ScriptedActionRunner::succeed_all();

        let outcome =
            execute_session(&paths, &run_state, &cfg, &provider, "scripted", &runner)
                .expect("session");
        assert_eq!(outcome.denied, 1);
        assert!(!outcome.failed);

        let record = load_session_record(&paths, "run_test", 1).expect("record");
        assert_eq!(record.actions[0].kind, "format_disk");
        assert_eq!(record.actions[0].outcome, ActionOutcome::Skipped);
    }

    #[test]
    fn provider_failure_seals_a_failed_record_and_spares_the_ledger() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, run_state, cfg) = setup(dir.path());

        let provider = ScriptedProvider::fail_once("model returned prose");
        let runner = ScriptedActionRunner::succeed_all();

        let outcome =
            execute_session(&paths, &run_state, &cfg, &provider, "scripted", &runner)
                .expect("session");
        assert!(outcome.failed);

        let record = load_session_record(&paths, "run_test", 1).expect("record");
        assert!(record.failed);
        assert!(record.error.as_deref().unwrap_or("").contains("prose"));

        let ledger = load_ledger(&paths).expect("ledger");
        assert!(ledger.sub_tasks.iter().all(|t| !t.status));

        let events = load_events(&paths, "run_test").expect("events");
        assert!(events
            .iter()
            .any(|e| matches!(e.body, EventBody::SessionFailed { .. })));
    }

    #[test]
    fn incomplete_evidence_rejects_only_that_claim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, run_state, cfg) = setup(dir.path());

        // "implement" has two criteria; the claim covers only one.
        let provider = ScriptedProvider::respond_once(response(
            Vec::new(),
            vec![claim("implement", 1), claim("scaffold", 1)],
            "claims with mixed evidence",
        ));
        let runner = ScriptedActionRunner::succeed_all();

        let outcome =
            execute_session(&paths, &run_state, &cfg, &provider, "scripted", &runner)
                .expect("session");
        assert_eq!(outcome.advanced, vec!["scaffold".to_string()]);

        let events = load_events(&paths, "run_test").expect("events");
        assert!(events.iter().any(|e| matches!(
            &e.body,
            EventBody::StatusUpdateRejected { sub_task_id, .. } if sub_task_id == "implement"
        )));
    }

    #[test]
    fn empty_session_is_no_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, run_state, cfg) = setup(dir.path());

        let provider =
            ScriptedProvider::respond_once(response(Vec::new(), Vec::new(), "looked around"));
        let runner = ScriptedActionRunner::succeed_all();

        let outcome =
            execute_session(&paths, &run_state, &cfg, &provider, "scripted", &runner)
                .expect("session");
        assert!(outcome.no_progress);
        assert!(!outcome.failed);
    }

    #[test]
    fn continuity_summary_flows_from_the_previous_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (paths, mut run_state, cfg) = setup(dir.path());

        let provider =
            ScriptedProvider::respond_once(response(Vec::new(), Vec::new(), "first summary"));
        let runner = ScriptedActionRunner::succeed_all();
        execute_session(&paths, &run_state, &cfg, &provider, "scripted", &runner)
            .expect("first");
        run_state.sessions.push("1.json".to_string());

        let provider2 =
            ScriptedProvider::respond_once(response(Vec::new(), Vec::new(), "second"));
        execute_session(&paths, &run_state, &cfg, &provider2, "scripted", &runner)
            .expect("second");

        let envelope_raw =
            fs::read_to_string(paths.session_envelope_path("run_test", 2)).expect("read");
        let envelope: TaskEnvelope = serde_json::from_str(&envelope_raw).expect("parse");
        assert_eq!(envelope.continuity_summary.as_deref(), Some("first summary"));
        assert_eq!(envelope.session, 2);
        assert!(envelope.allowed_actions.contains(&ActionKind::ShellCommand));
    }
}
