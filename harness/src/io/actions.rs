//! Action execution seam.
//!
//! The [`ActionRunner`] trait separates the session loop from how approved
//! actions actually take effect. Only actions the policy gate approved ever
//! reach a runner; the runner itself never re-litigates policy.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::path::resolve_within;
use crate::core::types::{Action, ActionKind, ActionOutcome};
use crate::io::events::utc_now_iso;
use crate::io::process::run_command_with_timeout;

/// Per-session execution context.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Repository root; all file effects are confined here.
    pub repo_root: PathBuf,
    /// Append-target for per-action output.
    pub log_path: PathBuf,
    /// JSONL file recording artifact commits.
    pub commits_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over effecting approved actions.
pub trait ActionRunner {
    /// Execute one approved action. `Ok(Failed)` means the action ran and
    /// did not succeed (nonzero exit, timeout); `Err` means the harness
    /// itself could not perform the attempt.
    fn run(&self, action: &Action, ctx: &ActionContext) -> Result<ActionOutcome>;
}

/// Real runner: shell via `sh -c`, file writes, artifact commit notes.
pub struct ProcessActionRunner;

impl ActionRunner for ProcessActionRunner {
    #[instrument(skip_all, fields(action_id = %action.id, kind = action.kind.label()))]
    fn run(&self, action: &Action, ctx: &ActionContext) -> Result<ActionOutcome> {
        let outcome = match action.kind {
            ActionKind::ShellCommand => run_shell(action, ctx)?,
            ActionKind::FileWrite => run_file_write(action, ctx)?,
            ActionKind::ArtifactCommit => run_artifact_commit(action, ctx)?,
        };
        debug!(outcome = ?outcome, "action finished");
        Ok(outcome)
    }
}

fn run_shell(action: &Action, ctx: &ActionContext) -> Result<ActionOutcome> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&action.payload).current_dir(&ctx.repo_root);
    let output = run_command_with_timeout(cmd, None, ctx.timeout, ctx.output_limit_bytes)
        .context("run shell action")?;

    append_action_log(ctx, &action.id, |buf| {
        buf.push_str(&String::from_utf8_lossy(&output.stdout));
        buf.push_str(&output.stdout_truncated_notice("action"));
        if !output.stderr.is_empty() {
            buf.push_str("\n--- stderr ---\n");
            buf.push_str(&String::from_utf8_lossy(&output.stderr));
            buf.push_str(&output.stderr_truncated_notice("action"));
        }
        if output.timed_out {
            buf.push_str("\n[action timed out]\n");
        }
    })?;

    if output.timed_out {
        warn!(action_id = %action.id, "shell action timed out");
        return Ok(ActionOutcome::Failed);
    }
    if !output.status.success() {
        return Ok(ActionOutcome::Failed);
    }
    Ok(ActionOutcome::Succeeded)
}

fn run_file_write(action: &Action, ctx: &ActionContext) -> Result<ActionOutcome> {
    let [target] = action.targets.as_slice() else {
        return Err(anyhow!(
            "file_write action '{}' needs exactly one target, got {}",
            action.id,
            action.targets.len()
        ));
    };
    // The gate already checked the boundary; re-resolving here keeps the
    // runner safe even if it is ever called directly.
    let resolved = resolve_within(&ctx.repo_root, target)
        .ok_or_else(|| anyhow!("file_write target '{target}' escapes the repository root"))?;
    if let Some(parent) = resolved.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    fs::write(&resolved, &action.payload)
        .with_context(|| format!("write {}", resolved.display()))?;
    append_action_log(ctx, &action.id, |buf| {
        buf.push_str(&format!(
            "wrote {} bytes to {target}\n",
            action.payload.len()
        ));
    })?;
    Ok(ActionOutcome::Succeeded)
}

fn run_artifact_commit(action: &Action, ctx: &ActionContext) -> Result<ActionOutcome> {
    let entry = serde_json::json!({
        "ts": utc_now_iso(),
        "action_id": action.id,
        "note": action.payload,
        "targets": action.targets,
    });
    let mut line = serde_json::to_string(&entry).context("serialize commit entry")?;
    line.push('\n');
    if let Some(parent) = ctx.commits_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&ctx.commits_path)
        .with_context(|| format!("open {}", ctx.commits_path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append to {}", ctx.commits_path.display()))?;
    Ok(ActionOutcome::Succeeded)
}

fn append_action_log(
    ctx: &ActionContext,
    action_id: &str,
    fill: impl FnOnce(&mut String),
) -> Result<()> {
    let mut buf = format!("=== action {action_id} ===\n");
    fill(&mut buf);
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    if let Some(parent) = ctx.log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&ctx.log_path)
        .with_context(|| format!("open {}", ctx.log_path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append to {}", ctx.log_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(root: &std::path::Path) -> ActionContext {
        ActionContext {
            repo_root: root.to_path_buf(),
            log_path: root.join("actions.log"),
            commits_path: root.join("commits.jsonl"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        }
    }

    fn shell(id: &str, payload: &str) -> Action {
        Action {
            id: id.to_string(),
            kind: ActionKind::ShellCommand,
            payload: payload.to_string(),
            targets: Vec::new(),
            network: false,
        }
    }

    #[test]
    fn shell_success_and_failure_map_to_outcomes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = ProcessActionRunner;
        assert_eq!(
            runner.run(&shell("a1", "true"), &ctx(dir.path())).expect("run"),
            ActionOutcome::Succeeded
        );
        assert_eq!(
            runner.run(&shell("a2", "exit 1"), &ctx(dir.path())).expect("run"),
            ActionOutcome::Failed
        );
    }

    #[test]
    fn shell_output_lands_in_the_action_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = ProcessActionRunner;
        runner
            .run(&shell("a1", "echo marker-output"), &ctx(dir.path()))
            .expect("run");
        let log = fs::read_to_string(dir.path().join("actions.log")).expect("log");
        assert!(log.contains("=== action a1 ==="));
        assert!(log.contains("marker-output"));
    }

    #[test]
    fn file_write_creates_parents_and_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let action = Action {
            id: "w1".to_string(),
            kind: ActionKind::FileWrite,
            payload: "contents".to_string(),
            targets: vec!["nested/dir/file.txt".to_string()],
            network: false,
        };
        let outcome = ProcessActionRunner.run(&action, &ctx(dir.path())).expect("run");
        assert_eq!(outcome, ActionOutcome::Succeeded);
        let written = fs::read_to_string(dir.path().join("nested/dir/file.txt")).expect("read");
        assert_eq!(written, "contents");
    }

    #[test]
    fn file_write_requires_exactly_one_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let action = Action {
            id: "w1".to_string(),
            kind: ActionKind::FileWrite,
            payload: "contents".to_string(),
            targets: Vec::new(),
            network: false,
        };
        assert!(ProcessActionRunner.run(&action, &ctx(dir.path())).is_err());
    }

    #[test]
    fn file_write_refuses_escaping_targets_even_without_the_gate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let action = Action {
            id: "w1".to_string(),
            kind: ActionKind::FileWrite,
            payload: "contents".to_string(),
            targets: vec!["../../escape.txt".to_string()],
            network: false,
        };
        assert!(ProcessActionRunner.run(&action, &ctx(dir.path())).is_err());
    }

    #[test]
    fn artifact_commit_appends_a_jsonl_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let action = Action {
            id: "c1".to_string(),
            kind: ActionKind::ArtifactCommit,
            payload: "parser milestone".to_string(),
            targets: vec!["src/parser.rs".to_string()],
            network: false,
        };
        ProcessActionRunner.run(&action, &ctx(dir.path())).expect("run");
        let raw = fs::read_to_string(dir.path().join("commits.jsonl")).expect("read");
        let entry: serde_json::Value = serde_json::from_str(raw.trim()).expect("parse");
        assert_eq!(entry["note"], "parser milestone");
        assert_eq!(entry["action_id"], "c1");
    }
}
