//! Shared deterministic types for harness core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Pending,
    Running,
    Blocked,
    InterventionRequested,
    Completed,
    Failed,
}

impl LifecycleStatus {
    /// Terminal states accept no further session dispatches.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Closed set of action kinds the harness can execute.
///
/// Provider responses carry the kind as a string; anything outside this set
/// surfaces as [`UnknownActionError`] at the parse boundary and is never
/// coerced into a known kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ShellCommand,
    FileWrite,
    ArtifactCommit,
}

impl ActionKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::ShellCommand => "shell_command",
            Self::FileWrite => "file_write",
            Self::ArtifactCommit => "artifact_commit",
        }
    }

    pub fn parse(kind: &str) -> Result<Self, UnknownActionError> {
        match kind {
            "shell_command" => Ok(Self::ShellCommand),
            "file_write" => Ok(Self::FileWrite),
            "artifact_commit" => Ok(Self::ArtifactCommit),
            other => Err(UnknownActionError {
                kind: other.to_string(),
            }),
        }
    }
}

/// A provider proposed an action kind outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownActionError {
    pub kind: String,
}

impl fmt::Display for UnknownActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown action kind '{}'", self.kind)
    }
}

impl std::error::Error for UnknownActionError {}

/// A single proposed effect. Exists only within one session's processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Provider-assigned identifier, unique within a session.
    pub id: String,
    pub kind: ActionKind,
    /// Command string (shell), file contents (file write) or commit note.
    #[serde(default)]
    pub payload: String,
    /// Target paths, relative to the repository root.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Provider flagged this action as network-capable.
    #[serde(default)]
    pub network: bool,
}

/// Machine-readable denial taxonomy. Every denial carries one of these codes
/// so status/review reporting can aggregate by cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    AllowListMiss,
    PathBoundary,
    SensitiveCommand,
    ApprovalRequired,
}

/// Policy verdict attached to a proposed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Denied { reason: DenialReason, detail: String },
}

impl Verdict {
    pub fn denied(reason: DenialReason, detail: impl Into<String>) -> Self {
        Self::Denied {
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Outcome of executing a gated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    Failed,
    /// The action was denied (or its session aborted) and never executed.
    Skipped,
}

/// Evidence reference tying one pass criterion (by index) to an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    /// Index into the sub-task's criteria list.
    pub criterion: usize,
    /// Pointer to the artifact backing the criterion (path, URL, event id).
    pub reference: String,
}

/// Status transition proposed by the provider for one sub-task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusClaim {
    pub sub_task_id: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
}

/// Resource usage counters reported by the provider per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl UsageCounters {
    pub fn add(&mut self, other: UsageCounters) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_parses_known_labels() {
        for kind in [
            ActionKind::ShellCommand,
            ActionKind::FileWrite,
            ActionKind::ArtifactCommit,
        ] {
            assert_eq!(ActionKind::parse(kind.label()), Ok(kind));
        }
    }

    /// Unknown kinds must surface as a distinct typed error, never coerce.
    #[test]
    fn action_kind_rejects_unknown_label() {
        let err = ActionKind::parse("launch_missiles").unwrap_err();
        assert_eq!(err.kind, "launch_missiles");
        assert!(err.to_string().contains("unknown action kind"));
    }

    #[test]
    fn verdict_serializes_with_reason_code() {
        let verdict = Verdict::denied(DenialReason::PathBoundary, "escapes root");
        let json = serde_json::to_string(&verdict).expect("serialize");
        assert!(json.contains("\"decision\":\"denied\""));
        assert!(json.contains("\"reason\":\"path_boundary\""));
    }

    #[test]
    fn usage_counters_accumulate() {
        let mut total = UsageCounters::default();
        total.add(UsageCounters {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        });
        total.add(UsageCounters {
            input_tokens: 1,
            output_tokens: 1,
            total_tokens: 2,
        });
        assert_eq!(total.total_tokens, 17);
    }
}
