//! Sub-task ledger: the tamper-resistant record of what the run must achieve.
//!
//! Pure document logic. Persistence (atomic writes, schema-version checks,
//! rebaseline snapshots) lives in `io::ledger_store`. Two properties are
//! enforced here and nowhere else:
//!
//! - status only flips false to true through [`apply_status_update`], and
//!   only with evidence covering every pass criterion;
//! - everything except status is immutable between saves, checked by
//!   [`check_status_only_mutation`]; [`rebaseline`] is the sole audited
//!   exception.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const LEDGER_SCHEMA_VERSION: u32 = 1;

/// One unit of work with binary completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    /// Coarse grouping label (e.g. "scaffold", "implement", "verify").
    pub phase: String,
    pub description: String,
    /// Pass criteria. Evidence refs address these by index.
    pub criteria: Vec<String>,
    /// Binary completion. The only field sessions may change.
    pub status: bool,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub superseded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebaseline_note: Option<String>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub schema_version: u32,
    pub sub_tasks: Vec<SubTask>,
}

impl Ledger {
    pub fn new(sub_tasks: Vec<SubTask>) -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION,
            sub_tasks,
        }
    }

    /// True when the ledger is non-empty and every live entry is done.
    pub fn is_complete(&self) -> bool {
        let live: Vec<&SubTask> = self.sub_tasks.iter().filter(|t| !t.superseded).collect();
        !live.is_empty() && live.iter().all(|t| t.status)
    }

    /// (done, total) over live entries.
    pub fn completion_counts(&self) -> (usize, usize) {
        let live = self.sub_tasks.iter().filter(|t| !t.superseded);
        let mut done = 0;
        let mut total = 0;
        for task in live {
            total += 1;
            if task.status {
                done += 1;
            }
        }
        (done, total)
    }

    fn find_live_mut(&mut self, id: &str) -> Option<&mut SubTask> {
        self.sub_tasks
            .iter_mut()
            .find(|t| t.id == id && !t.superseded)
    }
}

/// Errors from ledger operations. Recoverable: the caller logs and moves on
/// without mutating the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Evidence did not cover every criterion of the sub-task.
    IncompleteEvidence {
        sub_task_id: String,
        missing_criteria: Vec<usize>,
    },
    /// A save attempt changed fields other than status.
    ImmutableFieldViolation { violations: Vec<String> },
    UnknownSubTask { sub_task_id: String },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompleteEvidence {
                sub_task_id,
                missing_criteria,
            } => write!(
                f,
                "sub-task '{sub_task_id}': evidence missing for criteria {missing_criteria:?}"
            ),
            Self::ImmutableFieldViolation { violations } => {
                write!(f, "immutable ledger fields changed: {}", violations.join("; "))
            }
            Self::UnknownSubTask { sub_task_id } => {
                write!(f, "unknown sub-task '{sub_task_id}'")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

/// Flip one sub-task's status to done, gated on evidence.
///
/// Every criterion index must be covered by at least one evidence ref; an
/// out-of-range index counts as uncovered. Returns `Ok(true)` when the
/// status flipped, `Ok(false)` when the entry was already done (idempotent
/// no-op, evidence not re-checked).
pub fn apply_status_update(
    ledger: &mut Ledger,
    sub_task_id: &str,
    evidence: &[crate::core::types::EvidenceRef],
) -> Result<bool, LedgerError> {
    let criteria_len = {
        let Some(task) = ledger.sub_tasks.iter().find(|t| t.id == sub_task_id && !t.superseded)
        else {
            return Err(LedgerError::UnknownSubTask {
                sub_task_id: sub_task_id.to_string(),
            });
        };
        if task.status {
            return Ok(false);
        }
        task.criteria.len()
    };

    let covered: BTreeSet<usize> = evidence
        .iter()
        .filter(|e| !e.reference.trim().is_empty())
        .map(|e| e.criterion)
        .collect();
    let missing: Vec<usize> = (0..criteria_len).filter(|i| !covered.contains(i)).collect();
    if criteria_len == 0 || !missing.is_empty() {
        return Err(LedgerError::IncompleteEvidence {
            sub_task_id: sub_task_id.to_string(),
            missing_criteria: missing,
        });
    }

    // find_live_mut cannot fail here; the entry was found above.
    if let Some(task) = ledger.find_live_mut(sub_task_id) {
        task.status = true;
    }
    Ok(true)
}

/// Compare two ledger snapshots and list every mutation that is not a
/// false-to-true status flip. Messages are stable and sorted so callers can
/// assert on them and logs stay diffable.
pub fn check_status_only_mutation(before: &Ledger, after: &Ledger) -> Vec<String> {
    let mut violations = Vec::new();

    if before.schema_version != after.schema_version {
        violations.push(format!(
            "schema_version changed from {} to {}",
            before.schema_version, after.schema_version
        ));
    }
    if before.sub_tasks.len() != after.sub_tasks.len() {
        violations.push(format!(
            "sub-task count changed from {} to {}",
            before.sub_tasks.len(),
            after.sub_tasks.len()
        ));
    }

    for (b, a) in before.sub_tasks.iter().zip(after.sub_tasks.iter()) {
        if b.id != a.id {
            violations.push(format!("sub-task id '{}' changed to '{}'", b.id, a.id));
            continue;
        }
        if b.phase != a.phase {
            violations.push(format!("sub-task '{}': phase changed", b.id));
        }
        if b.description != a.description {
            violations.push(format!("sub-task '{}': description changed", b.id));
        }
        if b.criteria != a.criteria {
            violations.push(format!("sub-task '{}': criteria changed", b.id));
        }
        if b.version != a.version {
            violations.push(format!("sub-task '{}': version changed", b.id));
        }
        if b.superseded != a.superseded {
            violations.push(format!("sub-task '{}': superseded flag changed", b.id));
        }
        if b.status && !a.status {
            violations.push(format!("sub-task '{}': status regressed to false", b.id));
        }
    }

    violations.sort();
    violations
}

/// Replace a sub-task's criteria through the audited rebaseline path.
///
/// The live entry is marked superseded; a successor with incremented
/// version, the new criteria and status reset to false is appended right
/// after it. Returns the new version number. This is the only operation
/// that may regress status.
pub fn rebaseline(
    ledger: &mut Ledger,
    sub_task_id: &str,
    new_criteria: Vec<String>,
    audit_note: &str,
) -> Result<u32, LedgerError> {
    let index = ledger
        .sub_tasks
        .iter()
        .position(|t| t.id == sub_task_id && !t.superseded)
        .ok_or_else(|| LedgerError::UnknownSubTask {
            sub_task_id: sub_task_id.to_string(),
        })?;

    let new_version = ledger.sub_tasks[index].version + 1;
    let successor = SubTask {
        id: ledger.sub_tasks[index].id.clone(),
        phase: ledger.sub_tasks[index].phase.clone(),
        description: ledger.sub_tasks[index].description.clone(),
        criteria: new_criteria,
        status: false,
        version: new_version,
        superseded: false,
        rebaseline_note: Some(audit_note.to_string()),
    };
    ledger.sub_tasks[index].superseded = true;
    ledger.sub_tasks.insert(index + 1, successor);
    Ok(new_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EvidenceRef;

    fn task(id: &str, criteria: &[&str]) -> SubTask {
        SubTask {
            id: id.to_string(),
            phase: "implement".to_string(),
            description: format!("do {id}"),
            criteria: criteria.iter().map(|c| (*c).to_string()).collect(),
            status: false,
            version: 1,
            superseded: false,
            rebaseline_note: None,
        }
    }

    fn evidence(indices: &[usize]) -> Vec<EvidenceRef> {
        indices
            .iter()
            .map(|i| EvidenceRef {
                criterion: *i,
                reference: format!("runs/r1/sessions/1.json#{i}"),
            })
            .collect()
    }

    #[test]
    fn full_evidence_flips_status() {
        let mut ledger = Ledger::new(vec![task("t1", &["builds", "tests pass"])]);
        let flipped = apply_status_update(&mut ledger, "t1", &evidence(&[0, 1])).expect("update");
        assert!(flipped);
        assert!(ledger.sub_tasks[0].status);
    }

    #[test]
    fn partial_evidence_is_rejected_with_missing_indices() {
        let mut ledger = Ledger::new(vec![task("t1", &["builds", "tests pass", "docs"])]);
        let err = apply_status_update(&mut ledger, "t1", &evidence(&[0])).unwrap_err();
        assert_eq!(
            err,
            LedgerError::IncompleteEvidence {
                sub_task_id: "t1".to_string(),
                missing_criteria: vec![1, 2],
            }
        );
        assert!(!ledger.sub_tasks[0].status);
    }

    #[test]
    fn out_of_range_evidence_does_not_cover_anything() {
        let mut ledger = Ledger::new(vec![task("t1", &["builds"])]);
        let err = apply_status_update(&mut ledger, "t1", &evidence(&[5])).unwrap_err();
        assert!(matches!(err, LedgerError::IncompleteEvidence { .. }));
    }

    #[test]
    fn blank_evidence_references_are_ignored() {
        let mut ledger = Ledger::new(vec![task("t1", &["builds"])]);
        let blank = vec![EvidenceRef {
            criterion: 0,
            reference: "   ".to_string(),
        }];
        assert!(apply_status_update(&mut ledger, "t1", &blank).is_err());
    }

    #[test]
    fn updating_a_done_task_is_an_idempotent_no_op() {
        let mut ledger = Ledger::new(vec![task("t1", &["builds"])]);
        apply_status_update(&mut ledger, "t1", &evidence(&[0])).expect("first");
        let flipped = apply_status_update(&mut ledger, "t1", &[]).expect("second");
        assert!(!flipped);
        assert!(ledger.sub_tasks[0].status);
    }

    #[test]
    fn unknown_sub_task_is_a_typed_error() {
        let mut ledger = Ledger::new(vec![task("t1", &["builds"])]);
        let err = apply_status_update(&mut ledger, "ghost", &evidence(&[0])).unwrap_err();
        assert_eq!(
            err,
            LedgerError::UnknownSubTask {
                sub_task_id: "ghost".to_string()
            }
        );
    }

    #[test]
    fn status_only_mutation_accepts_a_legal_flip() {
        let before = Ledger::new(vec![task("t1", &["builds"])]);
        let mut after = before.clone();
        after.sub_tasks[0].status = true;
        assert!(check_status_only_mutation(&before, &after).is_empty());
    }

    #[test]
    fn immutable_field_edits_are_listed_stably() {
        let before = Ledger::new(vec![task("t1", &["builds"]), task("t2", &["ships"])]);
        let mut after = before.clone();
        after.sub_tasks[0].description = "something else".to_string();
        after.sub_tasks[1].criteria.push("extra".to_string());
        let violations = check_status_only_mutation(&before, &after);
        assert_eq!(
            violations,
            vec![
                "sub-task 't1': description changed".to_string(),
                "sub-task 't2': criteria changed".to_string(),
            ]
        );
    }

    #[test]
    fn status_regression_is_a_violation() {
        let mut before = Ledger::new(vec![task("t1", &["builds"])]);
        before.sub_tasks[0].status = true;
        let mut after = before.clone();
        after.sub_tasks[0].status = false;
        let violations = check_status_only_mutation(&before, &after);
        assert_eq!(violations, vec!["sub-task 't1': status regressed to false".to_string()]);
    }

    #[test]
    fn removed_or_reordered_entries_are_violations() {
        let before = Ledger::new(vec![task("t1", &["a"]), task("t2", &["b"])]);
        let after = Ledger::new(vec![task("t2", &["b"]), task("t1", &["a"])]);
        assert!(!check_status_only_mutation(&before, &after).is_empty());

        let shrunk = Ledger::new(vec![task("t1", &["a"])]);
        assert!(!check_status_only_mutation(&before, &shrunk).is_empty());
    }

    #[test]
    fn rebaseline_supersedes_and_appends_a_fresh_version() {
        let mut ledger = Ledger::new(vec![task("t1", &["old criterion"])]);
        ledger.sub_tasks[0].status = true;

        let version = rebaseline(
            &mut ledger,
            "t1",
            vec!["new criterion".to_string()],
            "requirements changed",
        )
        .expect("rebaseline");

        assert_eq!(version, 2);
        assert_eq!(ledger.sub_tasks.len(), 2);
        assert!(ledger.sub_tasks[0].superseded);
        assert!(ledger.sub_tasks[0].status, "history keeps the old status");
        let successor = &ledger.sub_tasks[1];
        assert!(!successor.superseded);
        assert!(!successor.status);
        assert_eq!(successor.version, 2);
        assert_eq!(successor.criteria, vec!["new criterion".to_string()]);
        assert_eq!(
            successor.rebaseline_note.as_deref(),
            Some("requirements changed")
        );
    }

    #[test]
    fn completion_ignores_superseded_entries() {
        let mut ledger = Ledger::new(vec![task("t1", &["a"])]);
        apply_status_update(&mut ledger, "t1", &evidence(&[0])).expect("update");
        assert!(ledger.is_complete());

        rebaseline(&mut ledger, "t1", vec!["b".to_string()], "note").expect("rebaseline");
        assert!(!ledger.is_complete());
        assert_eq!(ledger.completion_counts(), (0, 1));
    }

    #[test]
    fn empty_ledger_is_never_complete() {
        assert!(!Ledger::new(Vec::new()).is_complete());
    }
}
