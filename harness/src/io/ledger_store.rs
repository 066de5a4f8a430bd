//! Ledger persistence.
//!
//! Wraps the pure document logic in `core::ledger` with atomic JSON writes,
//! a loud schema-version check, the status-only-mutation guard on every
//! save, and the rebaseline snapshot/audit-note trail.

use std::fs::{self, OpenOptions};
use std::io::Write;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::ledger::{
    self, LEDGER_SCHEMA_VERSION, Ledger, LedgerError,
};
use crate::io::events::utc_now_iso;
use crate::io::paths::HarnessPaths;
use crate::io::run_state::write_json_atomic;

/// Load the current ledger. An unrecognized schema version is fatal: the
/// document is never migrated by guesswork.
pub fn load_ledger(paths: &HarnessPaths) -> Result<Ledger> {
    let path = paths.ledger_path();
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read ledger {}", path.display()))?;
    let ledger: Ledger = serde_json::from_str(&raw)
        .with_context(|| format!("parse ledger {}", path.display()))?;
    anyhow::ensure!(
        ledger.schema_version == LEDGER_SCHEMA_VERSION,
        "ledger {} has schema version {} (supported: {})",
        path.display(),
        ledger.schema_version,
        LEDGER_SCHEMA_VERSION
    );
    Ok(ledger)
}

/// Persist the ledger, enforcing that only status changed relative to
/// `before`. Any other mutation aborts the save with
/// [`LedgerError::ImmutableFieldViolation`].
pub fn save_ledger_guarded(
    paths: &HarnessPaths,
    before: &Ledger,
    after: &Ledger,
) -> Result<()> {
    let violations = ledger::check_status_only_mutation(before, after);
    if !violations.is_empty() {
        warn!(count = violations.len(), "rejected ledger save");
        return Err(LedgerError::ImmutableFieldViolation { violations }.into());
    }
    write_json_atomic(&paths.ledger_path(), after)?;
    debug!(path = %paths.ledger_path().display(), "saved ledger");
    Ok(())
}

/// Unguarded write, used by init and by rebaseline (the audited exception).
pub fn write_ledger(paths: &HarnessPaths, ledger: &Ledger) -> Result<()> {
    write_json_atomic(&paths.ledger_path(), ledger)
}

/// Rebaseline one sub-task: snapshot the current document to
/// `ledger.v{N}.json`, apply the mutation, persist, and append the audit
/// note. Returns the new version number.
pub fn rebaseline_sub_task(
    paths: &HarnessPaths,
    sub_task_id: &str,
    new_criteria: Vec<String>,
    audit_note: &str,
) -> Result<u32> {
    let mut ledger = load_ledger(paths)?;

    let snapshot_version = next_snapshot_version(paths)?;
    write_json_atomic(&paths.ledger_snapshot_path(snapshot_version), &ledger)?;

    let new_version = ledger::rebaseline(&mut ledger, sub_task_id, new_criteria, audit_note)
        .with_context(|| format!("rebaseline sub-task '{sub_task_id}'"))?;
    write_ledger(paths, &ledger)?;

    let notes_path = paths.rebaseline_notes_path();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&notes_path)
        .with_context(|| format!("open {}", notes_path.display()))?;
    writeln!(
        file,
        "## {} — {sub_task_id} v{new_version}\n\n{audit_note}\n",
        utc_now_iso()
    )
    .with_context(|| format!("append to {}", notes_path.display()))?;

    debug!(sub_task_id, new_version, "rebaselined sub-task");
    Ok(new_version)
}

/// First unused `ledger.v{N}.json` slot. Snapshots are append-only history.
fn next_snapshot_version(paths: &HarnessPaths) -> Result<u32> {
    let mut version = 1;
    while paths.ledger_snapshot_path(version).exists() {
        version += 1;
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::SubTask;
    use crate::core::types::EvidenceRef;

    fn seed(paths: &HarnessPaths) -> Ledger {
        let ledger = Ledger::new(vec![SubTask {
            id: "t1".to_string(),
            phase: "implement".to_string(),
            description: "do t1".to_string(),
            criteria: vec!["builds".to_string()],
            status: false,
            version: 1,
            superseded: false,
            rebaseline_note: None,
        }]);
        write_ledger(paths, &ledger).expect("seed");
        ledger
    }

    #[test]
    fn guarded_save_accepts_a_status_flip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        let before = seed(&paths);
        let mut after = before.clone();
        ledger::apply_status_update(
            &mut after,
            "t1",
            &[EvidenceRef {
                criterion: 0,
                reference: "evidence".to_string(),
            }],
        )
        .expect("update");
        save_ledger_guarded(&paths, &before, &after).expect("save");
        assert!(load_ledger(&paths).expect("load").sub_tasks[0].status);
    }

    #[test]
    fn guarded_save_rejects_criteria_edits_and_leaves_disk_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        let before = seed(&paths);
        let mut after = before.clone();
        after.sub_tasks[0].criteria = vec!["weakened".to_string()];

        let err = save_ledger_guarded(&paths, &before, &after).unwrap_err();
        let ledger_err = err.downcast_ref::<LedgerError>().expect("typed error");
        assert!(matches!(ledger_err, LedgerError::ImmutableFieldViolation { .. }));
        assert_eq!(load_ledger(&paths).expect("load"), before);
    }

    #[test]
    fn unknown_schema_version_fails_loudly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        seed(&paths);
        let path = paths.ledger_path();
        let raw = fs::read_to_string(&path).expect("read");
        fs::write(&path, raw.replace("\"schema_version\": 1", "\"schema_version\": 7"))
            .expect("write");
        let err = load_ledger(&paths).unwrap_err();
        assert!(err.to_string().contains("schema version 7"));
    }

    #[test]
    fn rebaseline_snapshots_then_mutates_then_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        let original = seed(&paths);

        let version = rebaseline_sub_task(
            &paths,
            "t1",
            vec!["new criterion".to_string()],
            "scope changed after review",
        )
        .expect("rebaseline");
        assert_eq!(version, 2);

        // Snapshot holds the pre-mutation document.
        let snapshot_raw =
            fs::read_to_string(paths.ledger_snapshot_path(1)).expect("snapshot");
        let snapshot: Ledger = serde_json::from_str(&snapshot_raw).expect("parse");
        assert_eq!(snapshot, original);

        let current = load_ledger(&paths).expect("load");
        assert_eq!(current.sub_tasks.len(), 2);
        assert!(current.sub_tasks[0].superseded);

        let notes = fs::read_to_string(paths.rebaseline_notes_path()).expect("notes");
        assert!(notes.contains("t1 v2"));
        assert!(notes.contains("scope changed after review"));
    }

    #[test]
    fn consecutive_rebaselines_use_fresh_snapshot_slots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        seed(&paths);
        rebaseline_sub_task(&paths, "t1", vec!["a".to_string()], "first").expect("first");
        rebaseline_sub_task(&paths, "t1", vec!["b".to_string()], "second").expect("second");
        assert!(paths.ledger_snapshot_path(1).exists());
        assert!(paths.ledger_snapshot_path(2).exists());
    }
}
