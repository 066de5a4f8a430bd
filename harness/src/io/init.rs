//! Workspace scaffolding.
//!
//! `init_harness` lays down the `.harness/` tree: default config, a starter
//! ledger, planning placeholders and the state pointer. Refuses to touch an
//! already-initialized repository unless forced.

use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use crate::core::ledger::{Ledger, SubTask};
use crate::io::config::{HarnessConfig, write_config};
use crate::io::ledger_store::write_ledger;
use crate::io::paths::HarnessPaths;
use crate::io::run_state::{HarnessState, write_harness_state};

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Re-initialize over an existing `.harness/` directory.
    pub force: bool,
}

const RESEARCH_PLACEHOLDER: &str = "\
# Research

Notes gathered before and during the run. Sessions may read this file;
only operators should edit it.
";

const PLAN_PLACEHOLDER: &str = "\
# Plan

High-level approach for the task. The sub-task ledger in ledger.json is
the authoritative breakdown; this file holds the narrative.
";

/// Starter ledger. Operators are expected to replace these entries with a
/// task-specific breakdown before the first run.
fn starter_ledger() -> Ledger {
    Ledger::new(vec![
        SubTask {
            id: "scaffold".to_string(),
            phase: "setup".to_string(),
            description: "Set up the project structure needed for the task".to_string(),
            criteria: vec!["project builds or loads cleanly".to_string()],
            status: false,
            version: 1,
            superseded: false,
            rebaseline_note: None,
        },
        SubTask {
            id: "implement".to_string(),
            phase: "implement".to_string(),
            description: "Implement the requested change".to_string(),
            criteria: vec![
                "change is present in the working tree".to_string(),
                "no previously passing check regressed".to_string(),
            ],
            status: false,
            version: 1,
            superseded: false,
            rebaseline_note: None,
        },
        SubTask {
            id: "verify".to_string(),
            phase: "verify".to_string(),
            description: "Verify the change against its acceptance criteria".to_string(),
            criteria: vec!["verification output recorded as an artifact".to_string()],
            status: false,
            version: 1,
            superseded: false,
            rebaseline_note: None,
        },
    ])
}

/// Initialize the harness layout under `paths.repo_root`.
pub fn init_harness(paths: &HarnessPaths, options: &InitOptions) -> Result<()> {
    if paths.exists() && !options.force {
        anyhow::bail!(
            "{} already exists (pass --force to re-initialize)",
            paths.harness_dir.display()
        );
    }

    for dir in [paths.state_dir(), paths.ledger_dir(), paths.runs_dir()] {
        fs::create_dir_all(&dir).with_context(|| format!("create dir {}", dir.display()))?;
    }

    write_config(paths, &HarnessConfig::default())?;
    write_ledger(paths, &starter_ledger())?;
    write_harness_state(paths, &mut HarnessState::default())?;

    let research = paths.ledger_dir().join("research.md");
    fs::write(&research, RESEARCH_PLACEHOLDER)
        .with_context(|| format!("write {}", research.display()))?;
    let plan = paths.ledger_dir().join("plan.md");
    fs::write(&plan, PLAN_PLACEHOLDER).with_context(|| format!("write {}", plan.display()))?;

    info!(root = %paths.harness_dir.display(), "initialized harness layout");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::io::ledger_store::load_ledger;

    #[test]
    fn init_lays_down_the_full_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        init_harness(&paths, &InitOptions::default()).expect("init");

        assert!(paths.config_path().exists());
        assert!(paths.ledger_path().exists());
        assert!(paths.state_path().exists());
        assert!(paths.ledger_dir().join("research.md").exists());
        assert!(paths.ledger_dir().join("plan.md").exists());

        let ledger = load_ledger(&paths).expect("ledger");
        assert!(!ledger.sub_tasks.is_empty());
        assert!(!ledger.is_complete());
        load_config(&paths).expect("config parses");
    }

    #[test]
    fn init_refuses_an_existing_layout_without_force() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        init_harness(&paths, &InitOptions::default()).expect("first");
        let err = init_harness(&paths, &InitOptions::default()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        init_harness(&paths, &InitOptions { force: true }).expect("forced");
    }
}
