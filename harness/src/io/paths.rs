//! Canonical locations of everything under `.harness/`.
//!
//! Centralizing the layout keeps path construction out of the modules that
//! read and write the artifacts.

use std::path::{Path, PathBuf};

pub const HARNESS_DIR: &str = ".harness";

/// Resolved paths for one harness-managed repository.
#[derive(Debug, Clone)]
pub struct HarnessPaths {
    /// Repository root. Action targets are confined to this directory.
    pub repo_root: PathBuf,
    /// `.harness/` root.
    pub harness_dir: PathBuf,
}

impl HarnessPaths {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let harness_dir = repo_root.join(HARNESS_DIR);
        Self {
            repo_root,
            harness_dir,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.harness_dir.join("state")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir().join("config.toml")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.harness_dir.join("ledger")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_dir().join("ledger.json")
    }

    pub fn ledger_snapshot_path(&self, version: u32) -> PathBuf {
        self.ledger_dir().join(format!("ledger.v{version}.json"))
    }

    pub fn rebaseline_notes_path(&self) -> PathBuf {
        self.ledger_dir().join("rebaseline_notes.md")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.harness_dir.join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn run_state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run_state.json")
    }

    pub fn events_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("events.jsonl")
    }

    pub fn sessions_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("sessions")
    }

    pub fn session_record_path(&self, run_id: &str, session: u32) -> PathBuf {
        self.sessions_dir(run_id).join(format!("{session}.json"))
    }

    pub fn session_envelope_path(&self, run_id: &str, session: u32) -> PathBuf {
        self.sessions_dir(run_id)
            .join(format!("{session}.envelope.json"))
    }

    pub fn session_response_path(&self, run_id: &str, session: u32) -> PathBuf {
        self.sessions_dir(run_id)
            .join(format!("{session}.response.json"))
    }

    pub fn session_provider_log_path(&self, run_id: &str, session: u32) -> PathBuf {
        self.sessions_dir(run_id)
            .join(format!("{session}.provider.log"))
    }

    pub fn session_actions_log_path(&self, run_id: &str, session: u32) -> PathBuf {
        self.sessions_dir(run_id)
            .join(format!("{session}.actions.log"))
    }

    pub fn progress_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("progress.md")
    }

    pub fn usage_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("usage.json")
    }

    pub fn commits_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("commits.jsonl")
    }

    pub fn intervention_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("intervention.json")
    }

    pub fn metrics_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("metrics.json")
    }

    pub fn eval_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("eval")
    }

    pub fn eval_report_path(&self, run_id: &str) -> PathBuf {
        self.eval_dir(run_id).join("report.json")
    }

    pub fn review_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("review.json")
    }

    pub fn exists(&self) -> bool {
        self.harness_dir.is_dir()
    }
}

/// Build paths from a repo root, verifying the harness layout exists.
pub fn require_initialized(repo_root: &Path) -> anyhow::Result<HarnessPaths> {
    let paths = HarnessPaths::new(repo_root);
    anyhow::ensure!(
        paths.exists(),
        "no {} directory under {} (run `harness init` first)",
        HARNESS_DIR,
        repo_root.display()
    );
    Ok(paths)
}
