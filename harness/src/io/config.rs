//! Harness configuration.
//!
//! Human-edited TOML at `.harness/state/config.toml`. Every field has a
//! default so a missing file or a partial file both work; `validate()`
//! rejects values that would make a run misbehave.

use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::policy::PolicyConfig;
use crate::core::security::SecurityConfig;
use crate::core::types::ActionKind;
use crate::io::paths::HarnessPaths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Hard ceiling on sessions per run.
    pub max_sessions: u32,
    /// Consecutive no-progress sessions before the run is marked blocked.
    pub stuck_threshold: u32,
    /// Require a passing eval report before marking a run completed.
    pub require_eval_pass: bool,
    /// Eval profile consulted by the completion gate.
    pub eval_profile: String,
    /// Wall-clock budget for one provider invocation, seconds.
    pub session_timeout_secs: u64,
    /// Wall-clock budget for one action, seconds.
    pub action_timeout_secs: u64,
    /// Byte cap on captured provider and action output.
    pub output_limit_bytes: usize,
    /// Action kinds the policy gate permits.
    pub allowed_action_kinds: Vec<ActionKind>,
    /// Operator-issued token unlocking network-capable actions.
    pub approval_token: Option<String>,
    pub security: SecurityConfig,
    pub eval: EvalConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Named check-id lists. A profile here shadows the built-in of the
    /// same name.
    pub profiles: BTreeMap<String, Vec<String>>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_sessions: 30,
            stuck_threshold: 3,
            require_eval_pass: true,
            eval_profile: "default".to_string(),
            session_timeout_secs: 30 * 60,
            action_timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
            allowed_action_kinds: vec![
                ActionKind::ShellCommand,
                ActionKind::FileWrite,
                ActionKind::ArtifactCommit,
            ],
            approval_token: None,
            security: SecurityConfig::default(),
            eval: EvalConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_sessions > 0, "max_sessions must be positive");
        anyhow::ensure!(self.stuck_threshold > 0, "stuck_threshold must be positive");
        anyhow::ensure!(
            self.session_timeout_secs > 0,
            "session_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.action_timeout_secs > 0,
            "action_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.output_limit_bytes > 0,
            "output_limit_bytes must be positive"
        );
        anyhow::ensure!(
            !self.allowed_action_kinds.is_empty(),
            "allowed_action_kinds must not be empty"
        );
        anyhow::ensure!(
            !self.security.allowed_commands.is_empty(),
            "security.allowed_commands must not be empty"
        );
        anyhow::ensure!(
            !self.eval_profile.trim().is_empty(),
            "eval_profile must not be blank"
        );
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    /// Policy-gate view of this config.
    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            allowed_kinds: self.allowed_action_kinds.clone(),
            security: self.security.clone(),
            approval_token: self.approval_token.clone(),
        }
    }
}

/// Load the config, falling back to defaults when the file is absent.
/// A present-but-invalid file is an error, never silently defaulted.
pub fn load_config(paths: &HarnessPaths) -> Result<HarnessConfig> {
    let path = paths.config_path();
    if !path.exists() {
        debug!(path = %path.display(), "config file absent, using defaults");
        return Ok(HarnessConfig::default());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: HarnessConfig =
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validate config {}", path.display()))?;
    Ok(config)
}

/// Write the config as TOML via temp-file-then-rename.
pub fn write_config(paths: &HarnessPaths, config: &HarnessConfig) -> Result<()> {
    config.validate().context("refusing to write invalid config")?;
    let path = paths.config_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let rendered = toml::to_string_pretty(config).context("serialize config")?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, rendered).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    debug!(path = %path.display(), "wrote config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        HarnessConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        let config = load_config(&paths).expect("load");
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn partial_toml_fills_the_rest_from_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        fs::create_dir_all(paths.state_dir()).expect("mkdir");
        fs::write(paths.config_path(), "max_sessions = 5\nstuck_threshold = 2\n")
            .expect("write");
        let config = load_config(&paths).expect("load");
        assert_eq!(config.max_sessions, 5);
        assert_eq!(config.stuck_threshold, 2);
        assert_eq!(config.eval_profile, "default");
    }

    #[test]
    fn invalid_values_fail_loudly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        fs::create_dir_all(paths.state_dir()).expect("mkdir");
        fs::write(paths.config_path(), "max_sessions = 0\n").expect("write");
        assert!(load_config(&paths).is_err());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        let mut config = HarnessConfig {
            max_sessions: 12,
            approval_token: Some("ops".to_string()),
            ..HarnessConfig::default()
        };
        config
            .eval
            .profiles
            .insert("ci".to_string(), vec!["ledger_complete".to_string()]);
        write_config(&paths, &config).expect("write");
        let loaded = load_config(&paths).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn leftover_temp_file_is_ignored_by_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = HarnessPaths::new(dir.path());
        fs::create_dir_all(paths.state_dir()).expect("mkdir");
        // Simulates a crash between temp write and rename.
        fs::write(paths.config_path().with_extension("toml.tmp"), "max_sessions = 0")
            .expect("write");
        let config = load_config(&paths).expect("load");
        assert_eq!(config, HarnessConfig::default());
    }
}
