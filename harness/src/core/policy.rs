//! Policy gate for proposed actions.
//!
//! Every action a provider proposes passes through [`evaluate`] exactly once
//! before execution. The gate is ordered and effect-free: rules run in a
//! fixed sequence, the first failing rule produces the verdict, and the gate
//! itself never executes anything.

use std::path::Path;

use crate::core::path::resolve_within;
use crate::core::security::{self, SecurityConfig};
use crate::core::types::{Action, ActionKind, DenialReason, Verdict};

/// Substrings that mark a shell command as network-capable even when the
/// provider did not flag it.
const NETWORK_TOKENS: [&str; 6] = [
    "http://",
    "https://",
    "curl ",
    "wget ",
    "pip install",
    "npm install",
];

/// Gate settings, derived from the harness config per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Action kinds the current configuration permits at all.
    pub allowed_kinds: Vec<ActionKind>,
    pub security: SecurityConfig,
    /// Present iff an operator pre-approved network access for this run.
    pub approval_token: Option<String>,
}

/// Evaluate one proposed action. Ordered; first failing rule wins.
///
/// 1. kind must be in the allowed set
/// 2. every target path must resolve inside `repo_root`
/// 3. shell commands must pass the security validator
/// 4. network-capable actions require an approval token
pub fn evaluate(action: &Action, cfg: &PolicyConfig, repo_root: &Path) -> Verdict {
    if !cfg.allowed_kinds.contains(&action.kind) {
        return Verdict::denied(
            DenialReason::AllowListMiss,
            format!("action kind '{}' is not permitted", action.kind.label()),
        );
    }

    for target in &action.targets {
        if resolve_within(repo_root, target).is_none() {
            return Verdict::denied(
                DenialReason::PathBoundary,
                format!("target '{target}' resolves outside the repository root"),
            );
        }
    }

    if action.kind == ActionKind::ShellCommand {
        let verdict = security::validate(&action.payload, &cfg.security);
        if !verdict.is_approved() {
            return verdict;
        }
    }

    if is_network_capable(action) && cfg.approval_token.is_none() {
        return Verdict::denied(
            DenialReason::ApprovalRequired,
            "network-capable action requires an approval token",
        );
    }

    Verdict::Approved
}

fn is_network_capable(action: &Action) -> bool {
    if action.network {
        return true;
    }
    action.kind == ActionKind::ShellCommand
        && NETWORK_TOKENS.iter().any(|t| action.payload.contains(t))
}
