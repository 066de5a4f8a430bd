//! Shell command validation.
//!
//! Pure. Every shell command proposed by a provider passes through
//! [`validate`] before execution. The validator holds a fixed allow-list of
//! command verbs and a deny-list of high-risk patterns; deny always takes
//! precedence over allow. Compound commands are split into segments and every
//! segment must pass on its own.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{DenialReason, Verdict};

/// Command-validation settings, embedded in the harness config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Command verbs (basenames) a shell action may invoke.
    pub allowed_commands: Vec<String>,
    /// Subtree (relative to the repo root) where destructive file
    /// operations like `rm` are permitted.
    pub safe_subtree: String,
    /// Process names `pkill` may target by name.
    pub allowed_kill_targets: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_commands: [
                "ls", "cat", "head", "tail", "wc", "grep", "find", "cp", "mv", "mkdir", "rm",
                "touch", "chmod", "unzip", "pwd", "cd", "echo", "printf", "curl", "which", "env",
                "python", "python3", "npm", "npx", "node", "git", "ps", "lsof", "sleep", "pkill",
                "cargo", "sh",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            safe_subtree: "build".to_string(),
            allowed_kill_targets: ["node", "npm", "npx", "vite", "next"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

// Deny patterns are checked against the whole command string before any
// allow-list logic runs. Deny > allow, always.
static DENY_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"pkill\s+(-\S*g|\-\-pgroup)").unwrap(),
            "process-group kill via pkill",
        ),
        (
            Regex::new(r"\bkill\s+(-\S+\s+)*--?\s*-\d+").unwrap(),
            "process-group kill via negative pid",
        ),
        (
            Regex::new(r"\brm\s+(-\S*[rf]\S*\s+)+/(\s|$)").unwrap(),
            "recursive removal of filesystem root",
        ),
        (
            Regex::new(r"\bsudo\b").unwrap(),
            "privilege escalation",
        ),
    ]
});

static SEGMENT_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&&|\|\||;|\|").unwrap());

static CHMOD_MODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[ugoa]*\+x$").unwrap());

/// Validate one shell command string against the security config.
///
/// Returns `Verdict::Approved` only when every segment of the command is
/// individually acceptable. Any structural doubt (unparseable quoting,
/// unknown verb, boundary-escaping path) resolves to a denial.
pub fn validate(command: &str, cfg: &SecurityConfig) -> Verdict {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Verdict::denied(DenialReason::AllowListMiss, "empty command");
    }

    for (pattern, what) in DENY_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return Verdict::denied(
                DenialReason::SensitiveCommand,
                format!("denied pattern: {what}"),
            );
        }
    }

    for segment in SEGMENT_SPLIT.split(trimmed) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if let Verdict::Denied { reason, detail } = validate_segment(segment, cfg) {
            return Verdict::Denied { reason, detail };
        }
    }
    Verdict::Approved
}

fn validate_segment(segment: &str, cfg: &SecurityConfig) -> Verdict {
    let Some(tokens) = shell_tokens(segment) else {
        return Verdict::denied(
            DenialReason::SensitiveCommand,
            format!("unparseable quoting in segment '{segment}'"),
        );
    };
    let Some(verb) = tokens.first() else {
        return Verdict::Approved;
    };
    let basename = verb.rsplit('/').next().unwrap_or(verb);
    if !cfg.allowed_commands.iter().any(|c| c == basename) {
        return Verdict::denied(
            DenialReason::AllowListMiss,
            format!("command '{basename}' is not allow-listed"),
        );
    }
    match basename {
        "rm" => validate_rm(&tokens, cfg),
        "chmod" => validate_chmod(&tokens, cfg),
        "pkill" => validate_pkill(&tokens, cfg),
        _ => Verdict::Approved,
    }
}

/// `rm` may only touch relative, non-escaping paths inside the safe subtree.
fn validate_rm(tokens: &[String], cfg: &SecurityConfig) -> Verdict {
    let paths: Vec<&String> = tokens[1..].iter().filter(|t| !t.starts_with('-')).collect();
    if paths.is_empty() {
        return Verdict::denied(DenialReason::SensitiveCommand, "rm without explicit paths");
    }
    for path in paths {
        if !path_within_subtree(path, &cfg.safe_subtree) {
            return Verdict::denied(
                DenialReason::SensitiveCommand,
                format!("rm target '{path}' outside safe subtree '{}'", cfg.safe_subtree),
            );
        }
    }
    Verdict::Approved
}

/// `chmod` may only add execute bits, and only on relative non-escaping paths.
fn validate_chmod(tokens: &[String], _cfg: &SecurityConfig) -> Verdict {
    let args = &tokens[1..];
    if args.iter().any(|t| t.starts_with('-')) {
        return Verdict::denied(DenialReason::SensitiveCommand, "chmod with flags");
    }
    let Some(mode) = args.first() else {
        return Verdict::denied(DenialReason::SensitiveCommand, "chmod without mode");
    };
    if !CHMOD_MODE.is_match(mode) {
        return Verdict::denied(
            DenialReason::SensitiveCommand,
            format!("chmod mode '{mode}' widens permissions beyond +x"),
        );
    }
    let targets = &args[1..];
    if targets.is_empty() {
        return Verdict::denied(DenialReason::SensitiveCommand, "chmod without targets");
    }
    for target in targets {
        if target.starts_with('/') || target.split('/').any(|c| c == "..") {
            return Verdict::denied(
                DenialReason::SensitiveCommand,
                format!("chmod target '{target}' escapes the repository"),
            );
        }
    }
    Verdict::Approved
}

/// `pkill` may only name-match a small set of dev-server processes.
fn validate_pkill(tokens: &[String], cfg: &SecurityConfig) -> Verdict {
    let names: Vec<&String> = tokens[1..].iter().filter(|t| !t.starts_with('-')).collect();
    if names.is_empty() {
        return Verdict::denied(DenialReason::SensitiveCommand, "pkill without a target name");
    }
    for name in names {
        if !cfg.allowed_kill_targets.iter().any(|t| t == name.as_str()) {
            return Verdict::denied(
                DenialReason::SensitiveCommand,
                format!("pkill target '{name}' is not allow-listed"),
            );
        }
    }
    Verdict::Approved
}

fn path_within_subtree(path: &str, subtree: &str) -> bool {
    if path.starts_with('/') {
        return false;
    }
    if path.split('/').any(|c| c == "..") {
        return false;
    }
    path == subtree || path.starts_with(&format!("{subtree}/"))
}

/// Quote-aware tokenizer for a single command segment. Returns `None` on
/// unbalanced quotes so callers can deny instead of guessing.
fn shell_tokens(segment: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in segment.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if quote.is_some() {
        return None;
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Some(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SecurityConfig {
        SecurityConfig::default()
    }

    fn assert_denied(command: &str, reason: DenialReason) {
        match validate(command, &cfg()) {
            Verdict::Denied { reason: got, .. } => assert_eq!(got, reason, "command: {command}"),
            Verdict::Approved => panic!("expected denial for: {command}"),
        }
    }

    #[test]
    fn plain_listed_command_is_approved() {
        assert!(validate("ls -la build", &cfg()).is_approved());
        assert!(validate("git status", &cfg()).is_approved());
    }

    #[test]
    fn unknown_verb_is_an_allow_list_miss() {
        assert_denied("nmap localhost", DenialReason::AllowListMiss);
    }

    /// Deny patterns win even when every verb is allow-listed.
    #[test]
    fn deny_patterns_take_precedence_over_allow_list() {
        assert_denied("rm -rf /", DenialReason::SensitiveCommand);
        assert_denied("pkill -g 0", DenialReason::SensitiveCommand);
        assert_denied("kill -TERM -- -1234", DenialReason::SensitiveCommand);
        assert_denied("sudo ls", DenialReason::SensitiveCommand);
    }

    #[test]
    fn every_segment_of_a_compound_command_is_validated() {
        assert_denied("ls && nmap localhost", DenialReason::AllowListMiss);
        assert_denied("echo ok; rm /etc/passwd", DenialReason::SensitiveCommand);
        assert!(validate("ls | grep foo", &cfg()).is_approved());
    }

    #[test]
    fn rm_is_confined_to_the_safe_subtree() {
        assert!(validate("rm build/output.tmp", &cfg()).is_approved());
        assert!(validate("rm -r build/cache", &cfg()).is_approved());
        assert_denied("rm src/main.rs", DenialReason::SensitiveCommand);
        assert_denied("rm build/../src/main.rs", DenialReason::SensitiveCommand);
        assert_denied("rm /tmp/x", DenialReason::SensitiveCommand);
        assert_denied("rm -rf", DenialReason::SensitiveCommand);
    }

    #[test]
    fn chmod_only_adds_execute_bits() {
        assert!(validate("chmod +x build/run.sh", &cfg()).is_approved());
        assert!(validate("chmod u+x scripts/init.sh", &cfg()).is_approved());
        assert_denied("chmod 777 build/run.sh", DenialReason::SensitiveCommand);
        assert_denied("chmod -R +x build", DenialReason::SensitiveCommand);
        assert_denied("chmod +x /usr/bin/thing", DenialReason::SensitiveCommand);
        assert_denied("chmod +x ../outside.sh", DenialReason::SensitiveCommand);
    }

    #[test]
    fn pkill_only_targets_known_dev_servers() {
        assert!(validate("pkill node", &cfg()).is_approved());
        assert!(validate("pkill -f vite", &cfg()).is_approved());
        assert_denied("pkill sshd", DenialReason::SensitiveCommand);
        assert_denied("pkill", DenialReason::SensitiveCommand);
    }

    #[test]
    fn unbalanced_quoting_is_denied() {
        assert_denied("echo 'oops", DenialReason::SensitiveCommand);
    }

    #[test]
    fn tokenizer_respects_quotes() {
        let tokens = shell_tokens("grep 'two words' file.txt").unwrap();
        assert_eq!(tokens, vec!["grep", "two words", "file.txt"]);
    }
}
