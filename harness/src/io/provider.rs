//! Provider abstraction for agent invocation.
//!
//! The [`Provider`] trait decouples session execution from the actual agent
//! backend (currently `codex exec`). A provider receives a task envelope on
//! disk and must write a response file; the harness validates that file
//! against the embedded JSON schema before parsing it. Tests use scripted
//! providers that write predetermined responses without spawning processes.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::ledger::Ledger;
use crate::core::types::{Action, ActionKind, StatusClaim, UnknownActionError, UsageCounters};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Wire schema every provider response must satisfy.
pub const PROVIDER_RESPONSE_SCHEMA: &str =
    include_str!("../../schemas/provider_response.schema.json");

pub const CONTRACT_VERSION: &str = "1.0";

/// Everything the provider gets to see for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub contract_version: String,
    pub run_id: String,
    pub session: u32,
    /// Operator task text, verbatim.
    pub task: String,
    /// Current ledger snapshot, read-only for the provider.
    pub ledger: Ledger,
    /// Summary carried over from the previous session, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuity_summary: Option<String>,
    /// Action kinds the policy gate will consider at all.
    pub allowed_actions: Vec<ActionKind>,
}

/// Action as it appears on the wire. The kind stays a string until
/// [`action_from_raw`] resolves it, so unknown kinds surface as a typed
/// error instead of a serde failure buried in the whole response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAction {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub network: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    #[serde(default)]
    pub actions: Vec<RawAction>,
    #[serde(default)]
    pub status_claims: Vec<StatusClaim>,
    pub summary: String,
    #[serde(default)]
    pub usage: UsageCounters,
}

/// Resolve a wire action into the closed action type.
pub fn action_from_raw(raw: &RawAction) -> Result<Action, UnknownActionError> {
    Ok(Action {
        id: raw.id.clone(),
        kind: ActionKind::parse(&raw.kind)?,
        payload: raw.payload.clone(),
        targets: raw.targets.clone(),
        network: raw.network,
    })
}

/// Parameters for one provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Working directory for the provider process.
    pub workdir: PathBuf,
    /// Path to the serialized [`TaskEnvelope`].
    pub envelope_path: PathBuf,
    /// Path where the provider must write its response JSON.
    pub response_path: PathBuf,
    /// Path to the JSON Schema constraining the response.
    pub response_schema_path: PathBuf,
    /// Path to write provider stdout/stderr log.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over agent backends.
pub trait Provider {
    /// Run the agent. Must write the response to `request.response_path`.
    fn invoke(&self, request: &ProviderRequest) -> Result<()>;
}

/// The provider misbehaved: missing, malformed or schema-violating
/// response, timeout, or nonzero exit. Fails the session, not the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub message: String,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error: {}", self.message)
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    fn new(message: impl Into<String>) -> anyhow::Error {
        Self {
            message: message.into(),
        }
        .into()
    }
}

/// Provider that spawns `codex exec`.
pub struct CodexProvider;

impl Provider for CodexProvider {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &ProviderRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "starting codex exec");

        if !request.response_schema_path.exists() {
            return Err(anyhow!(
                "missing response schema {}",
                request.response_schema_path.display()
            ));
        }
        let envelope = fs::read(&request.envelope_path)
            .with_context(|| format!("read envelope {}", request.envelope_path.display()))?;
        if let Some(parent) = request.response_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create response dir {}", parent.display()))?;
        }

        let mut cmd = Command::new("codex");
        cmd.arg("exec")
            .arg("--sandbox")
            .arg("workspace-write")
            // Allow running in directories without a git repository. Required
            // for tests that use temp directories, and for workspaces not yet
            // under version control.
            .arg("--skip-git-repo-check")
            .arg("--output-schema")
            .arg(&request.response_schema_path)
            .arg("--output-last-message")
            .arg(&request.response_path)
            .arg("-")
            .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(&envelope),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run codex exec")?;

        write_provider_log(&request.log_path, &output, request.output_limit_bytes)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "codex exec timed out");
            return Err(ProviderError::new(format!(
                "codex exec timed out after {:?}",
                request.timeout
            )));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "codex exec failed");
            return Err(ProviderError::new(format!(
                "codex exec failed with status {:?}",
                output.status.code()
            )));
        }

        debug!("codex exec completed successfully");
        Ok(())
    }
}

/// Invoke the provider, then validate and parse its response file.
///
/// Every failure mode here (provider error, missing file, schema violation,
/// parse failure) is a [`ProviderError`]: the session fails, the ledger is
/// untouched, and the run stays eligible for further sessions.
#[instrument(skip_all, fields(response_path = %request.response_path.display()))]
pub fn invoke_and_parse<P: Provider>(
    provider: &P,
    request: &ProviderRequest,
) -> Result<ProviderResponse> {
    provider.invoke(request).map_err(|err| {
        if err.downcast_ref::<ProviderError>().is_some() {
            err
        } else {
            ProviderError::new(err.to_string())
        }
    })?;

    if !request.response_path.exists() {
        return Err(ProviderError::new(format!(
            "missing provider response {}",
            request.response_path.display()
        )));
    }
    let contents = fs::read_to_string(&request.response_path)
        .with_context(|| format!("read response {}", request.response_path.display()))?;
    let instance: Value = serde_json::from_str(&contents)
        .map_err(|err| ProviderError::new(format!("response is not JSON: {err}")))?;

    validate_response_schema(&instance)?;

    let response: ProviderResponse = serde_json::from_value(instance)
        .map_err(|err| ProviderError::new(format!("response shape mismatch: {err}")))?;
    debug!(
        actions = response.actions.len(),
        claims = response.status_claims.len(),
        "parsed provider response"
    );
    Ok(response)
}

/// Validate a response instance against the embedded schema (Draft 2020-12).
pub fn validate_response_schema(instance: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(PROVIDER_RESPONSE_SCHEMA).context("parse embedded schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(ProviderError::new(format!(
            "schema validation failed:\n- {}",
            messages.join("\n- ")
        )));
    }
    Ok(())
}

fn write_provider_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create provider log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice("provider"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice("provider"));
    if output.timed_out {
        buf.push_str("\n[provider timed out]\n");
    }

    if buf.len() > output_limit {
        let truncated = format!(
            "{}\n[truncated {} bytes]\n",
            &buf[..output_limit],
            buf.len() - output_limit
        );
        fs::write(path, truncated)
            .with_context(|| format!("write provider log {}", path.display()))?;
        return Ok(());
    }

    fs::write(path, buf).with_context(|| format!("write provider log {}", path.display()))
}

/// Serialize the envelope for the provider, pretty with trailing newline.
pub fn write_envelope(path: &Path, envelope: &TaskEnvelope) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create envelope dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(envelope).context("serialize envelope")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write envelope {}", path.display()))
}

/// Materialize the embedded schema next to the session artifacts so external
/// providers can read it.
pub fn write_response_schema(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create schema dir {}", parent.display()))?;
    }
    serde_json::from_str::<Value>(PROVIDER_RESPONSE_SCHEMA).context("parse embedded schema")?;
    fs::write(path, PROVIDER_RESPONSE_SCHEMA)
        .with_context(|| format!("write schema {}", path.display()))
}
