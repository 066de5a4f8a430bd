//! Test-only helpers: scripted provider/action-runner fakes and builders
//! for ledgers, actions and responses.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};

use crate::core::ledger::{Ledger, SubTask};
use crate::core::types::{Action, ActionOutcome, EvidenceRef, StatusClaim, UsageCounters};
use crate::io::actions::{ActionContext, ActionRunner};
use crate::io::init::{InitOptions, init_harness};
use crate::io::paths::HarnessPaths;
use crate::io::provider::{Provider, ProviderRequest, ProviderResponse, RawAction};

/// Initialize a harness layout in a test directory and return its paths.
pub fn init_root(dir: &Path) -> HarnessPaths {
    let paths = HarnessPaths::new(dir);
    init_harness(&paths, &InitOptions::default()).expect("init harness");
    paths
}

/// Create a deterministic sub-task with `criteria_count` numbered criteria.
pub fn sub_task(id: &str, criteria_count: usize) -> SubTask {
    SubTask {
        id: id.to_string(),
        phase: "implement".to_string(),
        description: format!("{id} description"),
        criteria: (0..criteria_count)
            .map(|i| format!("{id} criterion {i}"))
            .collect(),
        status: false,
        version: 1,
        superseded: false,
        rebaseline_note: None,
    }
}

/// Create a ledger from (id, criteria_count) pairs.
pub fn ledger(entries: &[(&str, usize)]) -> Ledger {
    Ledger::new(entries.iter().map(|(id, n)| sub_task(id, *n)).collect())
}

/// Shell-command wire action.
pub fn shell_action(id: &str, payload: &str) -> RawAction {
    RawAction {
        id: id.to_string(),
        kind: "shell_command".to_string(),
        payload: payload.to_string(),
        targets: Vec::new(),
        network: false,
    }
}

/// File-write wire action.
pub fn file_action(id: &str, target: &str, payload: &str) -> RawAction {
    RawAction {
        id: id.to_string(),
        kind: "file_write".to_string(),
        payload: payload.to_string(),
        targets: vec![target.to_string()],
        network: false,
    }
}

/// Status claim covering criteria `0..criteria_count` with synthetic refs.
pub fn claim(sub_task_id: &str, criteria_count: usize) -> StatusClaim {
    StatusClaim {
        sub_task_id: sub_task_id.to_string(),
        evidence: (0..criteria_count)
            .map(|i| EvidenceRef {
                criterion: i,
                reference: format!("artifact for criterion {i}"),
            })
            .collect(),
    }
}

/// Assemble a provider response with zeroed usage.
pub fn response(
    actions: Vec<RawAction>,
    status_claims: Vec<StatusClaim>,
    summary: &str,
) -> ProviderResponse {
    ProviderResponse {
        actions,
        status_claims,
        summary: summary.to_string(),
        usage: UsageCounters::default(),
    }
}

/// One scripted provider invocation.
pub enum ScriptedInvoke {
    /// Write this response to the response path.
    Respond(ProviderResponse),
    /// Fail the invocation with this message.
    Error(String),
    /// Return Ok without writing a response file.
    NoResponseFile,
}

/// Provider fake that replays a queued script instead of spawning anything.
pub struct ScriptedProvider {
    script: RefCell<VecDeque<ScriptedInvoke>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ScriptedInvoke>) -> Self {
        Self {
            script: RefCell::new(script.into_iter().collect()),
        }
    }

    pub fn respond_once(response: ProviderResponse) -> Self {
        Self::new(vec![ScriptedInvoke::Respond(response)])
    }

    pub fn fail_once(message: &str) -> Self {
        Self::new(vec![ScriptedInvoke::Error(message.to_string())])
    }
}

impl Provider for ScriptedProvider {
    fn invoke(&self, request: &ProviderRequest) -> Result<()> {
        let step = self
            .script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted provider exhausted"))?;
        match step {
            ScriptedInvoke::Respond(response) => {
                let mut buf = serde_json::to_string_pretty(&response)?;
                buf.push('\n');
                fs::write(&request.response_path, buf)?;
                Ok(())
            }
            ScriptedInvoke::Error(message) => Err(anyhow!(message)),
            ScriptedInvoke::NoResponseFile => Ok(()),
        }
    }
}

/// Action-runner fake that records what it was asked to run.
pub struct ScriptedActionRunner {
    outcomes: RefCell<VecDeque<ActionOutcome>>,
    default_outcome: ActionOutcome,
    ran: RefCell<Vec<Action>>,
}

impl ScriptedActionRunner {
    /// Every action succeeds.
    pub fn succeed_all() -> Self {
        Self {
            outcomes: RefCell::new(VecDeque::new()),
            default_outcome: ActionOutcome::Succeeded,
            ran: RefCell::new(Vec::new()),
        }
    }

    /// Queue explicit outcomes; once drained, further actions succeed.
    pub fn with_outcomes(outcomes: Vec<ActionOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into_iter().collect()),
            default_outcome: ActionOutcome::Succeeded,
            ran: RefCell::new(Vec::new()),
        }
    }

    /// Actions executed so far, in order.
    pub fn ran(&self) -> Vec<Action> {
        self.ran.borrow().clone()
    }
}

impl ActionRunner for ScriptedActionRunner {
    fn run(&self, action: &Action, _ctx: &ActionContext) -> Result<ActionOutcome> {
        self.ran.borrow_mut().push(action.clone());
        Ok(self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or(self.default_outcome))
    }
}
