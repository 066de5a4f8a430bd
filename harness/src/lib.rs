//! Execution harness for autonomous coding-agent runs.
//!
//! Drives a provider-backed agent through repository tasks in discrete
//! sessions: every proposed action passes a policy gate before execution,
//! progress is tracked in a tamper-resistant sub-task ledger, completion is
//! certified by a deterministic eval gate, and every run is crash-resumable
//! from its persisted state. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (policy, security validation,
//!   ledger rules). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem layout, persistence,
//!   provider and action execution). Isolated to enable mocking in tests.
//!
//! Orchestration modules ([`session`], [`orchestrate`], [`evalgate`],
//! [`review`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod evalgate;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrate;
pub mod review;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
