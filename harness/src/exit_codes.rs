//! Stable exit codes for harness CLI commands.

/// Command succeeded; for `run`/`resume`, the run completed.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/state or other errors.
pub const INVALID: i32 = 1;
/// `run`/`resume` stopped before completion (session ceiling, failure).
pub const INCOMPLETE: i32 = 2;
/// `run`/`resume` stopped because the run is blocked or awaiting intervention.
pub const BLOCKED: i32 = 3;
