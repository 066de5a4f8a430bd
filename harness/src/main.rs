//! CLI for the agent execution harness.
//!
//! Thin glue: argument parsing, wiring the real provider and action runner,
//! JSON output and stable exit codes. All behavior lives in the library.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;

use harness::exit_codes;
use harness::io::actions::ProcessActionRunner;
use harness::io::config::load_config;
use harness::io::init::{InitOptions, init_harness};
use harness::io::ledger_store::rebaseline_sub_task;
use harness::io::paths::{HarnessPaths, require_initialized};
use harness::io::provider::CodexProvider;
use harness::orchestrate::{self, RunOutcome, RunStop};
use harness::review::{self, Severity};

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "Policy-gated execution harness for autonomous coding agents"
)]
struct Cli {
    /// Repository root to operate on.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the `.harness/` layout with default config and ledger.
    Init {
        /// Overwrite an existing layout.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run for a task and drive it until it stops.
    Run {
        /// Task text handed to the provider each session.
        #[arg(long)]
        task: String,
    },
    /// Continue a run from its last committed state.
    Resume {
        /// Run to resume; defaults to the most recent.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Print a JSON status summary for a run.
    Status {
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Request operator intervention at the next session boundary.
    Intervene {
        #[arg(long)]
        run_id: Option<String>,
        /// Why the run needs attention.
        #[arg(long)]
        note: String,
    },
    /// Branch a run at a checkpoint session into a new run.
    Fork {
        #[arg(long)]
        run_id: String,
        /// Last session the fork inherits.
        #[arg(long)]
        at_session: u32,
    },
    /// Run the eval gate for a run and print the report.
    Eval {
        #[arg(long)]
        run_id: Option<String>,
        /// Eval profile; defaults to the configured one.
        #[arg(long)]
        profile: Option<String>,
    },
    /// Produce structured review findings for a run.
    Review {
        #[arg(long)]
        run_id: Option<String>,
        /// Minimum severity to keep: info, warning or blocker.
        #[arg(long, default_value = "info")]
        min_severity: String,
    },
    /// Replace a sub-task's pass criteria through the audited rebaseline
    /// path, resetting its status.
    Rebaseline {
        #[arg(long)]
        sub_task_id: String,
        /// New pass criterion; repeat for several.
        #[arg(long = "criterion", required = true)]
        criteria: Vec<String>,
        /// Audit note recorded in rebaseline_notes.md.
        #[arg(long)]
        note: String,
    },
}

fn main() -> ExitCode {
    harness::logging::init();
    match run() {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::INVALID as u8)
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => {
            let paths = HarnessPaths::new(&cli.root);
            init_harness(&paths, &InitOptions { force })?;
            println!("initialized {}", paths.harness_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run { task } => {
            let paths = require_initialized(&cli.root)?;
            let outcome = orchestrate::run_task(
                &paths,
                &task,
                &CodexProvider,
                "codex",
                &ProcessActionRunner,
            )?;
            emit_run_outcome(&outcome)
        }
        Command::Resume { run_id } => {
            let paths = require_initialized(&cli.root)?;
            let outcome = orchestrate::resume(
                &paths,
                run_id.as_deref(),
                &CodexProvider,
                "codex",
                &ProcessActionRunner,
            )?;
            emit_run_outcome(&outcome)
        }
        Command::Status { run_id } => {
            let paths = require_initialized(&cli.root)?;
            let report = orchestrate::status_report(&paths, run_id.as_deref())?;
            emit(&report)?;
            Ok(exit_codes::OK)
        }
        Command::Intervene { run_id, note } => {
            let paths = require_initialized(&cli.root)?;
            let run_id = orchestrate::intervene(&paths, run_id.as_deref(), &note)?;
            println!("intervention requested for {run_id}");
            Ok(exit_codes::OK)
        }
        Command::Fork { run_id, at_session } => {
            let paths = require_initialized(&cli.root)?;
            let fork_id = orchestrate::fork(&paths, &run_id, at_session)?;
            println!("{fork_id}");
            Ok(exit_codes::OK)
        }
        Command::Eval { run_id, profile } => {
            let paths = require_initialized(&cli.root)?;
            let mut cfg = load_config(&paths)?;
            let run_id = match run_id {
                Some(id) => id,
                None => orchestrate::status_report(&paths, None)?.run_id,
            };
            if let Some(profile) = profile {
                cfg.eval_profile = profile;
            }
            let report = orchestrate::run_eval(&paths, &cfg, &run_id)?;
            emit(&report)?;
            if report.passed {
                Ok(exit_codes::OK)
            } else {
                Ok(exit_codes::INCOMPLETE)
            }
        }
        Command::Review {
            run_id,
            min_severity,
        } => {
            let paths = require_initialized(&cli.root)?;
            let run_id = match run_id {
                Some(id) => id,
                None => orchestrate::status_report(&paths, None)?.run_id,
            };
            let severity = parse_severity(&min_severity)?;
            let report = review::run_review(&paths, &run_id, severity)?;
            emit(&report)?;
            Ok(exit_codes::OK)
        }
        Command::Rebaseline {
            sub_task_id,
            criteria,
            note,
        } => {
            let paths = require_initialized(&cli.root)?;
            let version = rebaseline_sub_task(&paths, &sub_task_id, criteria, &note)?;
            println!("rebaselined {sub_task_id} to v{version}");
            Ok(exit_codes::OK)
        }
    }
}

fn emit_run_outcome(outcome: &RunOutcome) -> Result<i32> {
    #[derive(Serialize)]
    struct RunSummary<'a> {
        run_id: &'a str,
        sessions_executed: u32,
        stop: String,
    }
    let stop = match &outcome.stop {
        RunStop::Completed => "completed".to_string(),
        RunStop::Blocked { reason } => format!("blocked: {reason}"),
        RunStop::MaxSessions { max_sessions } => {
            format!("max sessions reached ({max_sessions})")
        }
    };
    emit(&RunSummary {
        run_id: &outcome.run_id,
        sessions_executed: outcome.sessions_executed,
        stop,
    })?;
    Ok(match &outcome.stop {
        RunStop::Completed => exit_codes::OK,
        RunStop::Blocked { .. } => exit_codes::BLOCKED,
        RunStop::MaxSessions { .. } => exit_codes::INCOMPLETE,
    })
}

fn parse_severity(raw: &str) -> Result<Severity> {
    match raw {
        "info" => Ok(Severity::Info),
        "warning" => Ok(Severity::Warning),
        "blocker" => Ok(Severity::Blocker),
        other => anyhow::bail!("unknown severity '{other}' (info, warning or blocker)"),
    }
}

/// Print a value as pretty JSON on stdout.
fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
