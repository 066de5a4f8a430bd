//! Side-effecting modules: filesystem layout, persistence, processes,
//! provider and action execution.

pub mod actions;
pub mod config;
pub mod events;
pub mod init;
pub mod ledger_store;
pub mod paths;
pub mod process;
pub mod provider;
pub mod run_state;
pub mod session_record;
