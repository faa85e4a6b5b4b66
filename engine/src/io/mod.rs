//! Side-effecting adapters: filesystem documents, processes, tracker and
//! notification boundaries.

pub mod agent;
pub mod config;
pub mod escalations;
pub mod evidence;
pub mod git;
pub mod guardrails;
pub mod guards;
pub mod init;
pub mod ledger;
pub mod lock;
pub mod manifest;
pub mod notify;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod stream;
pub mod tracker;
pub mod work_ledger;
