//! Autonomous ticket-execution engine.
//!
//! Drives an external coding agent through a resumable pipeline for tracker
//! tickets: dispatch, one-time decomposition of Epics and Initiatives,
//! streamed agent invocation with classified retries, evidence verification
//! with backoff, then transition or escalation. The architecture enforces a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (dispatch, classification,
//!   fingerprints, checklist parsing, backoff, state transitions).
//! - **[`io`]**: Side-effecting adapters (ledgers, lock, processes, tracker,
//!   notifications). Isolated behind traits so tests can script them.
//!
//! Orchestration modules ([`orchestrator`], [`decompose`], [`verify`],
//! [`escalation`], [`pipeline`], [`run`]) coordinate core logic with I/O to
//! implement CLI commands.

pub mod core;
pub mod decompose;
pub mod escalation;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
