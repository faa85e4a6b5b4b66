//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod checklist;
pub mod classifier;
pub mod dispatch;
pub mod fingerprint;
pub mod redact;
pub mod state;
pub mod timeout;
pub mod transitions;
pub mod types;
