//! Stable exit codes for engine CLI commands.

/// Command succeeded; every processed ticket ended without needing attention.
pub const OK: i32 = 0;
/// Invalid config, unreadable state, tracker failure or any other error.
pub const ERROR: i32 = 1;
/// Another engine session holds the session lock.
pub const LOCKED: i32 = 2;
/// The run finished but at least one ticket ended BLOCKED or ESCALATED.
pub const ATTENTION: i32 = 3;
