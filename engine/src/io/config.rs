//! Engine configuration stored under `.engineo/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::FailurePatterns;
use crate::core::transitions::DONE_PRIORITY;

/// Environment variable overriding the agent timeout (seconds).
pub const TIMEOUT_ENV: &str = "ENGINEO_AGENT_TIMEOUT_SECS";
/// Environment variable listing extra variable names whose values are redacted.
pub const REDACT_ENV: &str = "ENGINEO_REDACT_ENV";

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to the
/// values the engine ships with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub agent: AgentConfig,
    pub failures: FailureConfig,
    pub redaction: RedactionConfig,
    pub verification: VerificationConfig,
    pub guardrails: GuardrailsConfig,
    pub tracker: TrackerConfig,
    pub notify: NotifyConfig,
    pub lock: LockConfig,
    pub logs: LogConfig,
    pub transitions: TransitionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable.
    pub program: String,
    /// Arguments; `{prompt}` is replaced by the rendered prompt, otherwise the
    /// prompt is appended as the last argument.
    pub args: Vec<String>,
    /// Run the agent on a pseudo-terminal. Pipes are used when this is false
    /// or no terminal can be allocated.
    pub use_pty: bool,
    /// Emit a heartbeat after this many silent seconds.
    pub heartbeat_secs: u64,
    /// Upper bound on one wait for output before checking timers.
    pub poll_millis: u64,
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    /// Total attempts for transient failures (first try included).
    pub max_attempts: u32,
    /// Retries allowed after a hard timeout; a timeout beyond this ends the
    /// invocation even when attempts remain.
    pub max_timeout_retries: u32,
    /// Delay before retry N (1-based); the last value repeats.
    pub retry_delays_secs: Vec<u64>,
    /// Seconds between SIGTERM and SIGKILL of the agent's process group.
    pub kill_grace_secs: u64,
    /// Longest line kept intact before it is split.
    pub max_line_bytes: usize,
    /// Output kept in memory for failure classification.
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "{prompt}".to_string(),
            ],
            use_pty: true,
            heartbeat_secs: 30,
            poll_millis: 1_000,
            default_timeout_secs: 4 * 60 * 60,
            max_timeout_secs: 8 * 60 * 60,
            max_attempts: 3,
            max_timeout_retries: 1,
            retry_delays_secs: vec![10, 30],
            kill_grace_secs: 10,
            max_line_bytes: 64 * 1024,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FailureConfig {
    pub transient_patterns: Vec<String>,
    pub fatal_signatures: Vec<String>,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            transient_patterns: [
                "rate limit",
                "rate_limit",
                "429 Too Many Requests",
                "overloaded",
                "concurrency conflict",
                "concurrent modification",
                "ETIMEDOUT",
                "ECONNRESET",
                "socket hang up",
                "request timed out",
                "No messages returned",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            fatal_signatures: [
                "ReferenceError: issueKey is not defined",
                "ReferenceError: ticket is not defined",
                "undefined template variable",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl FailureConfig {
    pub fn patterns(&self) -> FailurePatterns {
        FailurePatterns {
            transient: self.transient_patterns.clone(),
            fatal: self.fatal_signatures.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RedactionConfig {
    /// Environment variable names whose values are redacted.
    pub env_vars: Vec<String>,
    /// Extra regex patterns; the whole match is replaced.
    pub patterns: Vec<String>,
}

impl RedactionConfig {
    /// Configured names merged with a comma-separated env override, deduplicated.
    pub fn env_var_names(&self, env_override: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = self.env_vars.clone();
        if let Some(raw) = env_override {
            names.extend(
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
            );
        }
        names.sort();
        names.dedup();
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    pub cooldown_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardrailsConfig {
    /// Command run after a successful implementation (e.g. `["just","ci"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            command: vec!["just".to_string(), "ci".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Local tracker snapshot, relative to the repository root.
    pub path: String,
    /// Statuses considered "in progress" in auto mode.
    pub in_progress_statuses: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            path: ".engineo/tracker.json".to_string(),
            in_progress_statuses: vec!["In Progress".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Command receiving `subject` as its last argument and the body on stdin.
    /// Empty means notifications are only written to the run log.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub name: String,
    pub stale_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: "agent-session".to_string(),
            stale_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub retention_days: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { retention_days: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransitionConfig {
    /// Completion transitions, highest priority first.
    pub done_priority: Vec<String>,
    /// Transition used for fatal agent failures.
    pub blocked: String,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            done_priority: DONE_PRIORITY.iter().map(|s| s.to_string()).collect(),
            blocked: "Blocked".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!("agent.program must be non-empty"));
        }
        if self.agent.max_attempts == 0 {
            return Err(anyhow!("agent.max_attempts must be > 0"));
        }
        if self.agent.default_timeout_secs == 0 || self.agent.max_timeout_secs == 0 {
            return Err(anyhow!("agent timeouts must be > 0"));
        }
        if self.agent.heartbeat_secs == 0 || self.agent.poll_millis == 0 {
            return Err(anyhow!("agent.heartbeat_secs and agent.poll_millis must be > 0"));
        }
        if self.agent.max_line_bytes < 4 {
            return Err(anyhow!("agent.max_line_bytes must be >= 4"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.guardrails.command.is_empty() || self.guardrails.command[0].trim().is_empty() {
            return Err(anyhow!("guardrails.command must be a non-empty array"));
        }
        if self.guardrails.timeout_secs == 0 {
            return Err(anyhow!("guardrails.timeout_secs must be > 0"));
        }
        if self.lock.name.trim().is_empty() || self.lock.name.contains('/') {
            return Err(anyhow!("lock.name must be a plain file name"));
        }
        if self.transitions.done_priority.is_empty() {
            return Err(anyhow!("transitions.done_priority must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::ledger::write_atomic(path, &buf)
}
