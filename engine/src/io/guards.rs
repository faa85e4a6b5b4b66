//! Guardrail command runner (default `just ci`).

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::redact::Redactor;
use crate::io::config::GuardrailsConfig;
use crate::io::process::{HelperCommand, run_helper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    Pass,
    Fail,
}

impl GuardOutcome {
    pub fn passed(self) -> bool {
        self == Self::Pass
    }
}

#[derive(Debug, Clone)]
pub struct GuardRequest {
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl GuardRequest {
    pub fn from_config(cfg: &GuardrailsConfig, workdir: PathBuf, log_path: PathBuf) -> Self {
        Self {
            workdir,
            log_path,
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

pub trait GuardRunner {
    fn run(&self, request: &GuardRequest) -> Result<GuardOutcome>;
}

/// Runs the configured command and writes its redacted output to the log.
#[derive(Debug, Clone)]
pub struct CommandGuardRunner {
    command: Vec<String>,
    redactor: Redactor,
}

impl CommandGuardRunner {
    pub fn new(command: Vec<String>, redactor: Redactor) -> Self {
        Self { command, redactor }
    }
}

impl GuardRunner for CommandGuardRunner {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &GuardRequest) -> Result<GuardOutcome> {
        let helper = HelperCommand::new(&self.command, &request.workdir, request.timeout)
            .capture_limit(request.output_limit_bytes);
        let output = run_helper(&helper)
            .with_context(|| format!("run guardrails `{}`", helper.display()))?;

        write_guard_log(request, &self.redactor.redact(&output.transcript()))?;

        let outcome = if output.passed() {
            GuardOutcome::Pass
        } else {
            GuardOutcome::Fail
        };
        info!(?outcome, exit_code = ?output.exit_code, timed_out = output.timed_out, "guardrails finished");
        Ok(outcome)
    }
}

fn write_guard_log(request: &GuardRequest, text: &str) -> Result<()> {
    let path = &request.log_path;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create guard log dir {}", parent.display()))?;
    }
    fs::write(path, text).with_context(|| format!("write guard log {}", path.display()))
}
