//! Notification transports for escalations.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{instrument, warn};

use crate::io::config::NotifyConfig;
use crate::io::process::{HelperCommand, run_helper};

/// Subject is exported to the command under this variable.
pub const SUBJECT_ENV: &str = "ENGINEO_NOTIFY_SUBJECT";

const NOTIFY_OUTPUT_LIMIT_BYTES: usize = 16 * 1024;

pub trait Notifier {
    fn send(&self, subject: &str, body: &str) -> Result<()>;
}

/// Pipes the body to a configured command (for example a mail script).
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(command: Vec<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            timeout,
        }
    }
}

impl Notifier for CommandNotifier {
    #[instrument(skip_all, fields(program = self.command.first().map(String::as_str)))]
    fn send(&self, subject: &str, body: &str) -> Result<()> {
        let helper = HelperCommand::new(&self.command, &self.workdir, self.timeout)
            .env(SUBJECT_ENV, subject)
            .stdin(body)
            .capture_limit(NOTIFY_OUTPUT_LIMIT_BYTES);
        let output = run_helper(&helper)?;
        if output.timed_out {
            bail!("notify command timed out after {}s", self.timeout.as_secs());
        }
        if !output.passed() {
            bail!(
                "notify command failed ({:?}): {}",
                output.exit_code,
                output.stderr.text().trim()
            );
        }
        Ok(())
    }
}

/// Fallback when no transport is configured: the escalation is only logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, subject: &str, body: &str) -> Result<()> {
        warn!(subject, body, "escalation (no notify command configured)");
        Ok(())
    }
}

/// Transport selected by the `[notify]` config section.
pub fn notifier_from_config(cfg: &NotifyConfig, workdir: impl Into<PathBuf>) -> Box<dyn Notifier> {
    if cfg.command.is_empty() {
        Box::new(LogNotifier)
    } else {
        Box::new(CommandNotifier::new(
            cfg.command.clone(),
            workdir,
            Duration::from_secs(cfg.timeout_secs),
        ))
    }
}
