//! Agent invocation with live streaming, heartbeats, hard timeouts and
//! classified retries.
//!
//! One invocation runs up to `max_attempts` attempts. Each attempt streams the
//! agent's output line by line: every line is redacted, appended to the
//! attempt artifact and logged. The control loop never blocks for longer than
//! the poll interval, so silence produces heartbeats and an expired deadline
//! terminates the agent's whole process group.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, instrument, warn};

use crate::core::classifier::{FailurePatterns, classify_failure};
use crate::core::fingerprint::failure_fingerprint;
use crate::core::timeout::{AttemptClock, TimeoutInputs, TimeoutSource, resolve_timeout};
use crate::core::types::{FailureClass, StepResult, Ticket};
use crate::io::agent::AgentCommand;
use crate::io::config::AgentConfig;
use crate::io::lock::LockKeeper;
use crate::io::paths::EnginePaths;
use crate::io::run_log::{RunLogger, roles};
use crate::io::stream::{AgentProcess, ExitInfo, ReadEvent, Spawner};

/// Environment passed to the agent so its own tooling can find the ticket.
pub const ISSUE_KEY_ENV: &str = "ENGINEO_ISSUE_KEY";
pub const RUN_ID_ENV: &str = "ENGINEO_RUN_ID";

const DRAIN_WAIT: Duration = Duration::from_millis(100);
const FAILURE_TAIL_LINES: usize = 40;

/// What the agent is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Implement,
    Plan,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implement => "implement",
            Self::Plan => "plan",
        }
    }
}

/// Timeout overrides that apply to the whole run.
#[derive(Debug, Clone, Default)]
pub struct TimeoutPolicy {
    pub flag_secs: Option<u64>,
    pub env_value: Option<String>,
}

/// Renders the prompt for an attempt given the previous attempt's output tail.
pub type PromptFn<'p> = dyn Fn(u32, Option<&str>) -> Result<String> + 'p;

pub struct InvocationRequest<'r> {
    pub ticket: &'r Ticket,
    pub phase: Phase,
    pub prompt: &'r PromptFn<'r>,
}

/// One finished attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub artifact: PathBuf,
    /// `None` when the agent could not be spawned.
    pub exit: Option<ExitInfo>,
    pub timed_out: bool,
    /// `None` on success.
    pub class: Option<FailureClass>,
    /// Redacted output kept for classification and retry prompts.
    pub output: String,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.class.is_none()
    }

    fn tail(&self) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
        lines[start..].join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub attempts: Vec<AttemptRecord>,
    pub timeout: Duration,
    pub timeout_source: TimeoutSource,
}

impl InvocationOutcome {
    pub fn last(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    pub fn succeeded(&self) -> bool {
        self.last().is_some_and(AttemptRecord::succeeded)
    }

    pub fn failure_class(&self) -> Option<&FailureClass> {
        self.last().and_then(|a| a.class.as_ref())
    }

    /// Fingerprint of the final failure, for escalation dedup.
    pub fn failure_fingerprint(&self) -> Option<String> {
        let last = self.last()?;
        let class = last.class.as_ref()?;
        Some(failure_fingerprint(class, &last.output))
    }

    pub fn step_result(&self) -> StepResult {
        match self.last() {
            Some(a) if a.succeeded() => StepResult::Success,
            Some(a) if a.timed_out => StepResult::TimedOut,
            _ => StepResult::Failed,
        }
    }

    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.attempts.iter().map(|a| a.artifact.clone()).collect()
    }
}

/// Drives the external agent for one ticket.
pub struct Orchestrator<'a> {
    pub spawner: &'a dyn Spawner,
    pub config: &'a AgentConfig,
    pub patterns: &'a FailurePatterns,
    pub paths: &'a EnginePaths,
    pub logger: &'a RunLogger,
    pub run_id: &'a str,
    pub timeouts: &'a TimeoutPolicy,
    /// Refreshed every heartbeat interval, output or not.
    pub lock: Option<&'a LockKeeper>,
}

impl Orchestrator<'_> {
    /// Effective hard timeout for `ticket`.
    pub fn timeout_for(&self, ticket: &Ticket) -> (Duration, TimeoutSource) {
        resolve_timeout(
            &TimeoutInputs {
                flag_secs: self.timeouts.flag_secs,
                env_value: self.timeouts.env_value.as_deref(),
                description: Some(&ticket.description),
            },
            Duration::from_secs(self.config.default_timeout_secs),
            Duration::from_secs(self.config.max_timeout_secs),
        )
    }

    fn retry_delay(&self, retry: u32) -> Duration {
        let delays = &self.config.retry_delays_secs;
        let idx = usize::try_from(retry.saturating_sub(1)).unwrap_or(usize::MAX);
        let secs = delays
            .get(idx)
            .or_else(|| delays.last())
            .copied()
            .unwrap_or(0);
        Duration::from_secs(secs)
    }

    /// Run attempts until success, a non-retryable failure, or the attempt
    /// budget is spent.
    #[instrument(skip_all, fields(key = %request.ticket.key, phase = request.phase.as_str()))]
    pub fn invoke(&self, request: &InvocationRequest<'_>) -> Result<InvocationOutcome> {
        let key = &request.ticket.key;
        let (timeout, timeout_source) = self.timeout_for(request.ticket);
        self.logger.log(
            roles::ENGINE,
            &format!(
                "invoking agent for {key} ({}), timeout {}s from {:?}",
                request.phase.as_str(),
                timeout.as_secs(),
                timeout_source
            ),
        );

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.retry_delay(attempt - 1);
                self.logger.log(
                    roles::ENGINE,
                    &format!("retrying {key} in {}s (attempt {attempt}/{max_attempts})", delay.as_secs()),
                );
                thread::sleep(delay);
            }

            let previous = attempts.last().map(AttemptRecord::tail);
            let prompt = (request.prompt)(attempt, previous.as_deref())?;
            let record = self.run_attempt(request, attempt, &prompt, timeout)?;

            let verdict = match &record.class {
                None => "success".to_string(),
                Some(class) => class.label().to_string(),
            };
            self.logger.log(
                roles::ENGINE,
                &format!(
                    "attempt {attempt} for {key} finished: {} ({verdict}), artifact {}",
                    describe_exit(&record),
                    self.paths.display_relative(&record.artifact)
                ),
            );

            let mut retry = record.class.as_ref().is_some_and(FailureClass::is_retryable);
            if retry && record.timed_out {
                let earlier_timeouts = attempts.iter().filter(|a| a.timed_out).count();
                let allowed = usize::try_from(self.config.max_timeout_retries).unwrap_or(usize::MAX);
                if earlier_timeouts >= allowed {
                    self.logger.log(
                        roles::ENGINE,
                        &format!("{key} timed out {} time(s); not retrying", earlier_timeouts + 1),
                    );
                    retry = false;
                }
            }
            attempts.push(record);
            if !retry {
                break;
            }
        }

        Ok(InvocationOutcome {
            attempts,
            timeout,
            timeout_source,
        })
    }

    fn run_attempt(
        &self,
        request: &InvocationRequest<'_>,
        attempt: u32,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AttemptRecord> {
        let key = &request.ticket.key;
        let started_at = Utc::now();
        let artifact_path = self.paths.attempt_artifact(key, self.run_id, attempt);
        let mut artifact = open_artifact(&artifact_path)?;

        let command = AgentCommand::build(self.config, prompt, &self.paths.root)
            .with_env(ISSUE_KEY_ENV, key.as_str())
            .with_env(RUN_ID_ENV, self.run_id);
        let header = format!(
            "# agent attempt\nissue: {key}\nrun: {}\nattempt: {attempt}\nphase: {}\nstarted: {}\ncommand: {}\n---\n",
            self.run_id,
            request.phase.as_str(),
            started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.logger.redactor().redact(&command.describe()),
        );
        write_artifact(&mut artifact, &artifact_path, &header)?;

        let mut process = match self.spawner.spawn(&command, self.config.max_line_bytes) {
            Ok(process) => process,
            Err(err) => {
                let message = self
                    .logger
                    .redactor()
                    .redact(&format!("spawn failed: {err:#}"));
                self.logger.log(roles::ENGINE, &format!("{key}: {message}"));
                write_artifact(
                    &mut artifact,
                    &artifact_path,
                    &format!("{message}\n---\nexit: spawn error\nclassification: unclassified\n"),
                )?;
                return Ok(AttemptRecord {
                    attempt,
                    started_at,
                    artifact: artifact_path,
                    exit: None,
                    timed_out: false,
                    class: Some(FailureClass::Unclassified),
                    output: message,
                });
            }
        };

        let mut output = OutputTail::new(self.config.output_limit_bytes);
        let streamed = self.stream(
            process.as_mut(),
            key,
            attempt,
            AttemptClock::start(timeout),
            &mut artifact,
            &artifact_path,
            &mut output,
        )?;

        let output = output.joined();
        let class = if streamed.exit.success && !streamed.timed_out {
            None
        } else {
            Some(classify_failure(&output, streamed.timed_out, self.patterns))
        };
        let footer = format!(
            "---\nexit: {}\ntimed_out: {}\nclassification: {}\n",
            streamed.exit.describe(),
            streamed.timed_out,
            class.as_ref().map_or("success", FailureClass::label),
        );
        write_artifact(&mut artifact, &artifact_path, &footer)?;

        Ok(AttemptRecord {
            attempt,
            started_at,
            artifact: artifact_path,
            exit: Some(streamed.exit),
            timed_out: streamed.timed_out,
            class,
            output,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn stream(
        &self,
        process: &mut dyn AgentProcess,
        key: &str,
        attempt: u32,
        clock: AttemptClock,
        artifact: &mut File,
        artifact_path: &std::path::Path,
        output: &mut OutputTail,
    ) -> Result<Streamed> {
        let poll = Duration::from_millis(self.config.poll_millis.max(1));
        let heartbeat = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let mut last_activity = Instant::now();
        let mut last_refresh = Instant::now();
        let mut closed = false;

        let mut emit = |line: &str, artifact: &mut File| -> Result<()> {
            let clean = self.logger.redactor().redact(line);
            write_artifact(artifact, artifact_path, &format!("{clean}\n"))?;
            self.logger.log(roles::AGENT, &clean);
            output.push(clean);
            Ok(())
        };

        loop {
            let Some(remaining) = clock.remaining() else {
                let timeout_secs = clock.timeout().as_secs();
                warn!(key, timeout_secs, "agent timed out");
                self.logger.log(
                    roles::ENGINE,
                    &format!(
                        "{key} attempt {attempt} timed out after {timeout_secs}s; terminating process group"
                    ),
                );
                let grace = Duration::from_secs(self.config.kill_grace_secs);
                let exit = process.terminate(grace)?;
                drain(process, |line| emit(line, &mut *artifact))?;
                return Ok(Streamed {
                    exit,
                    timed_out: true,
                });
            };

            if last_refresh.elapsed() >= heartbeat {
                if let Some(lock) = self.lock
                    && let Err(err) = lock.refresh()
                {
                    warn!(err = %err, "failed to refresh session lock");
                }
                last_refresh = Instant::now();
            }

            let wait = poll.min(remaining);
            if closed {
                thread::sleep(wait.min(DRAIN_WAIT));
            } else {
                match process.read_line(wait) {
                    ReadEvent::Line(line) => {
                        emit(&line, &mut *artifact)?;
                        last_activity = Instant::now();
                        continue;
                    }
                    ReadEvent::Idle => {}
                    ReadEvent::Closed => {
                        debug!(key, "agent output closed");
                        closed = true;
                    }
                }
            }

            if let Some(exit) = process.try_wait()? {
                drain(process, |line| emit(line, &mut *artifact))?;
                return Ok(Streamed {
                    exit,
                    timed_out: false,
                });
            }

            if last_activity.elapsed() >= heartbeat {
                self.logger.log(
                    roles::HEARTBEAT,
                    &format!(
                        "{key} attempt {attempt}: no output for {}s, agent still running",
                        last_activity.elapsed().as_secs()
                    ),
                );
                last_activity = Instant::now();
            }
        }
    }
}

struct Streamed {
    exit: ExitInfo,
    timed_out: bool,
}

/// Consume lines still buffered after the process ended.
fn drain(
    process: &mut dyn AgentProcess,
    mut emit: impl FnMut(&str) -> Result<()>,
) -> Result<()> {
    while let ReadEvent::Line(line) = process.read_line(DRAIN_WAIT) {
        emit(&line)?;
    }
    Ok(())
}

/// Last `limit` bytes of redacted output, kept as whole lines.
struct OutputTail {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl OutputTail {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit: limit.max(1),
        }
    }

    fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
            }
        }
    }

    fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

fn open_artifact(path: &std::path::Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create reports dir {}", parent.display()))?;
    }
    File::create(path).with_context(|| format!("create attempt artifact {}", path.display()))
}

fn write_artifact(file: &mut File, path: &std::path::Path, text: &str) -> Result<()> {
    file.write_all(text.as_bytes())
        .and_then(|()| file.flush())
        .with_context(|| format!("write attempt artifact {}", path.display()))
}

fn describe_exit(record: &AttemptRecord) -> String {
    match (&record.exit, record.timed_out) {
        (_, true) => "timed out".to_string(),
        (Some(exit), false) => exit.describe(),
        (None, false) => "spawn error".to_string(),
    }
}
