//! Scripted fakes for the engine's process, tracker, notification and
//! guardrail boundaries.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::core::redact::Redactor;
use crate::core::transitions::{TransitionList, TransitionOption};
use crate::core::types::{IssueType, Ticket};
use crate::io::agent::AgentCommand;
use crate::io::guards::{GuardOutcome, GuardRequest, GuardRunner};
use crate::io::notify::Notifier;
use crate::io::paths::EnginePaths;
use crate::io::run_log::RunLogger;
use crate::io::stream::{AgentProcess, ExitInfo, ReadEvent, Spawner};
use crate::io::tracker::{CommentResult, NewChild, Tracker, TrackerError};

/// Run id used by fixtures.
pub const TEST_RUN_ID: &str = "20260101-000000Z";

/// Create a deterministic ticket.
pub fn ticket(key: &str, issue_type: &str, description: &str) -> Ticket {
    Ticket {
        key: key.to_string(),
        issue_type: IssueType::parse(issue_type),
        status: "In Progress".to_string(),
        summary: format!("{key} summary"),
        description: description.to_string(),
        parent_key: None,
    }
}

/// A repository root in a temp directory.
pub struct TestRepo {
    _temp: tempfile::TempDir,
    paths: EnginePaths,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp repo")?;
        let paths = EnginePaths::new(temp.path());
        fs::create_dir_all(&paths.state_dir)?;
        fs::create_dir_all(&paths.reports_dir)?;
        Ok(Self { _temp: temp, paths })
    }

    pub fn path(&self) -> &Path {
        &self.paths.root
    }

    pub fn paths(&self) -> &EnginePaths {
        &self.paths
    }

    /// Run logger that does not echo to stdout.
    pub fn logger(&self, redactor: Redactor) -> Result<RunLogger> {
        RunLogger::open(
            &self.paths.logs_dir,
            TEST_RUN_ID,
            Duration::from_secs(2 * 24 * 60 * 60),
            redactor,
            false,
        )
    }

    /// Write `reports/{name}`.
    pub fn write_report(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.paths.reports_dir.join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read_log(&self) -> Result<String> {
        let path = self.paths.run_log(TEST_RUN_ID);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}

/// A verification report whose checklist is fully checked.
pub fn passing_report(key: &str) -> String {
    format!(
        "# {key} Verification\n\n## Summary\nDone.\n\n## Checklist\n- [x] implemented\n- [x] tested\n\n## Evidence\nci green\n\n## Manual Testing\nn/a\n"
    )
}

/// Whether `pid` is a live, non-zombie process.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => false,
        Ok(stat) => stat
            .rsplit_once(") ")
            .is_some_and(|(_, rest)| !rest.starts_with('Z')),
    }
}

/// Panic unless `pid` is gone within `within`.
#[cfg(target_os = "linux")]
pub fn wait_until_gone(pid: u32, within: Duration) {
    let deadline = std::time::Instant::now() + within;
    while process_alive(pid) {
        assert!(std::time::Instant::now() < deadline, "process {pid} still running");
        thread::sleep(Duration::from_millis(20));
    }
}

#[derive(Debug, Clone)]
enum ScriptedEnd {
    Exit(i32),
    /// Never exits on its own; only `terminate` ends it.
    Hang,
    SpawnError(String),
}

/// What one scripted agent attempt prints and how it ends.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    lines: Vec<String>,
    end: ScriptedEnd,
    writes: Vec<(PathBuf, String)>,
    pace: Duration,
}

impl ScriptedRun {
    pub fn exit(code: i32, lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            end: ScriptedEnd::Exit(code),
            writes: Vec::new(),
            pace: Duration::ZERO,
        }
    }

    pub fn hang(lines: &[&str]) -> Self {
        Self {
            end: ScriptedEnd::Hang,
            ..Self::exit(0, lines)
        }
    }

    pub fn spawn_error(message: &str) -> Self {
        Self {
            lines: Vec::new(),
            end: ScriptedEnd::SpawnError(message.to_string()),
            writes: Vec::new(),
            pace: Duration::ZERO,
        }
    }

    /// Wait `pace` before each line, like an agent that keeps talking.
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Write a file when the attempt starts, as the agent would.
    pub fn writing(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.writes.push((path.into(), contents.into()));
        self
    }
}

/// Spawner replaying [`ScriptedRun`]s in order.
#[derive(Debug, Default)]
pub struct ScriptedSpawner {
    runs: RefCell<VecDeque<ScriptedRun>>,
    commands: RefCell<Vec<AgentCommand>>,
    terminated: Rc<Cell<usize>>,
}

impl ScriptedSpawner {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            ..Self::default()
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.commands.borrow().len()
    }

    pub fn terminate_count(&self) -> usize {
        self.terminated.get()
    }

    pub fn commands(&self) -> Vec<AgentCommand> {
        self.commands.borrow().clone()
    }
}

impl Spawner for ScriptedSpawner {
    fn spawn(
        &self,
        command: &AgentCommand,
        _max_line_bytes: usize,
    ) -> Result<Box<dyn AgentProcess>> {
        self.commands.borrow_mut().push(command.clone());
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted run left"))?;
        for (path, contents) in &run.writes {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        let (code, hang) = match run.end {
            ScriptedEnd::SpawnError(message) => bail!(message),
            ScriptedEnd::Exit(code) => (Some(code), false),
            ScriptedEnd::Hang => (None, true),
        };
        Ok(Box::new(ScriptedProcess {
            lines: run.lines.into(),
            code,
            hang,
            pace: run.pace,
            terminated: Rc::clone(&self.terminated),
        }))
    }
}

struct ScriptedProcess {
    lines: VecDeque<String>,
    code: Option<i32>,
    hang: bool,
    pace: Duration,
    terminated: Rc<Cell<usize>>,
}

impl AgentProcess for ScriptedProcess {
    fn read_line(&mut self, wait: Duration) -> ReadEvent {
        if let Some(line) = self.lines.pop_front() {
            thread::sleep(self.pace.min(wait));
            return ReadEvent::Line(line);
        }
        if self.hang {
            thread::sleep(wait);
            return ReadEvent::Idle;
        }
        ReadEvent::Closed
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        if self.hang || !self.lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(ExitInfo {
            code: self.code,
            success: self.code == Some(0),
        }))
    }

    fn terminate(&mut self, _grace: Duration) -> Result<ExitInfo> {
        self.terminated.set(self.terminated.get() + 1);
        self.hang = false;
        self.code = None;
        Ok(ExitInfo {
            code: None,
            success: false,
        })
    }
}

#[derive(Debug, Clone)]
struct MemoryTransition {
    id: String,
    name: String,
    to: String,
}

/// In-memory tracker recording every write.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    tickets: RefCell<Vec<Ticket>>,
    transitions: Vec<MemoryTransition>,
    comments: RefCell<Vec<(String, String)>>,
    applied: RefCell<Vec<(String, String)>>,
    created: RefCell<Vec<NewChild>>,
    create_limit: Cell<Option<usize>>,
}

impl MemoryTracker {
    pub fn new(tickets: Vec<Ticket>) -> Self {
        Self {
            tickets: RefCell::new(tickets),
            ..Self::default()
        }
    }

    /// Offer `(id, name, target status)` transitions for every ticket.
    pub fn with_transitions(mut self, transitions: &[(&str, &str, &str)]) -> Self {
        self.transitions = transitions
            .iter()
            .map(|(id, name, to)| MemoryTransition {
                id: id.to_string(),
                name: name.to_string(),
                to: to.to_string(),
            })
            .collect();
        self
    }

    /// Fail every `create_child` call after `n` successful ones.
    pub fn fail_creates_after(&self, n: usize) {
        self.create_limit.set(Some(n));
    }

    pub fn allow_creates(&self) {
        self.create_limit.set(None);
    }

    pub fn comments(&self) -> Vec<(String, String)> {
        self.comments.borrow().clone()
    }

    /// `(key, transition name)` pairs in the order they were applied.
    pub fn applied_transitions(&self) -> Vec<(String, String)> {
        self.applied.borrow().clone()
    }

    pub fn created(&self) -> Vec<NewChild> {
        self.created.borrow().clone()
    }

    pub fn status_of(&self, key: &str) -> Option<String> {
        self.tickets
            .borrow()
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.status.clone())
    }
}

impl Tracker for MemoryTracker {
    fn fetch_ticket(&self, key: &str) -> Result<Ticket> {
        self.tickets
            .borrow()
            .iter()
            .find(|t| t.key == key)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(key.to_string()).into())
    }

    fn list_in_progress(&self) -> Result<Vec<Ticket>> {
        Ok(self
            .tickets
            .borrow()
            .iter()
            .filter(|t| t.status.eq_ignore_ascii_case("In Progress"))
            .cloned()
            .collect())
    }

    fn post_comment(&self, key: &str, body: &str) -> Result<CommentResult> {
        self.fetch_ticket(key)?;
        let mut comments = self.comments.borrow_mut();
        comments.push((key.to_string(), body.to_string()));
        Ok(CommentResult {
            id: comments.len().to_string(),
        })
    }

    fn list_transitions(&self, key: &str) -> Result<TransitionList> {
        self.fetch_ticket(key)?;
        Ok(self
            .transitions
            .iter()
            .map(|t| TransitionOption {
                id: t.id.clone(),
                name: t.name.clone(),
            })
            .collect())
    }

    fn transition(&self, key: &str, transition_id: &str) -> Result<()> {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.id == transition_id)
            .ok_or_else(|| TrackerError::UnknownTransition {
                key: key.to_string(),
                transition: transition_id.to_string(),
            })?;
        let mut tickets = self.tickets.borrow_mut();
        let ticket = tickets
            .iter_mut()
            .find(|t| t.key == key)
            .ok_or_else(|| TrackerError::NotFound(key.to_string()))?;
        ticket.status = transition.to.clone();
        self.applied
            .borrow_mut()
            .push((key.to_string(), transition.name.clone()));
        Ok(())
    }

    fn create_child(&self, child: &NewChild) -> Result<String> {
        if let Some(limit) = self.create_limit.get()
            && self.created.borrow().len() >= limit
        {
            bail!("tracker unavailable");
        }
        self.fetch_ticket(&child.parent_key)?;
        let project = child
            .parent_key
            .rsplit_once('-')
            .map_or(child.parent_key.as_str(), |(project, _)| project);
        let mut tickets = self.tickets.borrow_mut();
        let key = format!("{project}-{}", 100 + tickets.len());
        tickets.push(Ticket {
            key: key.clone(),
            issue_type: child.issue_type.clone(),
            status: "To Do".to_string(),
            summary: child.summary.clone(),
            description: child.description.clone(),
            parent_key: Some(child.parent_key.clone()),
        });
        self.created.borrow_mut().push(child.clone());
        Ok(key)
    }
}

/// Notifier that records deliveries and can be switched to fail.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: RefCell<Vec<(String, String)>>,
    failing: Cell<bool>,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.failing.set(true);
        notifier
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    /// `(subject, body)` pairs delivered so far.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.borrow().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, subject: &str, body: &str) -> Result<()> {
        if self.failing.get() {
            bail!("transport down");
        }
        self.sent
            .borrow_mut()
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// Guard runner replaying outcomes in order and writing a stub log.
#[derive(Debug, Default)]
pub struct ScriptedGuardRunner {
    outcomes: RefCell<VecDeque<GuardOutcome>>,
    runs: Cell<usize>,
}

impl ScriptedGuardRunner {
    pub fn new(outcomes: Vec<GuardOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            runs: Cell::new(0),
        }
    }

    pub fn run_count(&self) -> usize {
        self.runs.get()
    }
}

impl GuardRunner for ScriptedGuardRunner {
    fn run(&self, request: &GuardRequest) -> Result<GuardOutcome> {
        self.runs.set(self.runs.get() + 1);
        let outcome = self
            .outcomes
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted guard outcome left"))?;
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.log_path, format!("scripted guard: {outcome:?}\n"))?;
        Ok(outcome)
    }
}
