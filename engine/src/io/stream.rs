//! Streaming agent processes.
//!
//! The agent runs either on a pseudo-terminal (so tools that buffer when
//! piped still emit line by line) or on plain pipes. A reader thread turns the
//! byte stream into cleaned lines and hands them over a channel; the control
//! loop in `orchestrator` only ever waits on that channel with a bounded
//! timeout, so heartbeats and deadlines are checked while the agent is silent.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use portable_pty::{CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};
use regex::Regex;
use tracing::{debug, warn};

use crate::io::agent::AgentCommand;

const READ_CHUNK_SIZE: usize = 8 * 1024;
const PTY_COLS: u16 = 200;
const PTY_ROWS: u16 = 50;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ansi regex should compile")
});

/// Result of one bounded wait for output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Line(String),
    /// Nothing arrived within the wait.
    Idle,
    /// The output stream is finished.
    Closed,
}

/// How the agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

impl ExitInfo {
    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// A running agent.
pub trait AgentProcess {
    /// Wait at most `wait` for the next output line.
    fn read_line(&mut self, wait: Duration) -> ReadEvent;
    /// Non-blocking exit check.
    fn try_wait(&mut self) -> Result<Option<ExitInfo>>;
    /// SIGTERM the process group, SIGKILL after `grace`, reap.
    fn terminate(&mut self, grace: Duration) -> Result<ExitInfo>;
}

/// Starts agent processes.
pub trait Spawner {
    fn spawn(&self, command: &AgentCommand, max_line_bytes: usize)
    -> Result<Box<dyn AgentProcess>>;
}

/// Splits a byte stream into display lines.
///
/// Carriage returns and ANSI escape sequences are removed. A line that grows
/// past `max_line_bytes` without a newline is emitted in pieces, cut on a
/// UTF-8 character boundary.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line_bytes: usize,
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_bytes: max_line_bytes.max(4),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.pending);
                lines.push(clean_line(&line));
                continue;
            }
            self.pending.push(byte);
            if self.pending.len() >= self.max_line_bytes {
                let cut = utf8_cut(&self.pending);
                let rest = self.pending.split_off(cut);
                let line = std::mem::replace(&mut self.pending, rest);
                lines.push(clean_line(&line));
            }
        }
        lines
    }

    /// Flush an unterminated final line.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        let cleaned = clean_line(&line);
        (!cleaned.is_empty()).then_some(cleaned)
    }
}

/// Largest prefix length of `buf` that ends on a complete UTF-8 character.
fn utf8_cut(buf: &[u8]) -> usize {
    let len = buf.len();
    let mut start = len;
    // Walk back over at most three continuation bytes to the last lead byte.
    while start > 0 && len - start < 4 {
        start -= 1;
        if buf[start] & 0b1100_0000 != 0b1000_0000 {
            break;
        }
    }
    let lead = buf[start];
    let width = match lead {
        b if b & 0b1000_0000 == 0 => 1,
        b if b & 0b1110_0000 == 0b1100_0000 => 2,
        b if b & 0b1111_0000 == 0b1110_0000 => 3,
        b if b & 0b1111_1000 == 0b1111_0000 => 4,
        _ => 1,
    };
    if start + width > len && start > 0 {
        start
    } else {
        len
    }
}

fn clean_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.replace('\r', "");
    ANSI_RE.replace_all(&text, "").into_owned()
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R, tx: Sender<String>, max_line_bytes: usize) {
    thread::spawn(move || {
        let mut buffer = LineBuffer::new(max_line_bytes);
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                // A PTY master reports EIO once the child side closes.
                Err(err) => {
                    debug!(err = %err, "agent output stream ended");
                    break;
                }
            }
        }
        if let Some(line) = buffer.finish() {
            let _ = tx.send(line);
        }
    });
}

fn recv_line(rx: &Receiver<String>, wait: Duration) -> ReadEvent {
    match rx.recv_timeout(wait) {
        Ok(line) => ReadEvent::Line(line),
        Err(RecvTimeoutError::Timeout) => ReadEvent::Idle,
        Err(RecvTimeoutError::Disconnected) => ReadEvent::Closed,
    }
}

/// Send `signal` to the process group led by `pid`. Returns false when the
/// group no longer exists.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::killpg(nix::unistd::Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(err) => {
            warn!(pid, err = %err, ?signal, "failed to signal process group");
            false
        }
    }
}

/// SIGKILL a whole process group.
pub fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// TERM the group led by `pid`, poll for `grace`, then KILL the group.
/// Returns the exit if the process stopped on its own within the grace.
fn stop_group(
    pid: Option<u32>,
    grace: Duration,
    mut try_wait: impl FnMut() -> Result<Option<ExitInfo>>,
) -> Result<Option<ExitInfo>> {
    let Some(pid) = pid else {
        return Ok(None);
    };
    #[cfg(unix)]
    {
        debug!(pid, "sending SIGTERM to agent process group");
        signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(exit) = try_wait()? {
                return Ok(Some(exit));
            }
            thread::sleep(Duration::from_millis(100));
        }
        warn!(pid, grace_secs = grace.as_secs(), "agent ignored SIGTERM, killing");
    }
    #[cfg(not(unix))]
    {
        let _ = (grace, &mut try_wait);
    }
    kill_process_group(pid);
    Ok(None)
}

/// Runs the agent attached to a pseudo-terminal, or on pipes when no
/// terminal can be allocated.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl PtySpawner {
    fn spawn_on(
        &self,
        pair: Result<PtyPair>,
        command: &AgentCommand,
        max_line_bytes: usize,
    ) -> Result<Box<dyn AgentProcess>> {
        let pair = match pair {
            Ok(pair) => pair,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "pty unavailable, running agent on pipes");
                return PipeSpawner.spawn(command, max_line_bytes);
            }
        };

        let mut builder = CommandBuilder::new(&command.program);
        builder.args(&command.args);
        builder.cwd(&command.workdir);
        for (key, value) in &command.env {
            builder.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .with_context(|| format!("spawn {} on pty", command.program))?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().context("clone pty reader")?;
        let (tx, rx) = mpsc::channel();
        spawn_reader(reader, tx, max_line_bytes);
        debug!(pid = ?child.process_id(), "agent spawned on pty");

        Ok(Box::new(PtyProcess {
            child,
            _master: pair.master,
            rx,
        }))
    }
}

struct PtyProcess {
    child: Box<dyn portable_pty::Child + Send + Sync>,
    // Dropping the master closes the terminal; keep it for the child's lifetime.
    _master: Box<dyn MasterPty + Send>,
    rx: Receiver<String>,
}

impl Spawner for PtySpawner {
    fn spawn(
        &self,
        command: &AgentCommand,
        max_line_bytes: usize,
    ) -> Result<Box<dyn AgentProcess>> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("open pty");
        self.spawn_on(pair, command, max_line_bytes)
    }
}

fn pty_exit(status: portable_pty::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: i32::try_from(status.exit_code()).ok(),
        success: status.success(),
    }
}

impl AgentProcess for PtyProcess {
    fn read_line(&mut self, wait: Duration) -> ReadEvent {
        recv_line(&self.rx, wait)
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        Ok(self.child.try_wait().context("poll pty child")?.map(pty_exit))
    }

    fn terminate(&mut self, grace: Duration) -> Result<ExitInfo> {
        // The pty child is a session leader, so its pid is also its group id.
        let pid = self.child.process_id();
        if let Some(exit) = stop_group(pid, grace, || self.try_wait())? {
            return Ok(exit);
        }
        let _ = self.child.kill();
        Ok(pty_exit(self.child.wait().context("reap pty child")?))
    }
}

/// Runs the agent on plain pipes with stdout and stderr merged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeSpawner;

struct PipeProcess {
    child: std::process::Child,
    rx: Receiver<String>,
}

impl Spawner for PipeSpawner {
    fn spawn(
        &self,
        command: &AgentCommand,
        max_line_bytes: usize,
    ) -> Result<Box<dyn AgentProcess>> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.workdir)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", command.program))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, rx) = mpsc::channel();
        spawn_reader(stdout, tx.clone(), max_line_bytes);
        spawn_reader(stderr, tx, max_line_bytes);
        debug!(pid = child.id(), "agent spawned on pipes");

        Ok(Box::new(PipeProcess { child, rx }))
    }
}

fn std_exit(status: std::process::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        success: status.success(),
    }
}

impl AgentProcess for PipeProcess {
    fn read_line(&mut self, wait: Duration) -> ReadEvent {
        recv_line(&self.rx, wait)
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        Ok(self.child.try_wait().context("poll child")?.map(std_exit))
    }

    fn terminate(&mut self, grace: Duration) -> Result<ExitInfo> {
        let pid = self.child.id();
        if let Some(exit) = stop_group(Some(pid), grace, || self.try_wait())? {
            return Ok(exit);
        }
        let _ = self.child.kill();
        Ok(std_exit(self.child.wait().context("reap child")?))
    }
}
