//! Short-lived helper commands: the guardrails suite and notify hooks.
//!
//! The long-running agent goes through [`crate::io::stream`] instead; helpers
//! are run to completion with a hard deadline and capped capture.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::stream::kill_process_group;

/// A helper invocation from a configured argv array.
#[derive(Debug, Clone)]
pub struct HelperCommand {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub timeout: Duration,
    /// Per-stream capture cap; the rest is drained and counted.
    pub capture_limit: usize,
}

impl HelperCommand {
    pub fn new(argv: &[String], workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            argv: argv.to_vec(),
            workdir: workdir.into(),
            env: Vec::new(),
            stdin: None,
            timeout,
            capture_limit: 64 * 1024,
        }
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.env.push((name.to_string(), value.to_string()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn capture_limit(mut self, bytes: usize) -> Self {
        self.capture_limit = bytes;
        self
    }

    /// `program arg...` for messages.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }

    fn command(&self) -> Result<Command> {
        let Some((program, args)) = self.argv.split_first() else {
            bail!("helper command is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in &self.env {
            cmd.env(name, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        Ok(cmd)
    }
}

/// Capped capture of one output stream.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    fn read_from(mut reader: impl Read, limit: usize) -> Result<Self> {
        let mut captured = Self::default();
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).context("read helper output")?;
            if n == 0 {
                return Ok(captured);
            }
            let keep = n.min(limit.saturating_sub(captured.bytes.len()));
            captured.bytes.extend_from_slice(&chunk[..keep]);
            captured.dropped += n - keep;
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug)]
pub struct HelperOutput {
    /// `None` when killed by a signal or the deadline.
    pub exit_code: Option<i32>,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl HelperOutput {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Log-ready text: both streams, drop counts and how the helper ended.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for (label, stream) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            out.push_str(&format!("--- {label} ---\n"));
            out.push_str(&stream.text());
            if !out.ends_with('\n') {
                out.push('\n');
            }
            if stream.dropped > 0 {
                out.push_str(&format!("[{} {label} bytes dropped]\n", stream.dropped));
            }
        }
        match (self.timed_out, self.exit_code) {
            (true, _) => out.push_str("--- timed out ---\n"),
            (false, Some(code)) => out.push_str(&format!("--- exit {code} ---\n")),
            (false, None) => out.push_str("--- killed by signal ---\n"),
        }
        out
    }
}

/// Run `helper` to completion or until its deadline, killing its process
/// group on timeout.
#[instrument(skip_all, fields(command = %helper.display(), timeout_secs = helper.timeout.as_secs()))]
pub fn run_helper(helper: &HelperCommand) -> Result<HelperOutput> {
    let mut child = helper
        .command()?
        .spawn()
        .with_context(|| format!("spawn `{}`", helper.display()))?;

    if let Some(input) = &helper.stdin {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("helper stdin was not piped"))?;
        // Helpers may exit without reading stdin.
        if let Err(err) = stdin.write_all(input.as_bytes()) {
            debug!(err = %err, "helper closed stdin early");
        }
    }

    let (stdout, stderr) = spawn_readers(&mut child, helper.capture_limit)?;
    let (exit_code, timed_out) = match child.wait_timeout(helper.timeout).context("wait for helper")? {
        Some(status) => (status.code(), false),
        None => {
            warn!("helper exceeded its deadline; killing process group");
            kill_process_group(child.id());
            let _ = child.kill();
            child.wait().context("reap helper")?;
            (None, true)
        }
    };

    let output = HelperOutput {
        exit_code,
        stdout: join_reader(stdout)?,
        stderr: join_reader(stderr)?,
        timed_out,
    };
    debug!(exit_code = ?output.exit_code, timed_out, "helper finished");
    Ok(output)
}

type Reader = JoinHandle<Result<Captured>>;

fn spawn_readers(child: &mut Child, limit: usize) -> Result<(Reader, Reader)> {
    let stdout: ChildStdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("helper stdout was not piped"))?;
    let stderr: ChildStderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("helper stderr was not piped"))?;
    Ok((
        thread::spawn(move || Captured::read_from(stdout, limit)),
        thread::spawn(move || Captured::read_from(stderr, limit)),
    ))
}

fn join_reader(handle: Reader) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("helper output reader panicked"))?
}
