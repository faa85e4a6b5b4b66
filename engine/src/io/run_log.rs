//! Operator-facing run log (`logs/engine-{runId}.log`).
//!
//! Separate from `tracing` diagnostics: this log is always written, is never
//! filtered by `RUST_LOG`, and every line is redacted before it is written.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use crate::core::redact::Redactor;

const RUN_ID_FORMAT: &str = "%Y%m%d-%H%M%SZ";

/// Role tags used in log lines.
pub mod roles {
    pub const ENGINE: &str = "engine";
    pub const AGENT: &str = "agent";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const GUARD: &str = "guard";
    pub const DECOMPOSE: &str = "decompose";
    pub const VERIFY: &str = "verify";
    pub const ESCALATE: &str = "escalate";
}

/// Identity of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSession {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

impl RunSession {
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            run_id: now.format(RUN_ID_FORMAT).to_string(),
            started_at: now,
        }
    }
}

/// Line-oriented log writer mirrored to stdout.
#[derive(Debug)]
pub struct RunLogger {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
    redactor: Redactor,
    echo: bool,
}

impl RunLogger {
    /// Open the log for `run_id`, first deleting `engine-*.log` files older
    /// than `retention`.
    pub fn open(
        logs_dir: &Path,
        run_id: &str,
        retention: Duration,
        redactor: Redactor,
        echo: bool,
    ) -> Result<Self> {
        fs::create_dir_all(logs_dir)
            .with_context(|| format!("create logs dir {}", logs_dir.display()))?;
        let rotated = rotate_logs(logs_dir, retention, SystemTime::now())?;

        let path = logs_dir.join(format!("engine-{run_id}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open run log {}", path.display()))?;
        let logger = Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
            redactor,
            echo,
        };
        logger.log(
            roles::ENGINE,
            &format!(
                "deleted {rotated} log file(s) older than {}h",
                retention.as_secs() / 3600
            ),
        );
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Write `[timestamp] [role] message`, redacted, to the file and stdout.
    pub fn log(&self, role: &str, message: &str) {
        let line = format!(
            "[{}] [{}] {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            role,
            self.redactor.redact(message)
        );
        match self.file.lock() {
            Ok(mut file) => {
                if let Err(err) = writeln!(file, "{line}").and_then(|()| file.flush()) {
                    warn!(path = %self.path.display(), err = %err, "failed to write run log");
                }
            }
            Err(_) => warn!("run log mutex poisoned"),
        }
        if self.echo {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{line}").and_then(|()| stdout.flush());
        }
    }
}

/// Delete `engine-*.log` files in `dir` last modified more than `retention`
/// before `now`. Returns how many were removed.
pub fn rotate_logs(dir: &Path, retention: Duration, now: SystemTime) -> Result<usize> {
    let mut removed = 0;
    let entries =
        fs::read_dir(dir).with_context(|| format!("list logs dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !(name.starts_with("engine-") && name.ends_with(".log")) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age > retention {
            fs::remove_file(entry.path())
                .with_context(|| format!("remove old log {}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}
