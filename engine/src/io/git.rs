//! Git adapter for guardrail bookkeeping.
//!
//! The engine never commits; it only records the base revision and the files
//! an implementation run touched, so the guardrails ledger can say what the
//! verdict applies to.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// One `git status --porcelain=v1` line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StatusEntry {
    /// XY code, "??" for untracked.
    code: String,
    path: String,
}

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Full SHA of HEAD.
    #[instrument(skip_all)]
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        let sha = out.trim().to_string();
        debug!(sha = %sha, "head sha");
        Ok(sha)
    }

    /// Paths with uncommitted changes, untracked files included.
    pub fn dirty_paths(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_status_line(line).map(|entry| entry.path))
            .collect()
    }

    /// Files committed since `base` plus anything dirty in the worktree,
    /// sorted and deduplicated.
    #[instrument(skip_all, fields(base))]
    pub fn changed_files_since(&self, base: &str) -> Result<Vec<String>> {
        let mut files = BTreeSet::new();
        if !base.is_empty() {
            let range = format!("{base}..HEAD");
            let out = self.run_capture(&["diff", "--name-only", &range])?;
            files.extend(
                out.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        }
        files.extend(self.dirty_paths()?);
        Ok(files.into_iter().collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
