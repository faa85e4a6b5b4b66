//! Canonical on-disk layout for a repository checkout.

use std::path::{Path, PathBuf};

/// All engine-owned paths for a repository root.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub guardrail_logs_dir: PathBuf,
    pub config_path: PathBuf,
    pub work_ledger_path: PathBuf,
    pub guardrails_ledger_path: PathBuf,
    pub escalations_path: PathBuf,
}

impl EnginePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".engineo");
        Self {
            reports_dir: root.join("reports"),
            logs_dir: root.join("logs"),
            guardrail_logs_dir: state_dir.join("guardrails"),
            config_path: state_dir.join("config.toml"),
            work_ledger_path: root.join("work_ledger.json"),
            guardrails_ledger_path: state_dir.join("state.json"),
            escalations_path: state_dir.join("escalations.json"),
            state_dir,
            root,
        }
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{name}.lock"))
    }

    /// `reports/{KEY}-verification.md`
    pub fn canonical_report(&self, key: &str) -> PathBuf {
        self.reports_dir.join(format!("{key}-verification.md"))
    }

    /// `reports/{EPIC}-decomposition.json`
    pub fn manifest(&self, epic_key: &str) -> PathBuf {
        self.reports_dir.join(format!("{epic_key}-decomposition.json"))
    }

    /// `reports/{EPIC}-plan.json`, written by the planning agent.
    pub fn plan_output(&self, epic_key: &str) -> PathBuf {
        self.reports_dir.join(format!("{epic_key}-plan.json"))
    }

    /// `reports/{KEY}-{runId}-attempt{N}.txt`
    pub fn attempt_artifact(&self, key: &str, run_id: &str, attempt: u32) -> PathBuf {
        self.reports_dir
            .join(format!("{key}-{run_id}-attempt{attempt}.txt"))
    }

    /// `logs/engine-{runId}.log`
    pub fn run_log(&self, run_id: &str) -> PathBuf {
        self.logs_dir.join(format!("engine-{run_id}.log"))
    }

    pub fn guardrail_log(&self, key: &str, run_id: &str) -> PathBuf {
        self.guardrail_logs_dir.join(format!("{key}-{run_id}.log"))
    }

    /// Render `path` relative to the root for comments and notifications.
    pub fn display_relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}
