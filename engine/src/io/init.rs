//! `engine init`: scaffolding for `.engineo/`, `reports/` and `logs/`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::io::config::{EngineConfig, write_config};
use crate::io::ledger::DocumentStore;
use crate::io::paths::EnginePaths;
use crate::io::tracker::TrackerSnapshot;

/// Options for [`init_engine`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite the config and `.gitignore` if they exist.
    pub force: bool,
}

const STATE_GITIGNORE: &str = "*.lock\n*.tmp\n*.corrupt\nguardrails/\n";

/// Create the engine layout in `root`.
///
/// Fails if a config already exists unless `options.force` is set. Ledgers,
/// reports and the tracker snapshot are never overwritten.
pub fn init_engine(root: &Path, options: &InitOptions) -> Result<EnginePaths> {
    let paths = EnginePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("engine init: .engineo exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "engine init: {} already exists (use --force to overwrite)",
            paths.display_relative(&paths.config_path)
        ));
    }

    for dir in [
        &paths.state_dir,
        &paths.reports_dir,
        &paths.logs_dir,
        &paths.guardrail_logs_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    write_config(&paths.config_path, &EngineConfig::default())?;
    let gitignore = paths.state_dir.join(".gitignore");
    fs::write(&gitignore, STATE_GITIGNORE)
        .with_context(|| format!("write file {}", gitignore.display()))?;

    let tracker_path = paths.root.join(EngineConfig::default().tracker.path);
    if !tracker_path.exists() {
        DocumentStore::new(&tracker_path).save(&TrackerSnapshot::default())?;
    }
    Ok(paths)
}
