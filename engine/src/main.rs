//! `engine` command-line interface.
//!
//! Runs the ticket pipeline against the repository at `--root`. State lives
//! in `.engineo/`, `reports/` and `logs/` under that root.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use engine::core::dispatch::resolve_dispatch;
use engine::core::redact::Redactor;
use engine::exit_codes;
use engine::io::config::{EngineConfig, REDACT_ENV, TIMEOUT_ENV, load_config};
use engine::io::guards::CommandGuardRunner;
use engine::io::init::{InitOptions, init_engine};
use engine::io::lock::LockHeld;
use engine::io::notify::notifier_from_config;
use engine::io::paths::EnginePaths;
use engine::io::stream::{PipeSpawner, PtySpawner, Spawner};
use engine::io::tracker::FileTracker;
use engine::logging;
use engine::orchestrator::TimeoutPolicy;
use engine::run::{RunDeps, RunMode, RunOptions, flush_escalations, run_engine};

#[derive(Parser)]
#[command(
    name = "engine",
    version,
    about = "Autonomous ticket-execution engine for an external coding agent"
)]
struct Cli {
    /// Repository root containing `.engineo/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process one ticket (`--issue`) or every in-progress ticket.
    Run {
        #[arg(long)]
        issue: Option<String>,
        /// Hard agent timeout; overrides the environment and ticket markers.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Do not mirror the run log to stdout.
        #[arg(short, long)]
        quiet: bool,
    },
    /// Verification-only pass for one ticket.
    Verify {
        #[arg(long)]
        issue: String,
    },
    /// Print the pipeline kind for a ticket type.
    Dispatch { issue_type: String },
    /// Retry queued escalations.
    FlushEscalations,
    /// Write `.engineo/config.toml` and create the state directories.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match execute(&cli) {
        Ok(code) => code,
        Err(err) => {
            let (code, message) = error_report(&cli.root, &err);
            eprintln!("{message}");
            code
        }
    };
    std::process::exit(code);
}

/// Exit code and redacted stderr text for a failed command.
fn error_report(root: &Path, err: &anyhow::Error) -> (i32, String) {
    if let Some(held) = err.downcast_ref::<LockHeld>() {
        return (exit_codes::LOCKED, held.to_string());
    }
    (
        exit_codes::ERROR,
        error_redactor(root).redact(&format!("{err:#}")),
    )
}

/// The configured redactor, or the default secret names and built-in
/// patterns when the config itself cannot be loaded.
fn error_redactor(root: &Path) -> Redactor {
    load(root)
        .and_then(|config| redactor(&config))
        .or_else(|_| redactor(&EngineConfig::default()))
        .unwrap_or_default()
}

fn execute(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Command::Dispatch { issue_type } => {
            println!("{}", resolve_dispatch(issue_type));
            Ok(exit_codes::OK)
        }
        Command::Init { force } => {
            let paths = init_engine(&cli.root, &InitOptions { force: *force })?;
            println!("initialized {}", paths.config_path.display());
            Ok(exit_codes::OK)
        }
        Command::FlushEscalations => {
            let config = load(&cli.root)?;
            let redactor = redactor(&config)?;
            let notifier = notifier_from_config(&config.notify, &cli.root);
            let summary = flush_escalations(&cli.root, &config, notifier.as_ref(), &redactor)?;
            println!(
                "delivered {}, still queued {}",
                summary.delivered, summary.remaining
            );
            Ok(exit_codes::OK)
        }
        Command::Run {
            issue,
            timeout_secs,
            quiet,
        } => run(cli, issue.clone(), *timeout_secs, RunMode::Process, !quiet),
        Command::Verify { issue } => run(cli, Some(issue.clone()), None, RunMode::VerifyOnly, true),
    }
}

fn load(root: &Path) -> Result<EngineConfig> {
    load_config(&EnginePaths::new(root).config_path)
}

fn redactor(config: &EngineConfig) -> Result<Redactor> {
    let names = config
        .redaction
        .env_var_names(std::env::var(REDACT_ENV).ok().as_deref());
    Redactor::from_env(&names, &config.redaction.patterns)
}

fn run(
    cli: &Cli,
    issue: Option<String>,
    timeout_secs: Option<u64>,
    mode: RunMode,
    echo: bool,
) -> Result<i32> {
    let config = load(&cli.root)?;
    let redactor = redactor(&config)?;
    let spawner: Box<dyn Spawner> = if config.agent.use_pty {
        Box::new(PtySpawner)
    } else {
        Box::new(PipeSpawner)
    };
    let tracker = FileTracker::new(
        cli.root.join(&config.tracker.path),
        config.tracker.in_progress_statuses.clone(),
    );
    let notifier = notifier_from_config(&config.notify, &cli.root);
    let guards = CommandGuardRunner::new(config.guardrails.command.clone(), redactor.clone());

    let options = RunOptions {
        root: cli.root.clone(),
        issue,
        mode,
        timeouts: TimeoutPolicy {
            flag_secs: timeout_secs,
            env_value: std::env::var(TIMEOUT_ENV).ok(),
        },
        echo,
    };
    let deps = RunDeps {
        spawner: spawner.as_ref(),
        tracker: &tracker,
        notifier: notifier.as_ref(),
        guards: &guards,
        redactor: &redactor,
    };
    let summary = run_engine(&options, &config, &deps)?;
    for (key, message) in &summary.errors {
        eprintln!("{key}: {message}");
    }
    Ok(summary.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_issue_and_timeout() {
        let cli = Cli::parse_from(["engine", "run", "--issue", "ABC-1", "--timeout-secs", "90"]);
        assert!(matches!(
            cli.command,
            Command::Run { ref issue, timeout_secs: Some(90), quiet: false } if issue.as_deref() == Some("ABC-1")
        ));
        assert_eq!(cli.root, PathBuf::from("."));
    }

    #[test]
    fn parse_global_root_after_subcommand() {
        let cli = Cli::parse_from(["engine", "verify", "--issue", "ABC-1", "--root", "/tmp/repo"]);
        assert_eq!(cli.root, PathBuf::from("/tmp/repo"));
        assert!(matches!(cli.command, Command::Verify { .. }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["engine", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn errors_are_redacted_with_configured_patterns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.redaction.patterns = vec![r"tenant-[0-9]+".to_string()];
        engine::io::config::write_config(&EnginePaths::new(temp.path()).config_path, &config)
            .expect("config");

        let err = anyhow::anyhow!("tracker rejected tenant-4711")
            .context("Authorization: Bearer abc.def.ghi");
        let (code, message) = error_report(temp.path(), &err);

        assert_eq!(code, exit_codes::ERROR);
        assert!(!message.contains("tenant-4711"));
        assert!(!message.contains("abc.def.ghi"));
        assert!(message.contains("tracker rejected [REDACTED]"));
    }

    #[test]
    fn unreadable_config_still_redacts_builtin_patterns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = EnginePaths::new(temp.path());
        std::fs::create_dir_all(&paths.state_dir).expect("state dir");
        std::fs::write(&paths.config_path, "not = [valid").expect("config");

        let err = anyhow::anyhow!("request failed: api_key=sk-live-0123456789abcdef");
        let (_, message) = error_report(temp.path(), &err);
        assert!(!message.contains("sk-live-0123456789abcdef"));
    }

    #[test]
    fn lock_held_reports_the_locked_code() {
        let err = anyhow::Error::new(LockHeld {
            path: PathBuf::from(".engineo/agent-session.lock"),
            pid: 42,
            host: "box".to_string(),
            acquired_at: "2026-01-01T00:00:00Z".to_string(),
        });
        let (code, message) = error_report(Path::new("."), &err);
        assert_eq!(code, exit_codes::LOCKED);
        assert!(message.contains("pid 42"));
    }

    #[test]
    fn parse_flush_escalations() {
        let cli = Cli::parse_from(["engine", "flush-escalations"]);
        assert!(matches!(cli.command, Command::FlushEscalations));
    }
}
