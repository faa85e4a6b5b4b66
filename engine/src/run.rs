//! One engine run: lock, log, flush escalations, then process tickets in
//! order.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{instrument, warn};

use crate::core::backoff::BackoffGate;
use crate::core::dispatch::resolve_dispatch;
use crate::core::redact::Redactor;
use crate::core::types::{DispatchKind, Ticket};
use crate::escalation::{EscalationNotifier, FlushSummary};
use crate::exit_codes;
use crate::io::config::EngineConfig;
use crate::io::escalations::EscalationStore;
use crate::io::git::Git;
use crate::io::guardrails::GuardrailsLedger;
use crate::io::guards::GuardRunner;
use crate::io::lock::{LockKeeper, SessionLock};
use crate::io::notify::Notifier;
use crate::io::paths::EnginePaths;
use crate::io::prompt::PromptBuilder;
use crate::io::run_log::{RunLogger, RunSession, roles};
use crate::io::stream::Spawner;
use crate::io::tracker::Tracker;
use crate::io::work_ledger::WorkLedger;
use crate::orchestrator::{Orchestrator, TimeoutPolicy};
use crate::pipeline::{Pipeline, TicketOutcome};
use crate::verify::Verifier;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Full pipeline.
    Process,
    /// Verification only.
    VerifyOnly,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub root: PathBuf,
    /// Single-ticket mode; `None` processes every in-progress ticket.
    pub issue: Option<String>,
    pub mode: RunMode,
    pub timeouts: TimeoutPolicy,
    /// Mirror the run log to stdout.
    pub echo: bool,
}

/// Boundaries a run talks to.
pub struct RunDeps<'a> {
    pub spawner: &'a dyn Spawner,
    pub tracker: &'a dyn Tracker,
    pub notifier: &'a dyn Notifier,
    pub guards: &'a dyn GuardRunner,
    pub redactor: &'a Redactor,
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub flushed: FlushSummary,
    pub outcomes: Vec<TicketOutcome>,
    /// `(issue key, redacted error)` for tickets that errored out.
    pub errors: Vec<(String, String)>,
}

impl RunSummary {
    pub fn needs_attention(&self) -> bool {
        self.outcomes.iter().any(TicketOutcome::needs_attention)
    }

    pub fn exit_code(&self) -> i32 {
        if !self.errors.is_empty() {
            exit_codes::ERROR
        } else if self.needs_attention() {
            exit_codes::ATTENTION
        } else {
            exit_codes::OK
        }
    }
}

/// Tickets auto mode picks up: in progress and of a known type.
pub fn select_tickets(tickets: Vec<Ticket>) -> Vec<Ticket> {
    tickets
        .into_iter()
        .filter(|t| resolve_dispatch(t.issue_type.as_str()) != DispatchKind::Unknown)
        .collect()
}

/// Execute one run. Fails with [`crate::io::lock::LockHeld`] when another
/// session holds the lock.
#[instrument(skip_all, fields(root = %options.root.display(), issue = ?options.issue))]
pub fn run_engine(
    options: &RunOptions,
    config: &EngineConfig,
    deps: &RunDeps<'_>,
) -> Result<RunSummary> {
    let paths = EnginePaths::new(&options.root);
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create {}", paths.state_dir.display()))?;
    let session = RunSession::start(Utc::now());

    let stale = chrono::Duration::seconds(i64::try_from(config.lock.stale_secs).unwrap_or(i64::MAX));
    let lock = LockKeeper::start(
        SessionLock::acquire(&paths.lock_path(&config.lock.name), stale)?,
        Duration::from_secs(config.agent.heartbeat_secs.max(1)),
    );

    let logger = RunLogger::open(
        &paths.logs_dir,
        &session.run_id,
        Duration::from_secs(config.logs.retention_days.saturating_mul(SECS_PER_DAY)),
        deps.redactor.clone(),
        options.echo,
    )?;
    logger.log(
        roles::ENGINE,
        &format!(
            "run {} started (pid {}, {:?}{})",
            session.run_id,
            std::process::id(),
            options.mode,
            options
                .issue
                .as_deref()
                .map(|key| format!(", issue {key}"))
                .unwrap_or_default()
        ),
    );

    let escalation_store = EscalationStore::new(&paths.escalations_path);
    let escalations = EscalationNotifier {
        store: &escalation_store,
        notifier: deps.notifier,
        redactor: deps.redactor,
    };
    let flushed = escalations.flush()?;
    if flushed.delivered > 0 || flushed.remaining > 0 {
        logger.log(
            roles::ESCALATE,
            &format!(
                "flushed {} queued escalation(s), {} still queued",
                flushed.delivered, flushed.remaining
            ),
        );
    }

    let tickets = match &options.issue {
        Some(key) => vec![deps.tracker.fetch_ticket(key)?],
        None => select_tickets(deps.tracker.list_in_progress()?),
    };
    logger.log(roles::ENGINE, &format!("{} ticket(s) to process", tickets.len()));

    let patterns = config.failures.patterns();
    let orchestrator = Orchestrator {
        spawner: deps.spawner,
        config: &config.agent,
        patterns: &patterns,
        paths: &paths,
        logger: &logger,
        run_id: &session.run_id,
        timeouts: &options.timeouts,
        lock: Some(&lock),
    };
    let prompts = PromptBuilder::default();
    let work_ledger = WorkLedger::new(&paths.work_ledger_path);
    let guardrails = GuardrailsLedger::new(&paths.guardrails_ledger_path);
    let cooldown =
        chrono::Duration::seconds(i64::try_from(config.verification.cooldown_secs).unwrap_or(i64::MAX));
    let verifier = Verifier {
        paths: &paths,
        guardrails: &guardrails,
        gate: BackoffGate::new(cooldown),
    };
    let git = Git::new(&paths.root);
    let pipeline = Pipeline {
        orchestrator: &orchestrator,
        tracker: deps.tracker,
        prompts: &prompts,
        guards: deps.guards,
        guardrails_config: &config.guardrails,
        transitions: &config.transitions,
        work_ledger: &work_ledger,
        guardrails: &guardrails,
        verifier: &verifier,
        escalations: &escalations,
        git: &git,
    };

    let mut outcomes = Vec::new();
    let mut errors = Vec::new();
    for ticket in &tickets {
        if let Err(err) = lock.refresh() {
            warn!(err = %err, "failed to refresh session lock");
        }
        let result = match options.mode {
            RunMode::Process => pipeline.process_ticket(ticket),
            RunMode::VerifyOnly => pipeline.verify_ticket(ticket),
        };
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                let message = deps.redactor.redact(&format!("{err:#}"));
                logger.log(roles::ENGINE, &format!("{}: error: {message}", ticket.key));
                errors.push((ticket.key.clone(), message));
            }
        }
    }

    let summary = RunSummary {
        run_id: session.run_id.clone(),
        flushed,
        outcomes,
        errors,
    };
    logger.log(
        roles::ENGINE,
        &format!(
            "run {} finished: {} processed, {} error(s), attention needed: {}",
            summary.run_id,
            summary.outcomes.len(),
            summary.errors.len(),
            summary.needs_attention()
        ),
    );
    Ok(summary)
}

/// Flush queued escalations without processing tickets.
pub fn flush_escalations(
    root: &Path,
    config: &EngineConfig,
    notifier: &dyn Notifier,
    redactor: &Redactor,
) -> Result<FlushSummary> {
    let paths = EnginePaths::new(root);
    let stale = chrono::Duration::seconds(i64::try_from(config.lock.stale_secs).unwrap_or(i64::MAX));
    let _lock = SessionLock::acquire(&paths.lock_path(&config.lock.name), stale)?;
    let store = EscalationStore::new(&paths.escalations_path);
    EscalationNotifier {
        store: &store,
        notifier,
        redactor,
    }
    .flush()
}
