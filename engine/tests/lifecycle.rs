//! Run-level lifecycle tests.
//!
//! These drive `run_engine` against scripted agent, tracker, guardrail and
//! notification boundaries and assert on exit codes, ledgers and tracker
//! writes across runs.

use std::cell::RefCell;
use std::path::PathBuf;
use std::time::Duration;

use engine::core::redact::Redactor;
use engine::core::state::PipelineState;
use engine::exit_codes;
use engine::io::config::{AgentConfig, EngineConfig};
use engine::io::escalations::EscalationStore;
use engine::io::guards::{GuardOutcome, GuardRequest, GuardRunner};
use engine::io::lock::{LockHeld, LockInfo, SessionLock};
use engine::io::work_ledger::{WorkLedger, steps};
use engine::orchestrator::TimeoutPolicy;
use engine::run::{RunDeps, RunMode, RunOptions, RunSummary, flush_escalations, run_engine};
use engine::test_support::{
    MemoryTracker, RecordingNotifier, ScriptedGuardRunner, ScriptedRun, ScriptedSpawner, TestRepo,
    passing_report, ticket,
};

const TRANSITIONS: &[(&str, &str, &str)] = &[
    ("21", "Review", "In Review"),
    ("31", "Done", "Done"),
    ("41", "Blocked", "Blocked"),
];

fn config() -> EngineConfig {
    EngineConfig {
        agent: AgentConfig {
            retry_delays_secs: vec![0],
            poll_millis: 10,
            ..AgentConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn options(repo: &TestRepo, issue: Option<&str>, mode: RunMode) -> RunOptions {
    RunOptions {
        root: repo.path().to_path_buf(),
        issue: issue.map(str::to_string),
        mode,
        timeouts: TimeoutPolicy {
            flag_secs: Some(5),
            env_value: None,
        },
        echo: false,
    }
}

struct Boundaries<G = ScriptedGuardRunner> {
    spawner: ScriptedSpawner,
    tracker: MemoryTracker,
    notifier: RecordingNotifier,
    guards: G,
    redactor: Redactor,
}

impl<G: GuardRunner> Boundaries<G> {
    fn run(&self, options: &RunOptions) -> anyhow::Result<RunSummary> {
        self.run_with(options, &config())
    }

    fn run_with(&self, options: &RunOptions, config: &EngineConfig) -> anyhow::Result<RunSummary> {
        let deps = RunDeps {
            spawner: &self.spawner,
            tracker: &self.tracker,
            notifier: &self.notifier,
            guards: &self.guards,
            redactor: &self.redactor,
        };
        run_engine(options, config, &deps)
    }
}

/// Guardrails that outlast several heartbeats, noting the lock file before
/// and after.
struct SlowGuards {
    lock_path: PathBuf,
    duration: Duration,
    seen: RefCell<Vec<LockInfo>>,
}

impl SlowGuards {
    fn read_lock(&self) -> LockInfo {
        let raw = std::fs::read_to_string(&self.lock_path).expect("lock file");
        serde_json::from_str(&raw).expect("lock json")
    }
}

impl GuardRunner for SlowGuards {
    fn run(&self, _request: &GuardRequest) -> anyhow::Result<GuardOutcome> {
        self.seen.borrow_mut().push(self.read_lock());
        std::thread::sleep(self.duration);
        self.seen.borrow_mut().push(self.read_lock());
        Ok(GuardOutcome::Pass)
    }
}

#[test]
fn auto_mode_processes_in_progress_tickets_in_order() {
    let repo = TestRepo::new().expect("repo");
    let mut parked = ticket("ABC-9", "Story", "Not started");
    parked.status = "To Do".to_string();
    let boundaries = Boundaries {
        spawner: ScriptedSpawner::new(vec![
            ScriptedRun::exit(0, &["implemented"]).writing(
                repo.paths().canonical_report("ABC-1"),
                passing_report("ABC-1"),
            ),
            ScriptedRun::exit(1, &["ReferenceError: issueKey is not defined"]),
        ]),
        tracker: MemoryTracker::new(vec![
            ticket("ABC-1", "Story", "Export"),
            parked,
            ticket("ABC-2", "Bug", "Crash"),
        ])
        .with_transitions(TRANSITIONS),
        notifier: RecordingNotifier::default(),
        guards: ScriptedGuardRunner::new(vec![GuardOutcome::Pass]),
        redactor: Redactor::default(),
    };

    let summary = boundaries
        .run(&options(&repo, None, RunMode::Process))
        .expect("run");

    let states: Vec<_> = summary
        .outcomes
        .iter()
        .map(|o| (o.key.as_str(), o.final_state()))
        .collect();
    assert_eq!(
        states,
        vec![
            ("ABC-1", PipelineState::Transitioned),
            ("ABC-2", PipelineState::Blocked),
        ]
    );
    assert_eq!(summary.exit_code(), exit_codes::ATTENTION);
    assert_eq!(boundaries.spawner.spawn_count(), 2);
    assert_eq!(boundaries.tracker.status_of("ABC-1").as_deref(), Some("Done"));
    assert_eq!(boundaries.tracker.status_of("ABC-2").as_deref(), Some("Blocked"));
    assert_eq!(boundaries.tracker.status_of("ABC-9").as_deref(), Some("To Do"));
    assert_eq!(boundaries.notifier.sent().len(), 1);
}

#[test]
fn pending_verification_resumes_without_reimplementing() {
    let repo = TestRepo::new().expect("repo");
    let boundaries = Boundaries {
        spawner: ScriptedSpawner::new(vec![ScriptedRun::exit(0, &["implemented"])]),
        tracker: MemoryTracker::new(vec![ticket("ABC-3", "Story", "")])
            .with_transitions(TRANSITIONS),
        notifier: RecordingNotifier::default(),
        guards: ScriptedGuardRunner::new(vec![GuardOutcome::Pass]),
        redactor: Redactor::default(),
    };

    // The agent left the seeded skeleton untouched, so the ticket waits.
    let first = boundaries
        .run(&options(&repo, Some("ABC-3"), RunMode::Process))
        .expect("first run");
    assert_eq!(first.outcomes[0].final_state(), PipelineState::Pending);
    assert!(boundaries.notifier.sent().is_empty());

    repo.write_report("ABC-3-verification.md", &passing_report("ABC-3"))
        .expect("report");
    let second = boundaries
        .run(&options(&repo, Some("ABC-3"), RunMode::Process))
        .expect("second run");

    assert_eq!(boundaries.spawner.spawn_count(), 1);
    assert_eq!(second.outcomes[0].final_state(), PipelineState::Transitioned);
    assert_eq!(second.exit_code(), exit_codes::OK);
    let entry = WorkLedger::new(&repo.paths().work_ledger_path)
        .get("ABC-3")
        .expect("ledger")
        .expect("entry");
    assert_eq!(entry.last_step, steps::TRANSITION);
}

#[test]
fn verify_only_never_spawns_the_agent() {
    let repo = TestRepo::new().expect("repo");
    repo.write_report("ABC-4-verification.md", &passing_report("ABC-4"))
        .expect("report");
    let boundaries = Boundaries {
        spawner: ScriptedSpawner::new(Vec::new()),
        tracker: MemoryTracker::new(vec![ticket("ABC-4", "Story", "")])
            .with_transitions(TRANSITIONS),
        notifier: RecordingNotifier::default(),
        guards: ScriptedGuardRunner::new(Vec::new()),
        redactor: Redactor::default(),
    };

    let summary = boundaries
        .run(&options(&repo, Some("ABC-4"), RunMode::VerifyOnly))
        .expect("run");

    assert_eq!(boundaries.spawner.spawn_count(), 0);
    // No guardrails result has been recorded for this ticket yet.
    assert_eq!(summary.outcomes[0].final_state(), PipelineState::Pending);
    assert_eq!(summary.exit_code(), exit_codes::OK);
}

#[test]
fn second_session_is_refused_while_lock_is_held() {
    let repo = TestRepo::new().expect("repo");
    let cfg = config();
    let _held = SessionLock::acquire(
        &repo.paths().lock_path(&cfg.lock.name),
        chrono::Duration::hours(1),
    )
    .expect("lock");
    let boundaries = Boundaries {
        spawner: ScriptedSpawner::new(Vec::new()),
        tracker: MemoryTracker::new(vec![ticket("ABC-5", "Story", "")]),
        notifier: RecordingNotifier::default(),
        guards: ScriptedGuardRunner::new(Vec::new()),
        redactor: Redactor::default(),
    };

    let err = boundaries
        .run(&options(&repo, None, RunMode::Process))
        .unwrap_err();

    assert!(err.downcast_ref::<LockHeld>().is_some());
    assert_eq!(boundaries.spawner.spawn_count(), 0);
}

#[test]
fn queued_escalations_are_delivered_once_transport_recovers() {
    let repo = TestRepo::new().expect("repo");
    let boundaries = Boundaries {
        spawner: ScriptedSpawner::new(vec![ScriptedRun::exit(
            1,
            &["ReferenceError: issueKey is not defined"],
        )]),
        tracker: MemoryTracker::new(vec![ticket("ABC-6", "Story", "")])
            .with_transitions(TRANSITIONS),
        notifier: RecordingNotifier::failing(),
        guards: ScriptedGuardRunner::new(Vec::new()),
        redactor: Redactor::default(),
    };

    boundaries
        .run(&options(&repo, Some("ABC-6"), RunMode::Process))
        .expect("run");
    let store = EscalationStore::new(&repo.paths().escalations_path);
    assert_eq!(store.load().expect("queue").queued.len(), 1);

    boundaries.notifier.set_failing(false);
    let flushed = flush_escalations(
        repo.path(),
        &config(),
        &boundaries.notifier,
        &boundaries.redactor,
    )
    .expect("flush");

    assert_eq!(flushed.delivered, 1);
    assert_eq!(flushed.remaining, 0);
    assert_eq!(boundaries.notifier.sent().len(), 1);
    assert!(store.load().expect("queue").queued.is_empty());
}

#[test]
fn secrets_are_redacted_from_logs_and_artifacts() {
    let repo = TestRepo::new().expect("repo");
    let boundaries = Boundaries {
        spawner: ScriptedSpawner::new(vec![ScriptedRun::exit(
            0,
            &["export API_KEY=hunter2-hunter2", "token value-abcdef-99 in use"],
        )]),
        tracker: MemoryTracker::new(vec![ticket("ABC-7", "Story", "")])
            .with_transitions(TRANSITIONS),
        notifier: RecordingNotifier::default(),
        guards: ScriptedGuardRunner::new(vec![GuardOutcome::Pass]),
        redactor: Redactor::new([("SERVICE_TOKEN", "value-abcdef-99".to_string())], &[])
            .expect("redactor"),
    };

    let summary = boundaries
        .run(&options(&repo, Some("ABC-7"), RunMode::Process))
        .expect("run");

    let log = std::fs::read_to_string(repo.paths().run_log(&summary.run_id)).expect("log");
    let artifact = std::fs::read_to_string(repo.paths().attempt_artifact(
        "ABC-7",
        &summary.run_id,
        1,
    ))
    .expect("artifact");
    for text in [&log, &artifact] {
        assert!(!text.contains("hunter2-hunter2"));
        assert!(!text.contains("value-abcdef-99"));
        assert!(text.contains("[REDACTED]"));
    }
}

#[test]
fn bearer_headers_never_reach_logs_or_artifacts() {
    let repo = TestRepo::new().expect("repo");
    let boundaries = Boundaries {
        spawner: ScriptedSpawner::new(vec![ScriptedRun::exit(
            0,
            &["curl -H 'Authorization: Bearer xyz' https://tracker.invalid/api"],
        )]),
        tracker: MemoryTracker::new(vec![ticket("ABC-10", "Story", "")])
            .with_transitions(TRANSITIONS),
        notifier: RecordingNotifier::default(),
        guards: ScriptedGuardRunner::new(vec![GuardOutcome::Pass]),
        redactor: Redactor::default(),
    };

    let summary = boundaries
        .run(&options(&repo, Some("ABC-10"), RunMode::Process))
        .expect("run");

    let log = std::fs::read_to_string(repo.paths().run_log(&summary.run_id)).expect("log");
    let artifact = std::fs::read_to_string(repo.paths().attempt_artifact(
        "ABC-10",
        &summary.run_id,
        1,
    ))
    .expect("artifact");
    for text in [&log, &artifact] {
        assert!(!text.contains("xyz"));
        assert!(text.contains("Authorization: [REDACTED]"));
    }
}

#[test]
fn lock_stays_fresh_while_guardrails_run() {
    let repo = TestRepo::new().expect("repo");
    let mut cfg = config();
    cfg.agent.heartbeat_secs = 1;
    let boundaries = Boundaries {
        spawner: ScriptedSpawner::new(vec![ScriptedRun::exit(0, &["implemented"]).writing(
            repo.paths().canonical_report("ABC-8"),
            passing_report("ABC-8"),
        )]),
        tracker: MemoryTracker::new(vec![ticket("ABC-8", "Story", "")])
            .with_transitions(TRANSITIONS),
        notifier: RecordingNotifier::default(),
        guards: SlowGuards {
            lock_path: repo.paths().lock_path(&cfg.lock.name),
            duration: Duration::from_millis(2500),
            seen: RefCell::new(Vec::new()),
        },
        redactor: Redactor::default(),
    };

    let summary = boundaries
        .run_with(&options(&repo, Some("ABC-8"), RunMode::Process), &cfg)
        .expect("run");

    assert_eq!(summary.outcomes[0].final_state(), PipelineState::Transitioned);
    let seen = boundaries.guards.seen.borrow();
    let (before, after) = (&seen[0], &seen[1]);
    assert_eq!(before.pid, after.pid);
    assert_eq!(before.acquired_at, after.acquired_at);
    assert!(after.refreshed_at > before.refreshed_at);
}
