//! CLI tests for the `engine` binary.
//!
//! Spawns the binary and checks output and exit codes.

use std::process::Command;

use engine::exit_codes;
use engine::io::config::EngineConfig;
use engine::io::escalations::{EscalationRecord, EscalationStore};
use engine::io::init::{InitOptions, init_engine};
use engine::io::lock::SessionLock;

fn engine() -> Command {
    Command::new(env!("CARGO_BIN_EXE_engine"))
}

#[test]
fn dispatch_prints_pipeline_kind() {
    let output = engine().args(["dispatch", "Idea"]).output().expect("engine dispatch");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "initiative");
}

#[test]
fn init_twice_without_force_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = engine()
        .arg("init")
        .arg("--root")
        .arg(temp.path())
        .status()
        .expect("engine init");
    assert_eq!(first.code(), Some(exit_codes::OK));

    let second = engine()
        .arg("init")
        .arg("--root")
        .arg(temp.path())
        .status()
        .expect("engine init");
    assert_eq!(second.code(), Some(exit_codes::ERROR));
}

#[test]
fn run_with_no_in_progress_tickets_is_ok() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_engine(temp.path(), &InitOptions { force: false }).expect("init");

    let status = engine()
        .current_dir(temp.path())
        .args(["run", "--quiet"])
        .status()
        .expect("engine run");

    assert_eq!(status.code(), Some(exit_codes::OK));
}

#[test]
fn run_exits_locked_while_another_session_holds_the_lock() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_engine(temp.path(), &InitOptions { force: false }).expect("init");
    let config = EngineConfig::default();
    let _held = SessionLock::acquire(
        &paths.lock_path(&config.lock.name),
        chrono::Duration::hours(1),
    )
    .expect("lock");

    let status = engine()
        .current_dir(temp.path())
        .args(["run", "--quiet"])
        .status()
        .expect("engine run");

    assert_eq!(status.code(), Some(exit_codes::LOCKED));
}

#[test]
fn flush_escalations_delivers_queued_records() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_engine(temp.path(), &InitOptions { force: false }).expect("init");
    EscalationStore::new(&paths.escalations_path)
        .update(|queue| {
            queue.queued.push(EscalationRecord {
                issue_key: "ABC-1".to_string(),
                reason: "fatal agent failure".to_string(),
                fingerprint: "0123456789abcdef".to_string(),
                created_at: chrono::Utc::now(),
                artifacts: Vec::new(),
            });
        })
        .expect("queue");

    let output = engine()
        .current_dir(temp.path())
        .arg("flush-escalations")
        .output()
        .expect("engine flush-escalations");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("delivered 1"));
    let queue = EscalationStore::new(&paths.escalations_path)
        .load()
        .expect("load");
    assert!(queue.queued.is_empty());
    assert_eq!(queue.delivered.len(), 1);
}
