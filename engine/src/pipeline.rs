//! Per-ticket pipeline: classify, decompose or implement, verify, then
//! transition or escalate.
//!
//! Every step writes the work ledger before the next one starts, so a killed
//! run resumes at the first unfinished step.

use anyhow::Result;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::core::dispatch::resolve_dispatch;
use crate::core::fingerprint::{failure_fingerprint, sha256_hex};
use crate::core::state::{PipelineState, StateTrail};
use crate::core::types::{DispatchKind, FailureClass, StepResult, Ticket, Verdict};
use crate::decompose::{Decomposer, DecompositionOutcome};
use crate::escalation::{EscalationNotifier, new_record};
use crate::io::config::{GuardrailsConfig, TransitionConfig};
use crate::io::evidence::ensure_skeleton;
use crate::io::git::Git;
use crate::io::guardrails::GuardrailsLedger;
use crate::io::guards::{GuardOutcome, GuardRequest, GuardRunner};
use crate::io::prompt::{ImplementPrompt, PromptBuilder};
use crate::io::run_log::roles;
use crate::io::tracker::Tracker;
use crate::io::work_ledger::{WorkLedger, WorkLedgerEntry, steps};
use crate::orchestrator::{InvocationOutcome, InvocationRequest, Orchestrator, Phase};
use crate::verify::{Verifier, VerifyDecision};

/// Where one ticket ended up this run.
#[derive(Debug, Clone)]
pub struct TicketOutcome {
    pub key: String,
    pub dispatch: DispatchKind,
    pub trail: StateTrail,
}

impl TicketOutcome {
    pub fn final_state(&self) -> PipelineState {
        self.trail.current()
    }

    pub fn needs_attention(&self) -> bool {
        self.final_state().needs_attention()
    }
}

pub struct Pipeline<'a> {
    pub orchestrator: &'a Orchestrator<'a>,
    pub tracker: &'a dyn Tracker,
    pub prompts: &'a PromptBuilder,
    pub guards: &'a dyn GuardRunner,
    pub guardrails_config: &'a GuardrailsConfig,
    pub transitions: &'a TransitionConfig,
    pub work_ledger: &'a WorkLedger,
    pub guardrails: &'a GuardrailsLedger,
    pub verifier: &'a Verifier<'a>,
    pub escalations: &'a EscalationNotifier<'a>,
    pub git: &'a Git,
}

impl Pipeline<'_> {
    fn log(&self, role: &str, message: &str) {
        self.orchestrator.logger.log(role, message);
    }

    fn record(
        &self,
        key: &str,
        step: &str,
        result: StepResult,
        merge: impl FnOnce(&mut WorkLedgerEntry),
    ) -> Result<WorkLedgerEntry> {
        self.work_ledger.upsert(key, |entry| {
            entry.record_step(step, result);
            merge(entry);
        })
    }

    fn classify(&self, ticket: &Ticket, trail: &mut StateTrail) -> Result<DispatchKind> {
        let dispatch = resolve_dispatch(ticket.issue_type.as_str());
        self.record(&ticket.key, steps::CLASSIFY, StepResult::Success, |entry| {
            entry.observe(ticket);
        })?;
        trail.advance(PipelineState::Classified)?;
        self.log(
            roles::ENGINE,
            &format!(
                "{}: {} in status `{}` dispatches to {dispatch}",
                ticket.key, ticket.issue_type, ticket.status
            ),
        );
        Ok(dispatch)
    }

    fn finish(&self, ticket: &Ticket, dispatch: DispatchKind, trail: StateTrail) -> TicketOutcome {
        self.log(roles::ENGINE, &format!("{}: {}", ticket.key, trail.render()));
        TicketOutcome {
            key: ticket.key.clone(),
            dispatch,
            trail,
        }
    }

    /// Run the full pipeline for one ticket.
    #[instrument(skip_all, fields(key = %ticket.key))]
    pub fn process_ticket(&self, ticket: &Ticket) -> Result<TicketOutcome> {
        let mut trail = StateTrail::default();
        let dispatch = self.classify(ticket, &mut trail)?;
        match dispatch {
            DispatchKind::Unknown => {
                trail.advance(PipelineState::Skipped)?;
                self.log(
                    roles::ENGINE,
                    &format!("{}: no pipeline for type {}; skipped", ticket.key, ticket.issue_type),
                );
            }
            DispatchKind::Epic | DispatchKind::Initiative => self.decompose(ticket, &mut trail)?,
            DispatchKind::Implement => {
                let entry = self.work_ledger.get(&ticket.key)?;
                if entry.as_ref().is_some_and(WorkLedgerEntry::implementation_done) {
                    self.log(
                        roles::ENGINE,
                        &format!("{}: implementation already succeeded; resuming at verification", ticket.key),
                    );
                } else if !self.implement(ticket, &mut trail)? {
                    return Ok(self.finish(ticket, dispatch, trail));
                }
                trail.advance(PipelineState::Verifying)?;
                self.verify(ticket, &mut trail)?;
            }
        }
        Ok(self.finish(ticket, dispatch, trail))
    }

    /// Verification only, for tickets implemented outside this run.
    #[instrument(skip_all, fields(key = %ticket.key))]
    pub fn verify_ticket(&self, ticket: &Ticket) -> Result<TicketOutcome> {
        let mut trail = StateTrail::default();
        let dispatch = self.classify(ticket, &mut trail)?;
        trail.advance(PipelineState::Verifying)?;
        self.verify(ticket, &mut trail)?;
        Ok(self.finish(ticket, dispatch, trail))
    }

    fn decompose(&self, ticket: &Ticket, trail: &mut StateTrail) -> Result<()> {
        let decomposer = Decomposer {
            orchestrator: self.orchestrator,
            tracker: self.tracker,
            prompts: self.prompts,
        };
        match decomposer.decompose(ticket)? {
            DecompositionOutcome::Skipped { .. } | DecompositionOutcome::Decomposed { .. } => {
                self.record(&ticket.key, steps::DECOMPOSE, StepResult::Success, |_| {})?;
                trail.advance(PipelineState::Decomposed)?;
            }
            DecompositionOutcome::AgentFailed(invocation) => {
                self.agent_failed(ticket, trail, steps::DECOMPOSE, &invocation)?;
            }
            DecompositionOutcome::InvalidPlan { reason, invocation } => {
                let fingerprint = failure_fingerprint(&FailureClass::Unclassified, &reason);
                self.record(&ticket.key, steps::ESCALATE, StepResult::Failed, |entry| {
                    entry.last_error_fingerprint = Some(fingerprint.clone());
                })?;
                trail.advance(PipelineState::Escalated)?;
                self.escalate(
                    ticket,
                    &format!("decomposition plan rejected: {reason}"),
                    &fingerprint,
                    self.artifacts(&invocation),
                )?;
            }
        }
        Ok(())
    }

    /// Returns whether the pipeline continues to verification.
    fn implement(&self, ticket: &Ticket, trail: &mut StateTrail) -> Result<bool> {
        let key = &ticket.key;
        let paths = self.orchestrator.paths;
        trail.advance(PipelineState::Implementing)?;

        let base_sha = match self.git.head_sha() {
            Ok(sha) => Some(sha),
            Err(err) => {
                warn!(key = %key, err = %err, "no git base commit");
                None
            }
        };
        let report = paths.canonical_report(key);
        if ensure_skeleton(&report, key)? {
            self.log(
                roles::ENGINE,
                &format!("{key}: seeded {}", paths.display_relative(&report)),
            );
        }
        let report_display = paths.display_relative(&report);

        let prompt = |attempt: u32, failure: Option<&str>| {
            self.prompts.implement(&ImplementPrompt {
                ticket,
                report_path: &report_display,
                attempt,
                failure,
            })
        };
        let invocation = self.orchestrator.invoke(&InvocationRequest {
            ticket,
            phase: Phase::Implement,
            prompt: &prompt,
        })?;
        if !invocation.succeeded() {
            self.agent_failed(ticket, trail, steps::IMPLEMENT, &invocation)?;
            return Ok(false);
        }

        let head_sha = self.git.head_sha().ok();
        self.record(key, steps::IMPLEMENT, StepResult::Success, |entry| {
            entry.last_commit_sha = head_sha;
            entry.verification_report_path = Some(report_display.clone());
            entry.last_error_fingerprint = None;
        })?;
        self.run_guardrails(ticket, base_sha, &report_display)?;
        Ok(true)
    }

    fn run_guardrails(
        &self,
        ticket: &Ticket,
        base_sha: Option<String>,
        report_display: &str,
    ) -> Result<()> {
        let key = &ticket.key;
        let paths = self.orchestrator.paths;
        let run_id = self.orchestrator.run_id;
        let log_path = paths.guardrail_log(key, run_id);
        let request =
            GuardRequest::from_config(self.guardrails_config, paths.root.clone(), log_path.clone());
        let outcome = match self.guards.run(&request) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.log(
                    roles::GUARD,
                    &format!("{key}: guardrails could not run: {err:#}"),
                );
                GuardOutcome::Fail
            }
        };

        let changed_files = match &base_sha {
            Some(base) => self.git.changed_files_since(base).unwrap_or_else(|err| {
                warn!(key = %key, err = %err, "could not list changed files");
                Vec::new()
            }),
            None => Vec::new(),
        };
        self.log(
            roles::GUARD,
            &format!(
                "{key}: guardrails {} ({} changed file(s)), log {}",
                if outcome.passed() { "passed" } else { "failed" },
                changed_files.len(),
                paths.display_relative(&log_path)
            ),
        );
        self.guardrails.upsert(key, |entry| {
            entry.run_id = run_id.to_string();
            entry.base_sha = base_sha.unwrap_or_default();
            entry.changed_files = changed_files;
            entry.guardrails_passed = outcome.passed();
            entry.status = if outcome.passed() { "passed" } else { "failed" }.to_string();
            entry.verification_report_path = report_display.to_string();
        })?;
        Ok(())
    }

    fn verify(&self, ticket: &Ticket, trail: &mut StateTrail) -> Result<()> {
        let key = &ticket.key;
        let history = self
            .work_ledger
            .get(key)?
            .map(|entry| entry.verify_history())
            .unwrap_or_default();
        let decision = self.verifier.verify(
            ticket,
            &history,
            self.tracker,
            self.orchestrator.logger,
            Utc::now(),
        )?;

        let (evaluation, history) = match decision {
            VerifyDecision::CoolingDown { .. } => {
                self.record(key, steps::VERIFY, StepResult::Cancelled, |_| {})?;
                trail.advance(PipelineState::Skipped)?;
                return Ok(());
            }
            VerifyDecision::Evaluated {
                evaluation, history, ..
            } => (evaluation, history),
        };

        let paths = self.orchestrator.paths;
        let report_display = evaluation
            .report
            .as_deref()
            .map(|report| paths.display_relative(report));
        let result = match evaluation.verdict {
            Verdict::Fail => StepResult::Failed,
            Verdict::Pass | Verdict::Pending => StepResult::Success,
        };
        self.record(key, steps::VERIFY, result, |entry| {
            entry.set_verify_history(history);
            if report_display.is_some() {
                entry.verification_report_path = report_display;
            }
        })?;

        match evaluation.verdict {
            Verdict::Pass => {
                let moved = self.move_ticket(key, &self.transitions.done_priority)?;
                let result = if moved { StepResult::Success } else { StepResult::Cancelled };
                self.record(key, steps::TRANSITION, result, |_| {})?;
                trail.advance(PipelineState::Transitioned)?;
            }
            Verdict::Pending => {
                trail.advance(PipelineState::Pending)?;
            }
            Verdict::Fail => {
                let material = format!(
                    "verify:{}:{}",
                    evaluation.reason,
                    evaluation.report_hash.as_deref().unwrap_or("")
                );
                let fingerprint = sha256_hex(material.as_bytes())[..16].to_string();
                self.record(key, steps::ESCALATE, StepResult::Failed, |entry| {
                    entry.last_error_fingerprint = Some(fingerprint.clone());
                })?;
                trail.advance(PipelineState::Escalated)?;
                let mut artifacts = Vec::new();
                if let Some(report) = &evaluation.report {
                    artifacts.push(paths.display_relative(report));
                }
                self.escalate(
                    ticket,
                    &evaluation.comment_body(key),
                    &fingerprint,
                    artifacts,
                )?;
            }
        }
        Ok(())
    }

    fn agent_failed(
        &self,
        ticket: &Ticket,
        trail: &mut StateTrail,
        step: &str,
        invocation: &InvocationOutcome,
    ) -> Result<()> {
        let key = &ticket.key;
        let class = invocation
            .failure_class()
            .cloned()
            .unwrap_or(FailureClass::Unclassified);
        let fingerprint = invocation
            .failure_fingerprint()
            .unwrap_or_else(|| failure_fingerprint(&class, ""));
        self.record(key, step, invocation.step_result(), |entry| {
            entry.last_error_fingerprint = Some(fingerprint.clone());
        })?;
        let artifacts = self.artifacts(invocation);
        let attempts = invocation.attempts.len();

        if let FailureClass::Fatal { signature } = &class {
            trail.advance(PipelineState::Blocked)?;
            self.log(
                roles::ENGINE,
                &format!("{key}: fatal agent failure `{signature}`; blocking"),
            );
            let blocked = [self.transitions.blocked.clone()];
            self.move_ticket(key, &blocked)?;
            self.record(key, steps::BLOCK, StepResult::Failed, |_| {})?;
            self.escalate(
                ticket,
                &format!("fatal agent failure in {step}: {signature}"),
                &fingerprint,
                artifacts,
            )?;
            return Ok(());
        }

        trail.advance(PipelineState::Escalated)?;
        self.record(key, steps::ESCALATE, StepResult::Failed, |_| {})?;
        let timed_out = invocation.last().is_some_and(|a| a.timed_out);
        self.escalate(
            ticket,
            &format!(
                "agent {step} failed after {attempts} attempt(s) ({}{})",
                class.label(),
                if timed_out { ", timed out" } else { "" }
            ),
            &fingerprint,
            artifacts,
        )
    }

    fn artifacts(&self, invocation: &InvocationOutcome) -> Vec<String> {
        invocation
            .artifacts()
            .iter()
            .map(|p| self.orchestrator.paths.display_relative(p))
            .collect()
    }

    /// Apply the first available transition from `wanted`. Returns false when
    /// none matched.
    fn move_ticket(&self, key: &str, wanted: &[String]) -> Result<bool> {
        let options = self.tracker.list_transitions(key)?;
        let Some(choice) = options.choose(wanted) else {
            let offered = options.names();
            self.log(
                roles::ENGINE,
                &format!(
                    "{key}: none of [{}] offered (available: [{}]); manual move required",
                    wanted.join(", "),
                    offered.join(", ")
                ),
            );
            return Ok(false);
        };
        self.tracker.transition(key, &choice.id)?;
        self.log(roles::ENGINE, &format!("{key}: moved via `{}`", choice.name));
        Ok(true)
    }

    fn escalate(
        &self,
        ticket: &Ticket,
        reason: &str,
        fingerprint: &str,
        artifacts: Vec<String>,
    ) -> Result<()> {
        let record = new_record(
            self.escalations.redactor,
            &ticket.key,
            reason,
            fingerprint,
            artifacts,
            Utc::now(),
        );
        let status = self.escalations.escalate(record)?;
        self.log(
            roles::ESCALATE,
            &format!("{}: escalation {status:?} ({fingerprint})", ticket.key),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::backoff::BackoffGate;
    use crate::core::classifier::FailurePatterns;
    use crate::core::redact::Redactor;
    use crate::io::config::{AgentConfig, FailureConfig};
    use crate::io::escalations::EscalationStore;
    use crate::orchestrator::TimeoutPolicy;
    use crate::test_support::{
        MemoryTracker, RecordingNotifier, ScriptedGuardRunner, ScriptedRun, ScriptedSpawner,
        TEST_RUN_ID, TestRepo, passing_report, ticket,
    };

    const TRANSITIONS: &[(&str, &str, &str)] = &[
        ("11", "Start", "In Progress"),
        ("31", "Done", "Done"),
        ("41", "Blocked", "Blocked"),
    ];

    struct Fixture {
        repo: TestRepo,
        config: AgentConfig,
        patterns: FailurePatterns,
        timeouts: TimeoutPolicy,
        prompts: PromptBuilder,
        guardrails_config: GuardrailsConfig,
        transitions: TransitionConfig,
        redactor: Redactor,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                repo: TestRepo::new().expect("repo"),
                config: AgentConfig {
                    retry_delays_secs: vec![0],
                    poll_millis: 10,
                    ..AgentConfig::default()
                },
                patterns: FailureConfig::default().patterns(),
                timeouts: TimeoutPolicy {
                    flag_secs: Some(5),
                    env_value: None,
                },
                prompts: PromptBuilder::default(),
                guardrails_config: GuardrailsConfig::default(),
                transitions: TransitionConfig::default(),
                redactor: Redactor::new([("API_TOKEN", "tok-123456".to_string())], &[])
                    .expect("redactor"),
            }
        }

        fn work_ledger(&self) -> WorkLedger {
            WorkLedger::new(&self.repo.paths().work_ledger_path)
        }

        fn process(
            &self,
            spawner: &ScriptedSpawner,
            tracker: &MemoryTracker,
            guards: &ScriptedGuardRunner,
            notifier: &RecordingNotifier,
            ticket: &Ticket,
        ) -> TicketOutcome {
            let paths = self.repo.paths();
            let logger = self.repo.logger(self.redactor.clone()).expect("logger");
            let orchestrator = Orchestrator {
                spawner,
                config: &self.config,
                patterns: &self.patterns,
                paths,
                logger: &logger,
                run_id: TEST_RUN_ID,
                timeouts: &self.timeouts,
                lock: None,
            };
            let work_ledger = self.work_ledger();
            let guardrails = GuardrailsLedger::new(&paths.guardrails_ledger_path);
            let verifier = Verifier {
                paths,
                guardrails: &guardrails,
                gate: BackoffGate::default(),
            };
            let store = EscalationStore::new(&paths.escalations_path);
            let escalations = EscalationNotifier {
                store: &store,
                notifier,
                redactor: &self.redactor,
            };
            let git = Git::new(&paths.root);
            Pipeline {
                orchestrator: &orchestrator,
                tracker,
                prompts: &self.prompts,
                guards,
                guardrails_config: &self.guardrails_config,
                transitions: &self.transitions,
                work_ledger: &work_ledger,
                guardrails: &guardrails,
                verifier: &verifier,
                escalations: &escalations,
                git: &git,
            }
            .process_ticket(ticket)
            .expect("process")
        }
    }

    #[test]
    fn story_with_evidence_and_green_guardrails_is_transitioned() {
        let fixture = Fixture::new();
        let story = ticket("ABC-1", "Story", "Add export");
        let tracker = MemoryTracker::new(vec![story.clone()]).with_transitions(TRANSITIONS);
        let spawner = ScriptedSpawner::new(vec![
            ScriptedRun::exit(0, &["implemented"]).writing(
                fixture.repo.paths().canonical_report("ABC-1"),
                passing_report("ABC-1"),
            ),
        ]);
        let guards = ScriptedGuardRunner::new(vec![GuardOutcome::Pass]);
        let notifier = RecordingNotifier::default();

        let outcome = fixture.process(&spawner, &tracker, &guards, &notifier, &story);

        assert_eq!(outcome.final_state(), PipelineState::Transitioned);
        assert_eq!(tracker.status_of("ABC-1").as_deref(), Some("Done"));
        assert_eq!(guards.run_count(), 1);
        assert!(notifier.sent().is_empty());
        let entry = fixture.work_ledger().get("ABC-1").expect("get").expect("entry");
        assert_eq!(entry.last_step, steps::TRANSITION);
        assert_eq!(
            entry.verification_report_path.as_deref(),
            Some("reports/ABC-1-verification.md")
        );
    }

    #[test]
    fn fatal_failure_blocks_after_one_attempt() {
        let fixture = Fixture::new();
        let story = ticket("ABC-2", "Bug", "Fix crash");
        let tracker = MemoryTracker::new(vec![story.clone()]).with_transitions(TRANSITIONS);
        let spawner = ScriptedSpawner::new(vec![ScriptedRun::exit(
            1,
            &["ReferenceError: issueKey is not defined"],
        )]);
        let guards = ScriptedGuardRunner::new(Vec::new());
        let notifier = RecordingNotifier::default();

        let outcome = fixture.process(&spawner, &tracker, &guards, &notifier, &story);

        assert_eq!(outcome.final_state(), PipelineState::Blocked);
        assert!(outcome.needs_attention());
        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(guards.run_count(), 0);
        assert_eq!(tracker.status_of("ABC-2").as_deref(), Some("Blocked"));
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.contains("ABC-2"));
        assert!(sent[0].1.contains("ReferenceError"));
        let entry = fixture.work_ledger().get("ABC-2").expect("get").expect("entry");
        assert_eq!(entry.last_step, steps::BLOCK);
        assert!(entry.last_error_fingerprint.is_some());
    }

    #[test]
    fn red_guardrails_escalate_with_a_tracker_comment() {
        let fixture = Fixture::new();
        let story = ticket("ABC-3", "Story", "Add import");
        let tracker = MemoryTracker::new(vec![story.clone()]).with_transitions(TRANSITIONS);
        let spawner = ScriptedSpawner::new(vec![
            ScriptedRun::exit(0, &["done"]).writing(
                fixture.repo.paths().canonical_report("ABC-3"),
                passing_report("ABC-3"),
            ),
        ]);
        let guards = ScriptedGuardRunner::new(vec![GuardOutcome::Fail]);
        let notifier = RecordingNotifier::default();

        let outcome = fixture.process(&spawner, &tracker, &guards, &notifier, &story);

        assert_eq!(outcome.final_state(), PipelineState::Escalated);
        assert_eq!(tracker.status_of("ABC-3").as_deref(), Some("In Progress"));
        assert_eq!(tracker.comments().len(), 1);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[test]
    fn implementation_without_a_report_waits_instead_of_escalating() {
        let fixture = Fixture::new();
        let story = ticket("ABC-8", "Story", "Quiet agent");
        let tracker = MemoryTracker::new(vec![story.clone()]).with_transitions(TRANSITIONS);
        let spawner = ScriptedSpawner::new(vec![ScriptedRun::exit(0, &["implemented"])]);
        let guards = ScriptedGuardRunner::new(vec![GuardOutcome::Pass]);
        let notifier = RecordingNotifier::default();

        let outcome = fixture.process(&spawner, &tracker, &guards, &notifier, &story);

        assert_eq!(
            outcome.trail.states(),
            &[
                PipelineState::New,
                PipelineState::Classified,
                PipelineState::Implementing,
                PipelineState::Verifying,
                PipelineState::Pending,
            ]
        );
        assert!(!outcome.needs_attention());
        assert!(notifier.sent().is_empty());
        assert_eq!(tracker.status_of("ABC-8").as_deref(), Some("In Progress"));
        assert!(fixture.repo.paths().canonical_report("ABC-8").is_file());
        let store = EscalationStore::new(&fixture.repo.paths().escalations_path);
        assert!(store.load().expect("queue").queued.is_empty());
    }

    #[test]
    fn successful_implementation_is_not_repeated() {
        let fixture = Fixture::new();
        fixture
            .work_ledger()
            .upsert("ABC-4", |entry| {
                entry.record_step(steps::IMPLEMENT, StepResult::Success);
            })
            .expect("seed ledger");
        let story = ticket("ABC-4", "Story", "Already built");
        let tracker = MemoryTracker::new(vec![story.clone()]).with_transitions(TRANSITIONS);
        let spawner = ScriptedSpawner::new(Vec::new());
        let guards = ScriptedGuardRunner::new(Vec::new());
        let notifier = RecordingNotifier::default();

        let outcome = fixture.process(&spawner, &tracker, &guards, &notifier, &story);

        assert_eq!(spawner.spawn_count(), 0);
        assert_eq!(outcome.final_state(), PipelineState::Pending);
        assert!(!outcome.needs_attention());
    }

    #[test]
    fn unknown_type_is_skipped_without_spawning() {
        let fixture = Fixture::new();
        let spike = ticket("ABC-5", "Spike", "");
        let tracker = MemoryTracker::new(vec![spike.clone()]);
        let spawner = ScriptedSpawner::new(Vec::new());
        let guards = ScriptedGuardRunner::new(Vec::new());
        let notifier = RecordingNotifier::default();

        let outcome = fixture.process(&spawner, &tracker, &guards, &notifier, &spike);

        assert_eq!(outcome.dispatch, DispatchKind::Unknown);
        assert_eq!(outcome.final_state(), PipelineState::Skipped);
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[test]
    fn epic_is_decomposed_once() {
        let fixture = Fixture::new();
        let epic = ticket("ABC-6", "Epic", "Exports");
        let tracker = MemoryTracker::new(vec![epic.clone()]);
        let guards = ScriptedGuardRunner::new(Vec::new());
        let notifier = RecordingNotifier::default();
        let spawner = ScriptedSpawner::new(vec![ScriptedRun::exit(0, &["planning"]).writing(
            fixture.repo.paths().plan_output("ABC-6"),
            r#"{"children":[{"summary":"CSV export"},{"summary":"JSON export"}]}"#,
        )]);

        let first = fixture.process(&spawner, &tracker, &guards, &notifier, &epic);
        let second = fixture.process(&spawner, &tracker, &guards, &notifier, &epic);

        assert_eq!(first.final_state(), PipelineState::Decomposed);
        assert_eq!(second.final_state(), PipelineState::Decomposed);
        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(tracker.created().len(), 2);
    }

    #[test]
    fn secrets_never_reach_the_run_log() {
        let fixture = Fixture::new();
        let story = ticket("ABC-7", "Story", "");
        let tracker = MemoryTracker::new(vec![story.clone()]).with_transitions(TRANSITIONS);
        let spawner = ScriptedSpawner::new(vec![ScriptedRun::exit(
            0,
            &["using token tok-123456 for upload"],
        )]);
        let guards = ScriptedGuardRunner::new(vec![GuardOutcome::Pass]);
        let notifier = RecordingNotifier::default();

        fixture.process(&spawner, &tracker, &guards, &notifier, &story);

        let log = fixture.repo.read_log().expect("log");
        assert!(log.contains("[REDACTED]"));
        assert!(!log.contains("tok-123456"));
    }
}
