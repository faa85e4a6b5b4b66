//! Idempotent expansion of Epics and Initiatives into child tickets.
//!
//! The manifest at `reports/{EPIC}-decomposition.json` is the idempotency
//! record: it is saved as INCOMPLETE before planning and again after every
//! created child, so a crash between two creations resumes without
//! duplicating the first.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use jsonschema::Draft;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::fingerprint::{description_fingerprint, intent_id_for};
use crate::core::types::{IssueType, Ticket};
use crate::io::evidence::ensure_skeleton;
use crate::io::manifest::{DecompositionManifest, ManifestStatus, ManifestStore};
use crate::io::prompt::{PlanPrompt, PromptBuilder};
use crate::io::run_log::roles;
use crate::io::tracker::{NewChild, Tracker};
use crate::orchestrator::{InvocationOutcome, InvocationRequest, Orchestrator, Phase};

const PLAN_SCHEMA: &str = include_str!("../schemas/plan.schema.json");

/// One child proposed by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlannedChild {
    #[serde(default)]
    pub id: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl PlannedChild {
    /// The planner's id when given, otherwise derived from the summary.
    pub fn intent_id(&self) -> String {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => intent_id_for(&self.summary),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlanDocument {
    children: Vec<PlannedChild>,
}

#[derive(Debug)]
pub enum DecompositionOutcome {
    /// The manifest already covers this description; nothing ran.
    Skipped { children: Vec<String> },
    Decomposed {
        created: Vec<String>,
        reused: Vec<String>,
        invocation: InvocationOutcome,
    },
    /// The planning agent failed.
    AgentFailed(InvocationOutcome),
    /// The planner exited cleanly but its plan is missing or invalid.
    InvalidPlan {
        reason: String,
        invocation: InvocationOutcome,
    },
}

/// Child type created under `parent`.
pub fn child_type_for(parent: &IssueType) -> IssueType {
    match parent {
        IssueType::Initiative | IssueType::Idea => IssueType::Epic,
        _ => IssueType::Story,
    }
}

/// Read and validate a plan written by the planning agent.
pub fn load_plan(path: &Path) -> Result<Vec<PlannedChild>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse plan {}", path.display()))?;
    validate_plan(&value)?;
    let plan: PlanDocument =
        serde_json::from_value(value).with_context(|| format!("decode plan {}", path.display()))?;
    Ok(plan.children)
}

fn validate_plan(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("compile plan schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("plan schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

pub struct Decomposer<'a> {
    pub orchestrator: &'a Orchestrator<'a>,
    pub tracker: &'a dyn Tracker,
    pub prompts: &'a PromptBuilder,
}

impl Decomposer<'_> {
    #[instrument(skip_all, fields(key = %ticket.key))]
    pub fn decompose(&self, ticket: &Ticket) -> Result<DecompositionOutcome> {
        let paths = self.orchestrator.paths;
        let logger = self.orchestrator.logger;
        let key = &ticket.key;
        let fingerprint = description_fingerprint(&ticket.description);
        let store = ManifestStore::new(paths.manifest(key));

        let previous = store.load()?;
        if previous.is_settled_for(&fingerprint) {
            logger.log(
                roles::DECOMPOSE,
                &format!(
                    "{key} already decomposed into {}; skipping",
                    previous.created_keys().join(", ")
                ),
            );
            return Ok(DecompositionOutcome::Skipped {
                children: previous.created_keys(),
            });
        }

        let mut manifest = if previous.exists() {
            if previous.fingerprint != fingerprint {
                logger.log(
                    roles::DECOMPOSE,
                    &format!("{key} description changed since the last plan; re-planning"),
                );
            }
            DecompositionManifest {
                fingerprint: fingerprint.clone(),
                ..previous
            }
        } else {
            DecompositionManifest::new(key, &fingerprint)
        };
        manifest.status = ManifestStatus::Incomplete;
        manifest.updated_at = Some(Utc::now());
        store.save(&manifest)?;

        let child_type = child_type_for(&ticket.issue_type);
        let plan_path = paths.plan_output(key);
        if plan_path.exists() {
            fs::remove_file(&plan_path)
                .with_context(|| format!("remove stale plan {}", plan_path.display()))?;
        }
        let plan_display = paths.display_relative(&plan_path);
        let existing = manifest.children.clone();
        let prompt = |_attempt: u32, _failure: Option<&str>| {
            self.prompts.plan(&PlanPrompt {
                ticket,
                plan_path: &plan_display,
                child_type: child_type.as_str(),
                existing: &existing,
            })
        };
        let invocation = self.orchestrator.invoke(&InvocationRequest {
            ticket,
            phase: Phase::Plan,
            prompt: &prompt,
        })?;
        if !invocation.succeeded() {
            return Ok(DecompositionOutcome::AgentFailed(invocation));
        }

        let planned = match load_plan(&plan_path) {
            Ok(planned) => planned,
            Err(err) => {
                let reason = logger.redactor().redact(&format!("{err:#}"));
                logger.log(roles::DECOMPOSE, &format!("{key}: rejected plan: {reason}"));
                return Ok(DecompositionOutcome::InvalidPlan { reason, invocation });
            }
        };
        logger.log(
            roles::DECOMPOSE,
            &format!("{key}: plan has {} child(ren) of type {child_type}", planned.len()),
        );

        // Every planned intent is on disk before the first creation, so a
        // partially created plan never looks settled.
        let planned_ids: Vec<String> = planned.iter().map(PlannedChild::intent_id).collect();
        manifest
            .children
            .retain(|c| c.key.is_some() || planned_ids.contains(&c.intent_id));
        for (child, intent_id) in planned.iter().zip(&planned_ids) {
            manifest.record_child(intent_id, &child.summary, None);
        }
        manifest.updated_at = Some(Utc::now());
        store.save(&manifest)?;

        let mut created = Vec::new();
        let mut reused = Vec::new();
        for child in &planned {
            let intent_id = child.intent_id();
            if let Some(existing_key) = manifest.key_for(&intent_id) {
                debug!(intent_id, key = existing_key, "reusing child");
                reused.push(existing_key.to_string());
                continue;
            }

            let new_key = self
                .tracker
                .create_child(&NewChild {
                    parent_key: key.clone(),
                    issue_type: child_type.clone(),
                    summary: child.summary.clone(),
                    description: child.description.clone().unwrap_or_default(),
                })
                .with_context(|| format!("create child `{}` under {key}", child.summary))?;
            manifest.record_child(&intent_id, &child.summary, Some(new_key.clone()));
            manifest.refresh_status();
            manifest.updated_at = Some(Utc::now());
            store.save(&manifest)?;
            logger.log(
                roles::DECOMPOSE,
                &format!("{key}: created {child_type} {new_key} ({intent_id})"),
            );

            if child_type == IssueType::Story {
                let report = paths.canonical_report(&new_key);
                if ensure_skeleton(&report, &new_key)? {
                    logger.log(
                        roles::DECOMPOSE,
                        &format!("seeded {}", paths.display_relative(&report)),
                    );
                }
            }
            created.push(new_key);
        }

        manifest.refresh_status();
        manifest.updated_at = Some(Utc::now());
        store.save(&manifest)?;
        logger.log(
            roles::DECOMPOSE,
            &format!(
                "{key}: {} created, {} reused, manifest {:?}",
                created.len(),
                reused.len(),
                manifest.status
            ),
        );
        Ok(DecompositionOutcome::Decomposed {
            created,
            reused,
            invocation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::classifier::FailurePatterns;
    use crate::core::redact::Redactor;
    use crate::io::config::{AgentConfig, FailureConfig};
    use crate::orchestrator::TimeoutPolicy;
    use crate::test_support::{MemoryTracker, ScriptedRun, ScriptedSpawner, TestRepo, ticket};

    const PLAN: &str = r#"{"children":[
        {"id":"csv","summary":"CSV export","description":"Write CSV"},
        {"summary":"JSON export"}
    ]}"#;

    struct Fixture {
        repo: TestRepo,
        config: AgentConfig,
        patterns: FailurePatterns,
        timeouts: TimeoutPolicy,
        prompts: PromptBuilder,
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
            }
        }

        fn run(
            &self,
            spawner: &ScriptedSpawner,
            tracker: &MemoryTracker,
            epic: &Ticket,
        ) -> DecompositionOutcome {
            let logger = self.repo.logger(Redactor::default()).expect("logger");
            let orchestrator = Orchestrator {
                spawner,
                config: &self.config,
                patterns: &self.patterns,
                paths: self.repo.paths(),
                logger: &logger,
                run_id: crate::test_support::TEST_RUN_ID,
                timeouts: &self.timeouts,
                lock: None,
            };
            Decomposer {
                orchestrator: &orchestrator,
                tracker,
                prompts: &self.prompts,
            }
            .decompose(epic)
            .expect("decompose")
        }

        fn planner(&self, epic: &str, plan: &str) -> ScriptedRun {
            ScriptedRun::exit(0, &["planning"]).writing(self.repo.paths().plan_output(epic), plan)
        }
    }

    #[test]
    fn first_run_creates_children_and_skeletons() {
        let fx = Fixture::new();
        let epic = ticket("EP-1", "Epic", "Ship exports");
        let tracker = MemoryTracker::new(vec![epic.clone()]);
        let spawner = ScriptedSpawner::new(vec![fx.planner("EP-1", PLAN)]);

        let outcome = fx.run(&spawner, &tracker, &epic);
        let DecompositionOutcome::Decomposed { created, reused, .. } = outcome else {
            panic!("expected decomposition, got {outcome:?}");
        };
        assert_eq!(created.len(), 2);
        assert!(reused.is_empty());
        assert!(tracker.created().iter().all(|c| c.issue_type == IssueType::Story));

        let manifest = ManifestStore::new(fx.repo.paths().manifest("EP-1"))
            .load()
            .expect("manifest");
        assert_eq!(manifest.status, ManifestStatus::Complete);
        assert_eq!(manifest.children[0].intent_id, "csv");
        assert_eq!(manifest.children[1].intent_id, intent_id_for("JSON export"));
        for key in &created {
            assert!(fx.repo.paths().canonical_report(key).is_file());
        }
    }

    #[test]
    fn second_run_with_same_description_spawns_nothing() {
        let fx = Fixture::new();
        let epic = ticket("EP-1", "Epic", "Ship exports");
        let tracker = MemoryTracker::new(vec![epic.clone()]);
        let spawner = ScriptedSpawner::new(vec![fx.planner("EP-1", PLAN)]);
        fx.run(&spawner, &tracker, &epic);

        let outcome = fx.run(&spawner, &tracker, &epic);
        assert!(matches!(outcome, DecompositionOutcome::Skipped { ref children } if children.len() == 2));
        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(tracker.created().len(), 2);
    }

    #[test]
    fn crash_between_creations_resumes_without_duplicates() {
        let fx = Fixture::new();
        let epic = ticket("EP-1", "Epic", "Ship exports");
        let tracker = MemoryTracker::new(vec![epic.clone()]);
        tracker.fail_creates_after(1);
        let spawner = ScriptedSpawner::new(vec![fx.planner("EP-1", PLAN), fx.planner("EP-1", PLAN)]);

        let logger = fx.repo.logger(Redactor::default()).expect("logger");
        let orchestrator = Orchestrator {
            spawner: &spawner,
            config: &fx.config,
            patterns: &fx.patterns,
            paths: fx.repo.paths(),
            logger: &logger,
            run_id: crate::test_support::TEST_RUN_ID,
            timeouts: &fx.timeouts,
            lock: None,
        };
        let decomposer = Decomposer {
            orchestrator: &orchestrator,
            tracker: &tracker,
            prompts: &fx.prompts,
        };
        assert!(decomposer.decompose(&epic).is_err());
        let partial = ManifestStore::new(fx.repo.paths().manifest("EP-1"))
            .load()
            .expect("manifest");
        assert_eq!(partial.created_keys().len(), 1);

        tracker.allow_creates();
        let outcome = decomposer.decompose(&epic).expect("resume");
        let DecompositionOutcome::Decomposed { created, reused, .. } = outcome else {
            panic!("expected decomposition");
        };
        assert_eq!(created.len(), 1);
        assert_eq!(reused, partial.created_keys());
        assert_eq!(tracker.created().len(), 2);
    }

    #[test]
    fn initiative_children_are_epics_without_skeletons() {
        let fx = Fixture::new();
        let initiative = ticket("IN-1", "Initiative", "Grow");
        let tracker = MemoryTracker::new(vec![initiative.clone()]);
        let spawner = ScriptedSpawner::new(vec![fx.planner(
            "IN-1",
            r#"{"children":[{"summary":"Billing"}]}"#,
        )]);
        let outcome = fx.run(&spawner, &tracker, &initiative);
        let DecompositionOutcome::Decomposed { created, .. } = outcome else {
            panic!("expected decomposition");
        };
        assert_eq!(tracker.created()[0].issue_type, IssueType::Epic);
        assert!(!fx.repo.paths().canonical_report(&created[0]).exists());
    }

    #[test]
    fn invalid_plan_is_rejected_and_manifest_stays_incomplete() {
        let fx = Fixture::new();
        let epic = ticket("EP-2", "Epic", "Ship");
        let tracker = MemoryTracker::new(vec![epic.clone()]);
        let spawner = ScriptedSpawner::new(vec![fx.planner("EP-2", r#"{"children":[]}"#)]);
        let outcome = fx.run(&spawner, &tracker, &epic);
        assert!(matches!(outcome, DecompositionOutcome::InvalidPlan { .. }));
        assert!(tracker.created().is_empty());
        let manifest = ManifestStore::new(fx.repo.paths().manifest("EP-2"))
            .load()
            .expect("manifest");
        assert_eq!(manifest.status, ManifestStatus::Incomplete);
    }

    #[test]
    fn missing_plan_file_is_invalid() {
        let fx = Fixture::new();
        let epic = ticket("EP-3", "Epic", "Ship");
        let tracker = MemoryTracker::new(vec![epic.clone()]);
        let spawner = ScriptedSpawner::new(vec![ScriptedRun::exit(0, &["forgot the plan"])]);
        let outcome = fx.run(&spawner, &tracker, &epic);
        assert!(matches!(outcome, DecompositionOutcome::InvalidPlan { .. }));
    }

    #[test]
    fn changed_description_replans_and_reuses_known_intents() {
        let fx = Fixture::new();
        let mut epic = ticket("EP-1", "Epic", "Ship exports");
        let tracker = MemoryTracker::new(vec![epic.clone()]);
        let spawner = ScriptedSpawner::new(vec![
            fx.planner("EP-1", PLAN),
            fx.planner(
                "EP-1",
                r#"{"children":[{"id":"csv","summary":"CSV export v2"},{"summary":"XML export"}]}"#,
            ),
        ]);
        fx.run(&spawner, &tracker, &epic);
        epic.description = "Ship exports, including XML".to_string();

        let outcome = fx.run(&spawner, &tracker, &epic);
        let DecompositionOutcome::Decomposed { created, reused, .. } = outcome else {
            panic!("expected decomposition");
        };
        assert_eq!(created.len(), 1);
        assert_eq!(reused.len(), 1);
        assert_eq!(tracker.created().len(), 3);
    }

    #[test]
    fn plan_schema_rejects_unknown_fields() {
        let value: Value =
            serde_json::from_str(r#"{"children":[{"summary":"A","priority":1}]}"#).expect("json");
        assert!(validate_plan(&value).is_err());
    }
}
