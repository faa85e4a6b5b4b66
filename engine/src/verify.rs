//! Tri-state verification of a ticket's evidence.
//!
//! PASS needs both a passing guardrails entry and a report whose checklist is
//! complete. Missing inputs are PENDING, never PASS and never FAIL, so a
//! ticket that has not been implemented yet is simply re-checked later. A
//! report whose checklist has no items yet counts as missing.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::core::backoff::{BackoffGate, GateDecision, VerifyHistory};
use crate::core::checklist::{ChecklistStatus, check_checklist, missing_headings};
use crate::core::types::{Ticket, Verdict};
use crate::io::evidence::{EvidenceResolution, report_hash, resolve_evidence};
use crate::io::guardrails::GuardrailsLedger;
use crate::io::paths::EnginePaths;
use crate::io::run_log::{RunLogger, roles};
use crate::io::tracker::Tracker;

/// Outcome of judging the evidence once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Short reason; also the comment dedup key.
    pub reason: String,
    /// What to fix, for non-PASS verdicts.
    pub remediation: Option<String>,
    pub report: Option<PathBuf>,
    pub report_hash: Option<String>,
}

impl Evaluation {
    /// Tracker comment body for a non-PASS verdict.
    pub fn comment_body(&self, key: &str) -> String {
        let mut body = format!("Verification {} for {key}: {}", self.verdict.as_str(), self.reason);
        if let Some(remediation) = &self.remediation {
            body.push_str("\n\n");
            body.push_str(remediation);
        }
        body
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyDecision {
    /// Evidence unchanged and the cooldown has not elapsed.
    CoolingDown { until: DateTime<Utc> },
    Evaluated {
        evaluation: Evaluation,
        /// History to store on the work ledger entry.
        history: VerifyHistory,
        commented: bool,
    },
}

pub struct Verifier<'a> {
    pub paths: &'a EnginePaths,
    pub guardrails: &'a GuardrailsLedger,
    pub gate: BackoffGate,
}

impl Verifier<'_> {
    /// Judge the current evidence for `key` without side effects.
    pub fn evaluate(&self, key: &str) -> Result<Evaluation> {
        let evidence = resolve_evidence(&self.paths.reports_dir, key)?;
        let hash = selected_hash(&evidence)?;
        self.evaluate_with(key, &evidence, hash)
    }

    fn evaluate_with(
        &self,
        key: &str,
        evidence: &EvidenceResolution,
        hash: Option<String>,
    ) -> Result<Evaluation> {
        let pending = |reason: String| Evaluation {
            verdict: Verdict::Pending,
            remediation: Some(self.remediation(key, evidence)),
            reason,
            report: evidence.selected.clone(),
            report_hash: hash.clone(),
        };

        let Some(entry) = self.guardrails.get(key)? else {
            return Ok(pending("no guardrails result recorded yet".to_string()));
        };
        if !entry.guardrails_passed {
            return Ok(Evaluation {
                verdict: Verdict::Fail,
                reason: format!("guardrails failed in run {}", entry.run_id),
                remediation: Some(format!(
                    "Fix the guardrail failures (see {}) and re-run the implementation.",
                    self.paths
                        .display_relative(&self.paths.guardrail_log(key, &entry.run_id))
                )),
                report: evidence.selected.clone(),
                report_hash: hash,
            });
        }

        let Some(report) = &evidence.selected else {
            return Ok(pending("no verification report found".to_string()));
        };
        let markdown = fs::read_to_string(report)
            .with_context(|| format!("read report {}", report.display()))?;
        let status = check_checklist(&markdown);
        // Nothing filled in yet, e.g. the seeded skeleton.
        if status == ChecklistStatus::Empty {
            return Ok(Evaluation {
                report: Some(report.clone()),
                ..pending(status.describe())
            });
        }
        if let ChecklistStatus::Complete { items } = status {
            let missing = missing_headings(&markdown);
            if !missing.is_empty() {
                debug!(key, ?missing, "report lacks optional headings");
            }
            return Ok(Evaluation {
                verdict: Verdict::Pass,
                reason: format!("checklist complete ({items} items)"),
                remediation: None,
                report: Some(report.clone()),
                report_hash: hash,
            });
        }
        Ok(Evaluation {
            verdict: Verdict::Fail,
            reason: status.describe(),
            remediation: Some(self.remediation(key, evidence)),
            report: Some(report.clone()),
            report_hash: hash,
        })
    }

    fn remediation(&self, key: &str, evidence: &EvidenceResolution) -> String {
        let canonical = self.paths.display_relative(&self.paths.canonical_report(key));
        let mut text = format!(
            "Expected a report at `{canonical}` (or `reports/{key}-YYYYMMDD-HHMMSSZ-verification.md`) \
             with a `## Checklist` section in which every item is checked."
        );
        if let Some(selected) = &evidence.selected {
            text.push_str(&format!(
                "\nJudged report: `{}`.",
                self.paths.display_relative(selected)
            ));
        }
        if !evidence.near_matches.is_empty() {
            let names: Vec<String> = evidence
                .near_matches
                .iter()
                .map(|p| format!("`{}`", self.paths.display_relative(p)))
                .collect();
            text.push_str(&format!(
                "\nThese files mention {key} but do not follow the naming convention and were ignored: {}.",
                names.join(", ")
            ));
        }
        text
    }

    /// Gate, evaluate, and comment on a non-PASS verdict unless the same
    /// comment was already posted for the same evidence.
    #[instrument(skip_all, fields(key = %ticket.key))]
    pub fn verify(
        &self,
        ticket: &Ticket,
        history: &VerifyHistory,
        tracker: &dyn Tracker,
        logger: &RunLogger,
        now: DateTime<Utc>,
    ) -> Result<VerifyDecision> {
        let key = &ticket.key;
        let evidence = resolve_evidence(&self.paths.reports_dir, key)?;
        let hash = selected_hash(&evidence)?;

        if let GateDecision::Skip { until } = self.gate.should_verify(history, hash.as_deref(), now)
        {
            logger.log(
                roles::VERIFY,
                &format!(
                    "{key}: evidence unchanged, next verification after {}",
                    until.to_rfc3339()
                ),
            );
            return Ok(VerifyDecision::CoolingDown { until });
        }

        let evaluation = self.evaluate_with(key, &evidence, hash)?;
        logger.log(
            roles::VERIFY,
            &format!("{key}: {} ({})", evaluation.verdict.as_str(), evaluation.reason),
        );

        let mut commented = false;
        if evaluation.verdict != Verdict::Pass
            && self.gate.should_comment(
                history,
                &evaluation.reason,
                evaluation.report_hash.as_deref(),
            )
        {
            let body = logger.redactor().redact(&evaluation.comment_body(key));
            match tracker.post_comment(key, &body) {
                Ok(_) => commented = true,
                Err(err) => {
                    warn!(key, err = %err, "failed to post verification comment");
                    logger.log(
                        roles::VERIFY,
                        &format!("{key}: could not post comment: {err:#}"),
                    );
                }
            }
        }

        let history = self.gate.record(
            evaluation.verdict,
            &evaluation.reason,
            evaluation.report_hash.as_deref(),
            now,
        );
        Ok(VerifyDecision::Evaluated {
            evaluation,
            history,
            commented,
        })
    }
}

fn selected_hash(evidence: &EvidenceResolution) -> Result<Option<String>> {
    evidence.selected.as_deref().map(report_hash).transpose()
}
