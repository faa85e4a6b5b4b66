//! Resumable per-ticket execution state (`work_ledger.json`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::backoff::VerifyHistory;
use crate::core::types::{StepResult, Ticket};
use crate::io::ledger::{DocumentStore, Ledger, LedgerEntry};

/// Pipeline step names recorded in `last_step`.
pub mod steps {
    pub const CLASSIFY: &str = "classify";
    pub const DECOMPOSE: &str = "decompose";
    pub const IMPLEMENT: &str = "implement";
    pub const VERIFY: &str = "verify";
    pub const TRANSITION: &str = "transition";
    pub const BLOCK: &str = "block";
    pub const ESCALATE: &str = "escalate";
}

/// One ticket's execution state. Created on first sight, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkLedgerEntry {
    #[serde(rename = "issueKey")]
    pub issue_key: String,
    #[serde(rename = "issueType")]
    pub issue_type: String,
    #[serde(rename = "parentKey")]
    pub parent_key: Option<String>,
    pub status_last_observed: String,
    pub last_step: String,
    pub last_step_result: StepResult,
    /// Set by a successful implement step; later steps never clear it.
    #[serde(default)]
    pub implementation_succeeded: bool,
    #[serde(default)]
    pub last_commit_sha: Option<String>,
    #[serde(default)]
    pub verification_report_path: Option<String>,
    #[serde(default)]
    pub last_error_fingerprint: Option<String>,
    #[serde(default)]
    pub verify_next_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub verify_last_reason: Option<String>,
    #[serde(default)]
    pub verify_last_report_hash: Option<String>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry for WorkLedgerEntry {
    fn create(key: &str, now: DateTime<Utc>) -> Self {
        Self {
            issue_key: key.to_string(),
            issue_type: String::new(),
            parent_key: None,
            status_last_observed: String::new(),
            last_step: "new".to_string(),
            last_step_result: StepResult::Success,
            implementation_succeeded: false,
            last_commit_sha: None,
            verification_report_path: None,
            last_error_fingerprint: None,
            verify_next_at: None,
            verify_last_reason: None,
            verify_last_report_hash: None,
            updated_at: now,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl WorkLedgerEntry {
    /// Refresh the fields mirrored from the tracker.
    pub fn observe(&mut self, ticket: &Ticket) {
        self.issue_type = ticket.issue_type.to_string();
        self.parent_key = ticket.parent_key.clone();
        self.status_last_observed = ticket.status.clone();
    }

    pub fn record_step(&mut self, step: &str, result: StepResult) {
        if step == steps::IMPLEMENT {
            self.implementation_succeeded = result == StepResult::Success;
        }
        self.last_step = step.to_string();
        self.last_step_result = result;
    }

    /// True once implementation succeeded; a resumed run skips straight to
    /// verification.
    pub fn implementation_done(&self) -> bool {
        self.implementation_succeeded
    }

    pub fn verify_history(&self) -> VerifyHistory {
        VerifyHistory {
            next_at: self.verify_next_at,
            last_reason: self.verify_last_reason.clone(),
            last_report_hash: self.verify_last_report_hash.clone(),
        }
    }

    pub fn set_verify_history(&mut self, history: VerifyHistory) {
        self.verify_next_at = history.next_at;
        self.verify_last_reason = history.last_reason;
        self.verify_last_report_hash = history.last_report_hash;
    }
}

pub type WorkLedger = DocumentStore<Ledger<WorkLedgerEntry>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IssueType;
    use chrono::TimeZone;

    fn ticket() -> Ticket {
        Ticket {
            key: "ABC-1".to_string(),
            issue_type: IssueType::Story,
            status: "In Progress".to_string(),
            summary: "Do it".to_string(),
            description: String::new(),
            parent_key: Some("EP-1".to_string()),
        }
    }

    #[test]
    fn entry_serializes_with_mixed_case_field_names() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut entry = WorkLedgerEntry::create("ABC-1", now);
        entry.observe(&ticket());
        entry.record_step(steps::IMPLEMENT, StepResult::TimedOut);
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["issueKey"], "ABC-1");
        assert_eq!(value["issueType"], "Story");
        assert_eq!(value["parentKey"], "EP-1");
        assert_eq!(value["last_step_result"], "timed_out");
        assert_eq!(value["status_last_observed"], "In Progress");
        assert!(value["updatedAt"].is_string());
    }

    #[test]
    fn implementation_done_only_after_success_or_later_steps() {
        let now = Utc::now();
        let mut entry = WorkLedgerEntry::create("ABC-1", now);
        assert!(!entry.implementation_done());
        entry.record_step(steps::IMPLEMENT, StepResult::Failed);
        assert!(!entry.implementation_done());
        entry.record_step(steps::IMPLEMENT, StepResult::Success);
        assert!(entry.implementation_done());
        entry.record_step(steps::VERIFY, StepResult::Failed);
        assert!(entry.implementation_done());
    }

    #[test]
    fn classifying_again_keeps_the_finished_implementation() {
        let mut entry = WorkLedgerEntry::create("ABC-1", Utc::now());
        entry.record_step(steps::IMPLEMENT, StepResult::Success);
        entry.record_step(steps::CLASSIFY, StepResult::Success);
        entry.record_step(steps::ESCALATE, StepResult::Failed);
        entry.record_step(steps::CLASSIFY, StepResult::Success);
        assert!(entry.implementation_done());
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["implementation_succeeded"], true);
    }

    #[test]
    fn store_upsert_round_trips_through_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = WorkLedger::new(temp.path().join("work_ledger.json"));
        ledger
            .upsert("ABC-1", |entry| {
                entry.observe(&ticket());
                entry.record_step(steps::CLASSIFY, StepResult::Success);
            })
            .expect("upsert");
        let loaded = ledger.get("ABC-1").expect("get").expect("entry");
        assert_eq!(loaded.last_step, "classify");
        assert_eq!(loaded.parent_key.as_deref(), Some("EP-1"));
    }
}
