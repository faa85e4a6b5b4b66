//! Per-ticket commit-eligibility records (`.engineo/state.json`).
//!
//! Written by the implementation step after guardrails run, read by the
//! verification step. A missing entry means "not yet known", never a pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::io::ledger::{DocumentStore, Ledger, LedgerEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailsLedgerEntry {
    pub issue_key: String,
    pub run_id: String,
    pub base_sha: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    pub guardrails_passed: bool,
    pub status: String,
    pub verification_report_path: String,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry for GuardrailsLedgerEntry {
    fn create(key: &str, now: DateTime<Utc>) -> Self {
        Self {
            issue_key: key.to_string(),
            run_id: String::new(),
            base_sha: String::new(),
            changed_files: Vec::new(),
            guardrails_passed: false,
            status: "pending".to_string(),
            verification_report_path: String::new(),
            updated_at: now,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

pub type GuardrailsLedger = DocumentStore<Ledger<GuardrailsLedgerEntry>>;
