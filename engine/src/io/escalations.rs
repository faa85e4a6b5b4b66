//! Persistent escalation queue (`.engineo/escalations.json`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::io::ledger::DocumentStore;

/// Delivered records are forgotten after this long, so an incident this old
/// may be escalated again.
pub const DELIVERED_RETENTION_DAYS: i64 = 30;

/// A request for human attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRecord {
    pub issue_key: String,
    pub reason: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    /// Repository-relative artifact paths referenced by the notification.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl EscalationRecord {
    pub fn same_incident(&self, issue_key: &str, fingerprint: &str) -> bool {
        self.issue_key == issue_key && self.fingerprint == fingerprint
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationQueue {
    /// Not yet delivered; retried at the start of every run.
    pub queued: Vec<EscalationRecord>,
    pub delivered: Vec<EscalationRecord>,
}

impl EscalationQueue {
    /// True if this incident was already delivered or is waiting for delivery.
    pub fn contains(&self, issue_key: &str, fingerprint: &str) -> bool {
        self.queued
            .iter()
            .chain(self.delivered.iter())
            .any(|r| r.same_incident(issue_key, fingerprint))
    }

    /// Drop delivered records created more than [`DELIVERED_RETENTION_DAYS`]
    /// before `now`. Returns how many were dropped.
    pub fn prune_delivered(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(DELIVERED_RETENTION_DAYS);
        let before = self.delivered.len();
        self.delivered.retain(|record| record.created_at >= cutoff);
        before - self.delivered.len()
    }
}

pub type EscalationStore = DocumentStore<EscalationQueue>;

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, fingerprint: &str) -> EscalationRecord {
        EscalationRecord {
            issue_key: key.to_string(),
            reason: "fatal".to_string(),
            fingerprint: fingerprint.to_string(),
            created_at: Utc::now(),
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn contains_checks_both_lists() {
        let queue = EscalationQueue {
            queued: vec![record("A-1", "f1")],
            delivered: vec![record("A-2", "f2")],
        };
        assert!(queue.contains("A-1", "f1"));
        assert!(queue.contains("A-2", "f2"));
        assert!(!queue.contains("A-1", "f2"));
    }

    #[test]
    fn old_deliveries_are_pruned_but_queued_records_stay() {
        let now = Utc::now();
        let mut old = record("A-1", "f1");
        old.created_at = now - Duration::days(DELIVERED_RETENTION_DAYS + 1);
        let mut old_queued = record("A-3", "f3");
        old_queued.created_at = old.created_at;
        let mut queue = EscalationQueue {
            queued: vec![old_queued],
            delivered: vec![old, record("A-2", "f2")],
        };

        assert_eq!(queue.prune_delivered(now), 1);
        assert!(!queue.contains("A-1", "f1"));
        assert!(queue.contains("A-2", "f2"));
        assert!(queue.contains("A-3", "f3"));
    }

    #[test]
    fn queue_survives_reload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = EscalationStore::new(temp.path().join("escalations.json"));
        store
            .update(|queue| queue.queued.push(record("A-1", "f1")))
            .expect("update");
        let raw = std::fs::read_to_string(store.path()).expect("read");
        assert!(raw.contains("\"issueKey\": \"A-1\""));
        assert!(store.load().expect("load").contains("A-1", "f1"));
    }
}
