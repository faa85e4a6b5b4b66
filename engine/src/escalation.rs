//! Deduplicated escalation delivery with a persistent retry queue.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{instrument, warn};

use crate::core::redact::Redactor;
use crate::io::escalations::{EscalationRecord, EscalationStore};
use crate::io::notify::Notifier;

/// What happened to one escalation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStatus {
    Delivered,
    /// Transport failed; kept for the next flush.
    Queued,
    /// Same `(issueKey, fingerprint)` already delivered or queued.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub delivered: usize,
    pub remaining: usize,
}

pub struct EscalationNotifier<'a> {
    pub store: &'a EscalationStore,
    pub notifier: &'a dyn Notifier,
    pub redactor: &'a Redactor,
}

/// Build a record with redacted text.
pub fn new_record(
    redactor: &Redactor,
    issue_key: &str,
    reason: &str,
    fingerprint: &str,
    artifacts: Vec<String>,
    now: DateTime<Utc>,
) -> EscalationRecord {
    EscalationRecord {
        issue_key: issue_key.to_string(),
        reason: redactor.redact(reason),
        fingerprint: fingerprint.to_string(),
        created_at: now,
        artifacts,
    }
}

fn subject(record: &EscalationRecord) -> String {
    let first_line = record.reason.lines().next().unwrap_or_default();
    format!("[engine] {} needs attention: {first_line}", record.issue_key)
}

fn body(record: &EscalationRecord) -> String {
    let mut body = format!(
        "Issue: {}\nFingerprint: {}\nCreated: {}\n\n{}\n",
        record.issue_key,
        record.fingerprint,
        record.created_at.to_rfc3339(),
        record.reason
    );
    if !record.artifacts.is_empty() {
        body.push_str("\nArtifacts:\n");
        for artifact in &record.artifacts {
            body.push_str(&format!("- {artifact}\n"));
        }
    }
    body
}

impl EscalationNotifier<'_> {
    fn send(&self, record: &EscalationRecord) -> Result<()> {
        let subject = self.redactor.redact(&subject(record));
        let body = self.redactor.redact(&body(record));
        self.notifier.send(&subject, &body)
    }

    #[instrument(skip_all, fields(key = %record.issue_key, fingerprint = %record.fingerprint))]
    pub fn escalate(&self, record: EscalationRecord) -> Result<EscalationStatus> {
        let queue = self.store.load()?;
        if queue.contains(&record.issue_key, &record.fingerprint) {
            return Ok(EscalationStatus::Duplicate);
        }
        let status = match self.send(&record) {
            Ok(()) => EscalationStatus::Delivered,
            Err(err) => {
                warn!(err = %err, "escalation delivery failed; queued");
                EscalationStatus::Queued
            }
        };
        self.store.update(|queue| {
            queue.prune_delivered(Utc::now());
            match status {
                EscalationStatus::Delivered => queue.delivered.push(record),
                _ => queue.queued.push(record),
            }
        })?;
        Ok(status)
    }

    /// Re-send every queued record; delivered ones move to the delivered list.
    #[instrument(skip_all)]
    pub fn flush(&self) -> Result<FlushSummary> {
        let queue = self.store.load()?;
        if queue.queued.is_empty() {
            return Ok(FlushSummary::default());
        }
        let mut sent = Vec::new();
        for record in &queue.queued {
            match self.send(record) {
                Ok(()) => sent.push((record.issue_key.clone(), record.fingerprint.clone())),
                Err(err) => warn!(key = %record.issue_key, err = %err, "escalation still undeliverable"),
            }
        }
        self.store.update(|queue| {
            let (delivered, remaining): (Vec<_>, Vec<_>) =
                std::mem::take(&mut queue.queued).into_iter().partition(|r| {
                    sent.iter()
                        .any(|(key, fingerprint)| r.same_incident(key, fingerprint))
                });
            queue.delivered.extend(delivered);
            queue.queued = remaining;
            queue.prune_delivered(Utc::now());
            FlushSummary {
                delivered: sent.len(),
                remaining: queue.queued.len(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingNotifier;

    fn setup() -> (tempfile::TempDir, EscalationStore, Redactor) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = EscalationStore::new(temp.path().join("escalations.json"));
        let redactor =
            Redactor::new([("SMTP_PASSWORD", "mail-pass-123".to_string())], &[]).expect("redactor");
        (temp, store, redactor)
    }

    fn record(redactor: &Redactor, key: &str, fingerprint: &str) -> EscalationRecord {
        new_record(
            redactor,
            key,
            "fatal agent failure (mail-pass-123 leaked)",
            fingerprint,
            vec![format!("reports/{key}-20260101-000000Z-attempt1.txt")],
            Utc::now(),
        )
    }

    #[test]
    fn same_incident_is_sent_once() {
        let (_temp, store, redactor) = setup();
        let notifier = RecordingNotifier::default();
        let escalations = EscalationNotifier {
            store: &store,
            notifier: &notifier,
            redactor: &redactor,
        };
        assert_eq!(
            escalations.escalate(record(&redactor, "A-1", "f1")).expect("escalate"),
            EscalationStatus::Delivered
        );
        assert_eq!(
            escalations.escalate(record(&redactor, "A-1", "f1")).expect("escalate"),
            EscalationStatus::Duplicate
        );
        assert_eq!(
            escalations.escalate(record(&redactor, "A-1", "f2")).expect("escalate"),
            EscalationStatus::Delivered
        );
        assert_eq!(notifier.sent().len(), 2);
    }

    #[test]
    fn body_is_redacted_and_references_artifacts() {
        let (_temp, store, redactor) = setup();
        let notifier = RecordingNotifier::default();
        EscalationNotifier {
            store: &store,
            notifier: &notifier,
            redactor: &redactor,
        }
        .escalate(record(&redactor, "A-1", "f1"))
        .expect("escalate");
        let (subject, body) = notifier.sent().remove(0);
        assert!(subject.contains("A-1"));
        assert!(!body.contains("mail-pass-123"));
        assert!(body.contains("reports/A-1-20260101-000000Z-attempt1.txt"));
    }

    #[test]
    fn failed_delivery_is_queued_then_flushed() {
        let (_temp, store, redactor) = setup();
        let notifier = RecordingNotifier::failing();
        let escalations = EscalationNotifier {
            store: &store,
            notifier: &notifier,
            redactor: &redactor,
        };
        assert_eq!(
            escalations.escalate(record(&redactor, "A-1", "f1")).expect("escalate"),
            EscalationStatus::Queued
        );
        assert_eq!(
            escalations.escalate(record(&redactor, "A-1", "f1")).expect("escalate"),
            EscalationStatus::Duplicate
        );
        let summary = escalations.flush().expect("flush");
        assert_eq!(summary, FlushSummary { delivered: 0, remaining: 1 });

        notifier.set_failing(false);
        let summary = escalations.flush().expect("flush");
        assert_eq!(summary, FlushSummary { delivered: 1, remaining: 0 });
        let queue = store.load().expect("load");
        assert!(queue.queued.is_empty());
        assert_eq!(queue.delivered.len(), 1);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[test]
    fn incidents_past_retention_can_escalate_again() {
        let (_temp, store, redactor) = setup();
        let mut stale = record(&redactor, "A-1", "f1");
        stale.created_at =
            Utc::now() - chrono::Duration::days(crate::io::escalations::DELIVERED_RETENTION_DAYS + 5);
        store
            .update(|queue| queue.delivered.push(stale))
            .expect("seed");
        let notifier = RecordingNotifier::default();
        let escalations = EscalationNotifier {
            store: &store,
            notifier: &notifier,
            redactor: &redactor,
        };

        assert_eq!(
            escalations.escalate(record(&redactor, "A-1", "f1")).expect("escalate"),
            EscalationStatus::Delivered
        );
        let queue = store.load().expect("load");
        assert_eq!(queue.delivered.len(), 1);
        assert!(queue.delivered[0].created_at > Utc::now() - chrono::Duration::days(1));
    }
}
