//! Re-verification cooldown and comment de-duplication.

use chrono::{DateTime, Duration, Utc};

use crate::core::types::Verdict;

/// Default cooldown after a non-passing verification.
pub const DEFAULT_COOLDOWN_SECS: i64 = 10 * 60;

/// Verification history carried in the work ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyHistory {
    pub next_at: Option<DateTime<Utc>>,
    pub last_reason: Option<String>,
    pub last_report_hash: Option<String>,
}

/// Whether a verification attempt may run now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Skip { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffGate {
    cooldown: Duration,
}

impl Default for BackoffGate {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_COOLDOWN_SECS))
    }
}

impl BackoffGate {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    /// Skip while the cooldown is running and the evidence is unchanged.
    ///
    /// Any change in the artifact hash, including the artifact appearing or
    /// disappearing, proceeds immediately.
    pub fn should_verify(
        &self,
        history: &VerifyHistory,
        current_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> GateDecision {
        let Some(next_at) = history.next_at else {
            return GateDecision::Proceed;
        };
        if now >= next_at {
            return GateDecision::Proceed;
        }
        if history.last_report_hash.as_deref() != current_hash {
            return GateDecision::Proceed;
        }
        GateDecision::Skip { until: next_at }
    }

    /// Suppress a tracker comment identical in `(reason, hash)` to the last one.
    pub fn should_comment(
        &self,
        history: &VerifyHistory,
        reason: &str,
        current_hash: Option<&str>,
    ) -> bool {
        !(history.last_reason.as_deref() == Some(reason)
            && history.last_report_hash.as_deref() == current_hash)
    }

    /// History to persist after a verification with `verdict`.
    pub fn record(
        &self,
        verdict: Verdict,
        reason: &str,
        current_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> VerifyHistory {
        let next_at = match verdict {
            Verdict::Pass => None,
            Verdict::Pending | Verdict::Fail => Some(now + self.cooldown),
        };
        VerifyHistory {
            next_at,
            last_reason: Some(reason.to_string()),
            last_report_hash: current_hash.map(str::to_string),
        }
    }
}
