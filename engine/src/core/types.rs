//! Shared deterministic types for engine core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ticket type as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum IssueType {
    Epic,
    Initiative,
    Idea,
    Story,
    Bug,
    Other(String),
}

impl IssueType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "epic" => Self::Epic,
            "initiative" => Self::Initiative,
            "idea" => Self::Idea,
            "story" => Self::Story,
            "bug" => Self::Bug,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Epic => "Epic",
            Self::Initiative => "Initiative",
            Self::Idea => "Idea",
            Self::Story => "Story",
            Self::Bug => "Bug",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for IssueType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<IssueType> for String {
    fn from(value: IssueType) -> Self {
        value.as_str().to_string()
    }
}

/// A tracker ticket after normalization.
///
/// Owned by the external tracker; the engine only reads it and requests
/// transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub key: String,
    pub issue_type: IssueType,
    pub status: String,
    pub summary: String,
    pub description: String,
    pub parent_key: Option<String>,
}

/// Execution path chosen for a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    Implement,
    Epic,
    Initiative,
    Unknown,
}

impl DispatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implement => "implement",
            Self::Epic => "epic",
            Self::Initiative => "initiative",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the last pipeline step recorded in the work ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

/// Tri-state verification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// Guardrails passed and the evidence checklist is complete.
    Pass,
    /// Not yet verifiable (missing ledger entry or artifact). Retried later.
    Pending,
    /// Explicitly not passing.
    Fail,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Pending => "PENDING",
            Self::Fail => "FAIL",
        }
    }
}

/// Classification of a failed agent attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "class")]
pub enum FailureClass {
    /// Known-transient failure; eligible for retry.
    Transient { pattern: String },
    /// Known-unrecoverable agent or template failure; never retried.
    Fatal { signature: String },
    /// Anything else; the attempt result is final.
    Unclassified,
}

impl FailureClass {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Fatal { .. } => "fatal",
            Self::Unclassified => "unclassified",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
