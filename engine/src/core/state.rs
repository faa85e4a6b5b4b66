//! Per-ticket pipeline states and their legal successors.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    New,
    Classified,
    Decomposed,
    Implementing,
    Verifying,
    /// Verification not yet possible; re-checked on a later run.
    Pending,
    /// Nothing to do this run (unknown type, or verification cooling down).
    Skipped,
    Transitioned,
    Blocked,
    Escalated,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Classified => "CLASSIFIED",
            Self::Decomposed => "DECOMPOSED",
            Self::Implementing => "IMPLEMENTING",
            Self::Verifying => "VERIFYING",
            Self::Pending => "PENDING",
            Self::Skipped => "SKIPPED",
            Self::Transitioned => "TRANSITIONED",
            Self::Blocked => "BLOCKED",
            Self::Escalated => "ESCALATED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Decomposed
                | Self::Pending
                | Self::Skipped
                | Self::Transitioned
                | Self::Blocked
                | Self::Escalated
        )
    }

    /// Terminal states an operator should look at.
    pub fn needs_attention(self) -> bool {
        matches!(self, Self::Blocked | Self::Escalated)
    }

    /// Whether `self -> next` is a legal pipeline move.
    pub fn can_move_to(self, next: PipelineState) -> bool {
        use PipelineState as S;
        matches!(
            (self, next),
            (S::New, S::Classified)
                | (S::Classified, S::Decomposed)
                | (S::Classified, S::Implementing)
                | (S::Classified, S::Verifying)
                | (S::Classified, S::Skipped)
                | (S::Classified, S::Escalated)
                | (S::Classified, S::Blocked)
                | (S::Implementing, S::Verifying)
                | (S::Implementing, S::Blocked)
                | (S::Implementing, S::Escalated)
                | (S::Verifying, S::Transitioned)
                | (S::Verifying, S::Pending)
                | (S::Verifying, S::Skipped)
                | (S::Verifying, S::Escalated)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illegal move attempted by the pipeline; always a bug in sequencing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal pipeline move {from} -> {to}")]
pub struct IllegalMove {
    pub from: PipelineState,
    pub to: PipelineState,
}

/// Tracks one ticket's walk through the pipeline, rejecting illegal moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTrail {
    states: Vec<PipelineState>,
}

impl Default for StateTrail {
    fn default() -> Self {
        Self {
            states: vec![PipelineState::New],
        }
    }
}

impl StateTrail {
    pub fn current(&self) -> PipelineState {
        *self.states.last().unwrap_or(&PipelineState::New)
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<(), IllegalMove> {
        let from = self.current();
        if !from.can_move_to(next) {
            return Err(IllegalMove { from, to: next });
        }
        self.states.push(next);
        Ok(())
    }

    pub fn states(&self) -> &[PipelineState] {
        &self.states
    }

    /// Render as `NEW -> CLASSIFIED -> ...` for logs.
    pub fn render(&self) -> String {
        self.states
            .iter()
            .map(|state| state.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}
