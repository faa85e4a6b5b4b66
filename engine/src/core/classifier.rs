//! Deterministic classification of failed agent attempts.

use crate::core::types::FailureClass;

/// Substring lists used to classify attempt output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePatterns {
    /// Matched case-insensitively.
    pub transient: Vec<String>,
    /// Matched case-sensitively; these are exact error signatures.
    pub fatal: Vec<String>,
}

/// Classify a non-zero exit or timeout from the attempt's (redacted) output.
///
/// - `Fatal` if any fatal signature occurs. Checked first, so a fatal run is
///   never retried even when it also mentions a transient condition.
/// - `Transient` if any transient substring occurs, or if the attempt timed out.
/// - `Unclassified` otherwise.
pub fn classify_failure(output: &str, timed_out: bool, patterns: &FailurePatterns) -> FailureClass {
    if let Some(signature) = patterns
        .fatal
        .iter()
        .find(|sig| !sig.is_empty() && output.contains(sig.as_str()))
    {
        return FailureClass::Fatal {
            signature: signature.clone(),
        };
    }

    let lowered = output.to_lowercase();
    if let Some(pattern) = patterns
        .transient
        .iter()
        .find(|pat| !pat.is_empty() && lowered.contains(&pat.to_lowercase()))
    {
        return FailureClass::Transient {
            pattern: pattern.clone(),
        };
    }

    if timed_out {
        return FailureClass::Transient {
            pattern: "timeout".to_string(),
        };
    }

    FailureClass::Unclassified
}
