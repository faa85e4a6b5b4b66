//! Ticket type to pipeline kind mapping.

use crate::core::types::DispatchKind;

/// Map a raw tracker type name to the pipeline that handles it.
///
/// Matching ignores surrounding whitespace and case.
pub fn resolve_dispatch(issue_type: &str) -> DispatchKind {
    match issue_type.trim().to_lowercase().as_str() {
        "story" | "bug" => DispatchKind::Implement,
        "epic" => DispatchKind::Epic,
        "initiative" | "idea" => DispatchKind::Initiative,
        _ => DispatchKind::Unknown,
    }
}
