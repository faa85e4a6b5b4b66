//! Content hashes used for change detection and deduplication.

use sha2::{Digest, Sha256};

use crate::core::types::FailureClass;

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Normalize free text so cosmetic edits do not change its fingerprint.
///
/// CRLF becomes LF, trailing whitespace is trimmed per line, and the whole
/// text is trimmed.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Fingerprint of an epic description.
pub fn description_fingerprint(description: &str) -> String {
    sha256_hex(normalize_text(description).as_bytes())
}

/// Stable intent id derived from a planned child's summary.
pub fn intent_id_for(summary: &str) -> String {
    let normalized = normalize_text(summary).to_lowercase();
    let digest = sha256_hex(normalized.as_bytes());
    format!("intent-{}", &digest[..12])
}

/// Fingerprint of a failure kind, independent of run-specific noise.
///
/// Two failures of the same class matching the same pattern share a
/// fingerprint. Unclassified failures fold in their last non-empty output
/// line with digits removed, so timestamps and pids do not split them.
pub fn failure_fingerprint(class: &FailureClass, output: &str) -> String {
    let material = match class {
        FailureClass::Fatal { signature } => format!("fatal:{signature}"),
        FailureClass::Transient { pattern } => format!("transient:{}", pattern.to_lowercase()),
        FailureClass::Unclassified => {
            let last = output
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("");
            let stripped: String = last.chars().filter(|c| !c.is_ascii_digit()).collect();
            format!("unclassified:{stripped}")
        }
    };
    sha256_hex(material.as_bytes())[..16].to_string()
}
