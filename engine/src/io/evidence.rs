//! Locating and seeding verification reports under `reports/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tracing::debug;

use crate::core::checklist::REQUIRED_HEADINGS;
use crate::core::fingerprint::sha256_hex;

const REPORT_SUFFIX: &str = "-verification.md";
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%SZ";

/// Result of looking for a ticket's verification report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceResolution {
    /// The report that will be judged, if any.
    pub selected: Option<PathBuf>,
    /// Every file that followed the naming convention for this key.
    pub candidates: Vec<PathBuf>,
    /// Files that mention the key but do not follow the convention.
    pub near_matches: Vec<PathBuf>,
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    stamp: Option<NaiveDateTime>,
    modified: SystemTime,
}

/// Find the report for `key` in `reports_dir`.
///
/// Accepted names are `{KEY}-verification.md` and
/// `{KEY}-{YYYYMMDD-HHMMSSZ}-verification.md`. The newest timestamped name
/// wins; without one the newest file by modification time wins. Names that
/// merely contain the key are returned as near-matches and never selected.
pub fn resolve_evidence(reports_dir: &Path, key: &str) -> Result<EvidenceResolution> {
    if !reports_dir.is_dir() {
        return Ok(EvidenceResolution::default());
    }
    let canonical = format!("{key}{REPORT_SUFFIX}");
    let prefix = format!("{key}-");
    let key_lower = key.to_lowercase();

    let mut candidates = Vec::new();
    let mut near_matches = Vec::new();
    let entries = fs::read_dir(reports_dir)
        .with_context(|| format!("list reports {}", reports_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", reports_dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(REPORT_SUFFIX) {
            continue;
        }

        let stamp = if name == canonical {
            Some(None)
        } else {
            name.strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(REPORT_SUFFIX))
                .and_then(|middle| NaiveDateTime::parse_from_str(middle, TIMESTAMP_FORMAT).ok())
                .map(Some)
        };
        match stamp {
            Some(stamp) => {
                let modified = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                candidates.push(Candidate {
                    path,
                    stamp,
                    modified,
                });
            }
            None if mentions_key(&name.to_lowercase(), &key_lower) => near_matches.push(path),
            None => {}
        }
    }

    let selected = if candidates.iter().any(|c| c.stamp.is_some()) {
        candidates
            .iter()
            .filter(|c| c.stamp.is_some())
            .max_by_key(|c| c.stamp)
    } else {
        candidates.iter().max_by_key(|c| c.modified)
    }
    .map(|c| c.path.clone());

    let mut candidate_paths: Vec<PathBuf> = candidates.into_iter().map(|c| c.path).collect();
    candidate_paths.sort();
    near_matches.sort();
    debug!(
        key,
        selected = ?selected,
        candidates = candidate_paths.len(),
        near_matches = near_matches.len(),
        "resolved evidence"
    );
    Ok(EvidenceResolution {
        selected,
        candidates: candidate_paths,
        near_matches,
    })
}

/// `key` appears in `name` as a whole token, so `abc-1` is not found in
/// `abc-10`.
fn mentions_key(name: &str, key: &str) -> bool {
    let is_token_char = |c: char| c.is_ascii_alphanumeric();
    name.match_indices(key).any(|(at, _)| {
        let before = name[..at].chars().next_back();
        let after = name[at + key.len()..].chars().next();
        !before.is_some_and(is_token_char) && !after.is_some_and(is_token_char)
    })
}

/// Skeleton report with the required headings and an empty checklist.
pub fn skeleton(key: &str) -> String {
    let mut buf = format!("# {key} Verification\n");
    for heading in REQUIRED_HEADINGS {
        buf.push_str(&format!("\n## {heading}\n"));
    }
    buf
}

/// Write the skeleton unless a report already exists. Returns whether a file
/// was created.
pub fn ensure_skeleton(path: &Path, key: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create reports dir {}", parent.display()))?;
    }
    fs::write(path, skeleton(key))
        .with_context(|| format!("write report skeleton {}", path.display()))?;
    debug!(path = %path.display(), "created report skeleton");
    Ok(true)
}

/// SHA-256 of a report's bytes.
pub fn report_hash(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read report {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}
