//! Secret scrubbing applied to every line before it leaves the process.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

/// Fixed replacement for every redacted secret.
pub const PLACEHOLDER: &str = "[REDACTED]";

/// Secrets shorter than this are not redacted by value; they would match
/// ordinary text far too often.
const MIN_SECRET_LEN: usize = 4;

/// Built-in patterns. Capture group 1, when present, is preserved in front of
/// the placeholder.
static BUILTIN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)(authorization:\s*)(?:(?:bearer|basic|token)\s+)?[^\s,;"']+"#,
        r#"(?i)((?:api[_-]?key|access[_-]?token|auth[_-]?token|secret|password|passwd)\s*[=:]\s*)["']?[^\s"',;]+"#,
        r"\bsk-[A-Za-z0-9_-]{16,}",
        r"\bghp_[A-Za-z0-9]{20,}",
        r"\bgithub_pat_[A-Za-z0-9_]{20,}",
        r"\bxox[abprs]-[A-Za-z0-9-]{10,}",
        r"\bAKIA[0-9A-Z]{16}\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("builtin redaction pattern should compile"))
    .collect()
});

/// Scrubs known secret values and secret-shaped substrings from text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Literal secret values, longest first so overlapping values redact fully.
    values: Vec<String>,
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Build a redactor from `(name, value)` pairs of secret-bearing
    /// environment variables and extra user patterns.
    pub fn new<I, S>(secret_env: I, extra_patterns: &[String]) -> Result<Self>
    where
        I: IntoIterator<Item = (S, String)>,
        S: AsRef<str>,
    {
        let mut values: Vec<String> = secret_env
            .into_iter()
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| value.len() >= MIN_SECRET_LEN)
            .collect();
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();

        let patterns = extra_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("compile redaction pattern {pattern}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { values, patterns })
    }

    /// Look up the current values of the named environment variables.
    pub fn from_env(names: &[String], extra_patterns: &[String]) -> Result<Self> {
        let pairs = names
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)));
        Self::new(pairs, extra_patterns)
    }

    /// Return `text` with every known secret replaced by [`PLACEHOLDER`].
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), PLACEHOLDER);
            }
        }
        for pattern in BUILTIN_PATTERNS.iter() {
            out = pattern
                .replace_all(&out, |caps: &regex::Captures<'_>| {
                    let keep = caps.get(1).map_or("", |m| m.as_str());
                    format!("{keep}{PLACEHOLDER}")
                })
                .into_owned();
        }
        for pattern in &self.patterns {
            out = pattern.replace_all(&out, PLACEHOLDER).into_owned();
        }
        out
    }
}
