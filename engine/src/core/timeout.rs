//! Agent timeout resolution.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;

/// Description marker, e.g. `agent-timeout: 2h` or `agent_timeout=5400`.
static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bagent[-_ ]timeout\s*[:=]\s*(\d+)\s*([smh])?\b")
        .expect("timeout marker regex should compile")
});

/// Where the effective timeout came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSource {
    Flag,
    Env,
    Marker,
    Default,
}

/// Inputs for [`resolve_timeout`], highest priority first.
#[derive(Debug, Clone, Default)]
pub struct TimeoutInputs<'a> {
    pub flag_secs: Option<u64>,
    /// Raw environment variable value; unparseable values are ignored.
    pub env_value: Option<&'a str>,
    pub description: Option<&'a str>,
}

/// Resolve the agent hard timeout.
///
/// Priority: CLI flag, then environment, then description marker, then
/// `default`. The result is capped at `max` and never zero.
pub fn resolve_timeout(
    inputs: &TimeoutInputs<'_>,
    default: Duration,
    max: Duration,
) -> (Duration, TimeoutSource) {
    let env_secs = inputs
        .env_value
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0);
    let (chosen, source) = if let Some(secs) = inputs.flag_secs.filter(|secs| *secs > 0) {
        (Duration::from_secs(secs), TimeoutSource::Flag)
    } else if let Some(secs) = env_secs {
        (Duration::from_secs(secs), TimeoutSource::Env)
    } else if let Some(marker) = inputs.description.and_then(parse_marker) {
        (marker, TimeoutSource::Marker)
    } else {
        (default, TimeoutSource::Default)
    };
    (chosen.min(max), source)
}

/// Parse a timeout marker from a ticket description.
pub fn parse_marker(description: &str) -> Option<Duration> {
    let caps = MARKER_RE.captures(description)?;
    let value: u64 = caps.get(1)?.as_str().parse().ok()?;
    if value == 0 {
        return None;
    }
    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(unit) if unit == "h" => 3600,
        Some(unit) if unit == "m" => 60,
        _ => 1,
    };
    Some(Duration::from_secs(value.saturating_mul(multiplier)))
}

/// Hard deadline of one agent attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptClock {
    started: Instant,
    timeout: Duration,
}

impl AttemptClock {
    pub fn start(timeout: Duration) -> Self {
        Self::starting_at(Instant::now(), timeout)
    }

    pub fn starting_at(started: Instant, timeout: Duration) -> Self {
        Self { started, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left; `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.started);
        self.timeout.checked_sub(elapsed).filter(|left| !left.is_zero())
    }
}
