//! Prompt rendering for the agent's implement and plan phases.
//!
//! Templates are embedded at compile time and split into marked sections so an
//! oversized ticket can be trimmed without losing the contract.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::types::Ticket;
use crate::io::manifest::ManifestChild;

const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");

/// Default prompt size bound in bytes.
pub const DEFAULT_PROMPT_BUDGET: usize = 48_000;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should compile")
});

/// Inputs for an implementation prompt.
#[derive(Debug, Clone)]
pub struct ImplementPrompt<'a> {
    pub ticket: &'a Ticket,
    /// Repository-relative canonical report path.
    pub report_path: &'a str,
    pub attempt: u32,
    /// Tail of the previous attempt's output, when retrying.
    pub failure: Option<&'a str>,
}

/// Inputs for a decomposition planning prompt.
#[derive(Debug, Clone)]
pub struct PlanPrompt<'a> {
    pub ticket: &'a Ticket,
    pub plan_path: &'a str,
    pub child_type: &'a str,
    pub existing: &'a [ManifestChild],
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Renders prompts within a byte budget, dropping optional sections first.
#[derive(Debug)]
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("implement", IMPLEMENT_TEMPLATE)
            .expect("implement template should be valid");
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        Self { env, budget_bytes }
    }

    pub fn implement(&self, input: &ImplementPrompt<'_>) -> Result<String> {
        let rendered = self.env.get_template("implement")?.render(context! {
            ticket => input.ticket,
            report_path => input.report_path,
            attempt => input.attempt,
            failure => input.failure.map(str::trim).filter(|s| !s.is_empty()),
            parent => input.ticket.parent_key.as_deref(),
        })?;
        Ok(self.fit(&rendered, &["parent", "failure"]))
    }

    pub fn plan(&self, input: &PlanPrompt<'_>) -> Result<String> {
        let rendered = self.env.get_template("plan")?.render(context! {
            ticket => input.ticket,
            plan_path => input.plan_path,
            child_type => input.child_type,
            existing => input.existing,
        })?;
        Ok(self.fit(&rendered, &["existing"]))
    }

    fn fit(&self, rendered: &str, drop_order: &[&str]) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes, drop_order);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let start = caps.get(0).map_or(0, |m| m.end());
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[start..end].trim().to_string();
        let required = &caps[2] == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: caps[1].to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize, drop_order: &[&str]) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in drop_order {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(section = *key, bytes = sections[idx].content.len(), "dropped prompt section");
            sections.remove(idx);
        }
    }

    let over = total(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    // The ticket body comes last; cut it down rather than the contract.
    if let Some(last) = sections.last_mut() {
        let marker = "\n[truncated]";
        let keep = last.content.len().saturating_sub(over + marker.len());
        let mut cut = keep;
        while cut > 0 && !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        debug!(section = %last.key, before = last.content.len(), after = cut, "truncated prompt section");
        last.content.truncate(cut);
        last.content.push_str(marker);
    }
}
