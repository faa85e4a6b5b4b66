//! Verification report structure checks.
//!
//! A report is Markdown with level-two headings. Only the `## Checklist`
//! section is authoritative: it must contain at least one task item and every
//! item must be checked.

/// Headings every verification report skeleton carries.
pub const REQUIRED_HEADINGS: [&str; 4] = ["Summary", "Checklist", "Evidence", "Manual Testing"];

/// Result of inspecting a report's checklist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecklistStatus {
    /// Section present, non-empty, all items checked.
    Complete { items: usize },
    /// No `## Checklist` heading.
    MissingSection,
    /// Heading present but no `- [ ]` / `- [x]` items under it.
    Empty,
    /// Some items unchecked; holds their text.
    Unchecked { unchecked: Vec<String>, total: usize },
}

impl ChecklistStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    /// One-line description suitable for comments and remediation text.
    pub fn describe(&self) -> String {
        match self {
            Self::Complete { items } => format!("checklist complete ({items} items)"),
            Self::MissingSection => "missing `## Checklist` section".to_string(),
            Self::Empty => "`## Checklist` section has no items".to_string(),
            Self::Unchecked { unchecked, total } => format!(
                "{} of {} checklist items unchecked: {}",
                unchecked.len(),
                total,
                unchecked.join("; ")
            ),
        }
    }
}

/// Inspect the `## Checklist` section of a Markdown report.
pub fn check_checklist(markdown: &str) -> ChecklistStatus {
    let Some(section) = section_body(markdown, "Checklist") else {
        return ChecklistStatus::MissingSection;
    };

    let mut total = 0usize;
    let mut unchecked = Vec::new();
    for line in section {
        let Some((checked, text)) = parse_task_item(line) else {
            continue;
        };
        total += 1;
        if !checked {
            unchecked.push(text.to_string());
        }
    }

    if total == 0 {
        ChecklistStatus::Empty
    } else if unchecked.is_empty() {
        ChecklistStatus::Complete { items: total }
    } else {
        ChecklistStatus::Unchecked { unchecked, total }
    }
}

/// Headings from [`REQUIRED_HEADINGS`] that the report lacks.
pub fn missing_headings(markdown: &str) -> Vec<&'static str> {
    REQUIRED_HEADINGS
        .iter()
        .copied()
        .filter(|heading| section_body(markdown, heading).is_none())
        .collect()
}

/// Lines between `## {heading}` and the next level-one or level-two heading.
fn section_body<'a>(markdown: &'a str, heading: &str) -> Option<Vec<&'a str>> {
    let mut lines = markdown.lines();
    lines.find(|line| {
        line.trim()
            .strip_prefix("## ")
            .is_some_and(|title| title.trim().eq_ignore_ascii_case(heading))
    })?;
    Some(
        lines
            .take_while(|line| {
                let trimmed = line.trim_start();
                !(trimmed.starts_with("# ") || trimmed.starts_with("## "))
            })
            .collect(),
    )
}

fn parse_task_item(line: &str) -> Option<(bool, &str)> {
    let trimmed = line.trim_start();
    let rest = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))?
        .trim_start();
    let (checked, text) = if let Some(text) = rest.strip_prefix("[ ]") {
        (false, text)
    } else if let Some(text) = rest
        .strip_prefix("[x]")
        .or_else(|| rest.strip_prefix("[X]"))
    {
        (true, text)
    } else {
        return None;
    };
    Some((checked, text.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLETE: &str = "# ABC-1 verification\n\n## Summary\nDone.\n\n## Checklist\n- [x] tests pass\n* [X] docs updated\n\n## Evidence\n- [ ] not part of checklist\n";

    #[test]
    fn complete_checklist_ignores_other_sections() {
        assert_eq!(
            check_checklist(COMPLETE),
            ChecklistStatus::Complete { items: 2 }
        );
    }

    #[test]
    fn unchecked_items_are_reported() {
        let md = "## Checklist\n- [x] a\n- [ ] b\n  - [ ] nested c\n";
        let status = check_checklist(md);
        assert_eq!(
            status,
            ChecklistStatus::Unchecked {
                unchecked: vec!["b".to_string(), "nested c".to_string()],
                total: 3
            }
        );
        assert!(status.describe().contains("2 of 3"));
    }

    #[test]
    fn missing_and_empty_sections() {
        assert_eq!(
            check_checklist("## Summary\nhi\n"),
            ChecklistStatus::MissingSection
        );
        assert_eq!(
            check_checklist("## Checklist\nnothing yet\n## Evidence\n- [x] x\n"),
            ChecklistStatus::Empty
        );
    }

    #[test]
    fn heading_match_is_case_insensitive() {
        assert!(check_checklist("##  checklist \n- [x] ok\n").is_complete());
    }

    #[test]
    fn missing_headings_lists_absent_sections() {
        assert_eq!(missing_headings(COMPLETE), vec!["Manual Testing"]);
    }
}
