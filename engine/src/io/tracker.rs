//! Issue-tracker boundary.
//!
//! The engine talks to the tracker only through [`Tracker`]. Raw payloads are
//! `serde_json::Value`s in whatever shape the backend returns; the pure
//! `normalize_*` functions turn them into engine types so malformed data is
//! rejected at the edge instead of deep inside the pipeline.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::core::transitions::{TransitionList, TransitionOption};
use crate::core::types::{IssueType, Ticket};
use crate::io::ledger::DocumentStore;

/// Typed tracker failures callers branch on.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("ticket {0} not found")]
    NotFound(String),
    #[error("malformed tracker payload: {0}")]
    Malformed(String),
    #[error("transition {transition} not available for {key}")]
    UnknownTransition { key: String, transition: String },
}

/// Acknowledgement of a posted comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentResult {
    pub id: String,
}

/// Request to create a child ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChild {
    pub parent_key: String,
    pub issue_type: IssueType,
    pub summary: String,
    pub description: String,
}

pub trait Tracker {
    fn fetch_ticket(&self, key: &str) -> Result<Ticket>;
    /// Tickets whose status is one of the configured in-progress statuses.
    fn list_in_progress(&self) -> Result<Vec<Ticket>>;
    fn post_comment(&self, key: &str, body: &str) -> Result<CommentResult>;
    fn list_transitions(&self, key: &str) -> Result<TransitionList>;
    fn transition(&self, key: &str, transition_id: &str) -> Result<()>;
    /// Create a child and return its key.
    fn create_child(&self, child: &NewChild) -> Result<String>;
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn first_str<'a>(value: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers.iter().find_map(|p| str_at(value, p))
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalize a ticket payload.
///
/// Accepts both the nested `{key, fields: {issuetype: {name}, status: {name},
/// summary, description, parent: {key}}}` shape and a flat `{key, issueType,
/// status, summary, description, parentKey}` shape.
pub fn normalize_ticket(raw: &Value) -> Result<Ticket, TrackerError> {
    let key = str_at(raw, "/key")
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| TrackerError::Malformed("ticket without key".to_string()))?;
    let issue_type = first_str(
        raw,
        &["/fields/issuetype/name", "/issueType", "/issue_type", "/type"],
    )
    .ok_or_else(|| TrackerError::Malformed(format!("{key}: missing issue type")))?;
    let status = first_str(raw, &["/fields/status/name", "/status/name", "/status"])
        .ok_or_else(|| TrackerError::Malformed(format!("{key}: missing status")))?;
    let summary = first_str(raw, &["/fields/summary", "/summary"]).unwrap_or_default();
    let description = first_str(raw, &["/fields/description", "/description"]).unwrap_or_default();
    let parent_key = first_str(raw, &["/fields/parent/key", "/parentKey", "/parent_key"])
        .filter(|p| !p.trim().is_empty())
        .map(str::to_string);

    Ok(Ticket {
        key: key.trim().to_string(),
        issue_type: IssueType::parse(issue_type),
        status: status.trim().to_string(),
        summary: summary.trim().to_string(),
        description: description.to_string(),
        parent_key,
    })
}

/// Normalize `{transitions: [{id, name}]}` or a bare array of the same.
pub fn normalize_transitions(raw: &Value) -> Result<TransitionList, TrackerError> {
    let list = raw
        .get("transitions")
        .unwrap_or(raw)
        .as_array()
        .ok_or_else(|| TrackerError::Malformed("transitions are not a list".to_string()))?;
    list.iter()
        .map(|item| {
            let id = id_string(item.get("id"))
                .ok_or_else(|| TrackerError::Malformed("transition without id".to_string()))?;
            let name = str_at(item, "/name")
                .ok_or_else(|| TrackerError::Malformed(format!("transition {id} without name")))?;
            Ok(TransitionOption {
                id,
                name: name.to_string(),
            })
        })
        .collect()
}

pub fn normalize_comment(raw: &Value) -> Result<CommentResult, TrackerError> {
    let id = id_string(raw.get("id"))
        .ok_or_else(|| TrackerError::Malformed("comment response without id".to_string()))?;
    Ok(CommentResult { id })
}

/// One workflow transition in a [`FileTracker`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransition {
    pub id: String,
    pub name: String,
    /// Status the ticket lands in.
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileComment {
    pub id: String,
    pub key: String,
    pub body: String,
}

/// On-disk shape of `.engineo/tracker.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSnapshot {
    /// Raw ticket payloads; normalized on read.
    pub tickets: Vec<Value>,
    pub transitions: Vec<FileTransition>,
    pub comments: Vec<FileComment>,
}

/// Local JSON-file tracker for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FileTracker {
    store: DocumentStore<TrackerSnapshot>,
    in_progress: Vec<String>,
    new_child_status: String,
}

impl FileTracker {
    pub fn new(path: impl Into<PathBuf>, in_progress: Vec<String>) -> Self {
        Self {
            store: DocumentStore::new(path),
            in_progress,
            new_child_status: "To Do".to_string(),
        }
    }

    pub fn snapshot(&self) -> Result<TrackerSnapshot> {
        self.store.load()
    }

    fn ticket_index(snapshot: &TrackerSnapshot, key: &str) -> Option<usize> {
        snapshot
            .tickets
            .iter()
            .position(|raw| str_at(raw, "/key") == Some(key))
    }
}

fn set_status(raw: &mut Value, status: &str) {
    if raw.pointer("/fields/status").is_some() {
        if let Some(slot) = raw.pointer_mut("/fields/status") {
            *slot = json!({ "name": status });
        }
    } else if let Some(obj) = raw.as_object_mut() {
        obj.insert("status".to_string(), Value::String(status.to_string()));
    }
}

/// Next `{PROJECT}-{N}` key for the project of `parent_key`.
fn next_key(snapshot: &TrackerSnapshot, parent_key: &str) -> String {
    let project = parent_key
        .rsplit_once('-')
        .map_or(parent_key, |(project, _)| project);
    let prefix = format!("{project}-");
    let highest = snapshot
        .tickets
        .iter()
        .filter_map(|raw| str_at(raw, "/key"))
        .filter_map(|key| key.strip_prefix(&prefix))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("{project}-{}", highest + 1)
}

impl Tracker for FileTracker {
    fn fetch_ticket(&self, key: &str) -> Result<Ticket> {
        let snapshot = self.store.load()?;
        let idx = Self::ticket_index(&snapshot, key)
            .ok_or_else(|| TrackerError::NotFound(key.to_string()))?;
        Ok(normalize_ticket(&snapshot.tickets[idx])?)
    }

    fn list_in_progress(&self) -> Result<Vec<Ticket>> {
        let snapshot = self.store.load()?;
        let mut tickets = Vec::new();
        for raw in &snapshot.tickets {
            let ticket = normalize_ticket(raw)?;
            if self
                .in_progress
                .iter()
                .any(|status| status.eq_ignore_ascii_case(&ticket.status))
            {
                tickets.push(ticket);
            }
        }
        Ok(tickets)
    }

    #[instrument(skip_all, fields(key))]
    fn post_comment(&self, key: &str, body: &str) -> Result<CommentResult> {
        let response = self.store.update(|snapshot| {
            if Self::ticket_index(snapshot, key).is_none() {
                return Err(TrackerError::NotFound(key.to_string()));
            }
            let id = (snapshot.comments.len() + 1).to_string();
            snapshot.comments.push(FileComment {
                id: id.clone(),
                key: key.to_string(),
                body: body.to_string(),
            });
            Ok(json!({ "id": id }))
        })??;
        debug!(key, "comment posted");
        Ok(normalize_comment(&response)?)
    }

    fn list_transitions(&self, key: &str) -> Result<TransitionList> {
        let snapshot = self.store.load()?;
        if Self::ticket_index(&snapshot, key).is_none() {
            return Err(TrackerError::NotFound(key.to_string()).into());
        }
        let raw = serde_json::to_value(&snapshot.transitions).context("serialize transitions")?;
        Ok(normalize_transitions(&raw)?)
    }

    #[instrument(skip_all, fields(key, transition_id))]
    fn transition(&self, key: &str, transition_id: &str) -> Result<()> {
        self.store.update(|snapshot| {
            let idx = Self::ticket_index(snapshot, key)
                .ok_or_else(|| TrackerError::NotFound(key.to_string()))?;
            let target = snapshot
                .transitions
                .iter()
                .find(|t| t.id == transition_id)
                .map(|t| t.to.clone())
                .ok_or_else(|| TrackerError::UnknownTransition {
                    key: key.to_string(),
                    transition: transition_id.to_string(),
                })?;
            set_status(&mut snapshot.tickets[idx], &target);
            Ok::<(), TrackerError>(())
        })??;
        debug!(key, transition_id, "ticket transitioned");
        Ok(())
    }

    #[instrument(skip_all, fields(parent = %child.parent_key))]
    fn create_child(&self, child: &NewChild) -> Result<String> {
        let key = self.store.update(|snapshot| {
            if Self::ticket_index(snapshot, &child.parent_key).is_none() {
                return Err(TrackerError::NotFound(child.parent_key.clone()));
            }
            let key = next_key(snapshot, &child.parent_key);
            snapshot.tickets.push(json!({
                "key": key,
                "issueType": child.issue_type.as_str(),
                "status": self.new_child_status,
                "summary": child.summary,
                "description": child.description,
                "parentKey": child.parent_key,
            }));
            Ok(key)
        })??;
        debug!(key = %key, "child created");
        Ok(key)
    }
}
