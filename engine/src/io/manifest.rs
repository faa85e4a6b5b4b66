//! Decomposition manifests (`reports/{EPIC}-decomposition.json`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::io::ledger::DocumentStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ManifestStatus {
    #[default]
    Incomplete,
    Complete,
}

/// One planned child ticket. `key` is set once the tracker created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChild {
    pub intent_id: String,
    pub summary: String,
    #[serde(default)]
    pub key: Option<String>,
}

/// Idempotency record for one Epic or Initiative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecompositionManifest {
    pub epic_key: String,
    pub fingerprint: String,
    pub status: ManifestStatus,
    #[serde(default)]
    pub children: Vec<ManifestChild>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DecompositionManifest {
    pub fn new(epic_key: &str, fingerprint: &str) -> Self {
        Self {
            epic_key: epic_key.to_string(),
            fingerprint: fingerprint.to_string(),
            ..Self::default()
        }
    }

    /// An absent manifest loads as the default document with no key.
    pub fn exists(&self) -> bool {
        !self.epic_key.is_empty()
    }

    /// True when this manifest already covers `fingerprint` and every child
    /// exists in the tracker.
    pub fn is_settled_for(&self, fingerprint: &str) -> bool {
        self.exists()
            && self.fingerprint == fingerprint
            && self.status == ManifestStatus::Complete
            && !self.children.is_empty()
            && self.children.iter().all(|child| child.key.is_some())
    }

    pub fn key_for(&self, intent_id: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|child| child.intent_id == intent_id)
            .and_then(|child| child.key.as_deref())
    }

    pub fn created_keys(&self) -> Vec<String> {
        self.children.iter().filter_map(|c| c.key.clone()).collect()
    }

    /// Insert or update the child for `intent_id`, keeping plan order.
    pub fn record_child(&mut self, intent_id: &str, summary: &str, key: Option<String>) {
        match self.children.iter_mut().find(|c| c.intent_id == intent_id) {
            Some(child) => {
                child.summary = summary.to_string();
                if key.is_some() {
                    child.key = key;
                }
            }
            None => self.children.push(ManifestChild {
                intent_id: intent_id.to_string(),
                summary: summary.to_string(),
                key,
            }),
        }
    }

    /// COMPLETE once at least one child has a key.
    pub fn refresh_status(&mut self) {
        self.status = if self.children.iter().any(|c| c.key.is_some()) {
            ManifestStatus::Complete
        } else {
            ManifestStatus::Incomplete
        };
    }
}

pub type ManifestStore = DocumentStore<DecompositionManifest>;
