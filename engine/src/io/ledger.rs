//! Atomic JSON document storage shared by the engine's ledgers.
//!
//! Every mutation is load, modify, write-whole-document. Writes go to a temp
//! file that is renamed over the canonical path, so a crash mid-write leaves
//! either the old or the new document, never a torn one. Concurrent writers
//! are excluded by the session lock, not by this module.

use std::collections::BTreeMap;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// A record stored in a keyed ledger document.
pub trait LedgerEntry: Clone {
    /// Fresh entry for a key seen for the first time.
    fn create(key: &str, now: DateTime<Utc>) -> Self;
    /// Refresh the entry's `updatedAt`.
    fn touch(&mut self, now: DateTime<Utc>);
}

/// Keyed ledger document: issue key to entry.
pub type Ledger<E> = BTreeMap<String, E>;

/// A JSON document at a fixed path.
#[derive(Debug, Clone)]
pub struct DocumentStore<T> {
    path: PathBuf,
    _doc: PhantomData<fn() -> T>,
}

impl<T> DocumentStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document.
    ///
    /// A missing file yields the default document. A corrupt file is moved
    /// aside to `*.corrupt` and the default document is returned: callers never
    /// see a partially parsed ledger, and an empty ledger never implies a pass.
    pub fn load(&self) -> Result<T> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "document missing, using default");
            return Ok(T::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        match serde_json::from_str(&contents) {
            Ok(doc) => Ok(doc),
            Err(err) => {
                let aside = corrupt_path(&self.path);
                warn!(
                    path = %self.path.display(),
                    aside = %aside.display(),
                    err = %err,
                    "corrupt document, re-initializing empty"
                );
                fs::rename(&self.path, &aside).with_context(|| {
                    format!("move corrupt {} to {}", self.path.display(), aside.display())
                })?;
                Ok(T::default())
            }
        }
    }

    /// Atomically write the whole document.
    pub fn save(&self, doc: &T) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(doc)
            .with_context(|| format!("serialize {}", self.path.display()))?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    /// Load, apply `f`, save. Returns whatever `f` returns.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut doc = self.load()?;
        let out = f(&mut doc);
        self.save(&doc)?;
        Ok(out)
    }
}

impl<E> DocumentStore<Ledger<E>>
where
    E: LedgerEntry + Serialize + DeserializeOwned,
{
    /// Look up one entry.
    pub fn get(&self, key: &str) -> Result<Option<E>> {
        Ok(self.load()?.get(key).cloned())
    }

    /// Create-if-missing, merge-if-present, always refresh `updatedAt`.
    pub fn upsert(&self, key: &str, merge: impl FnOnce(&mut E)) -> Result<E> {
        self.upsert_at(key, Utc::now(), merge)
    }

    pub fn upsert_at(
        &self,
        key: &str,
        now: DateTime<Utc>,
        merge: impl FnOnce(&mut E),
    ) -> Result<E> {
        self.update(|ledger| {
            let entry = ledger
                .entry(key.to_string())
                .or_insert_with(|| E::create(key, now));
            merge(&mut *entry);
            entry.touch(now);
            entry.clone()
        })
    }
}

/// Write `contents` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = tmp_path(path);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".corrupt");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Note {
        key: String,
        count: u32,
        updated_at: DateTime<Utc>,
    }

    impl LedgerEntry for Note {
        fn create(key: &str, now: DateTime<Utc>) -> Self {
            Self {
                key: key.to_string(),
                count: 0,
                updated_at: now,
            }
        }

        fn touch(&mut self, now: DateTime<Utc>) {
            self.updated_at = now;
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap()
    }

    #[test]
    fn upsert_creates_then_merges_and_touches() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store: DocumentStore<Ledger<Note>> = DocumentStore::new(temp.path().join("l.json"));

        let first = store.upsert_at("ABC-1", at(1), |n| n.count += 1).expect("upsert");
        assert_eq!(first.count, 1);
        let second = store.upsert_at("ABC-1", at(2), |n| n.count += 1).expect("upsert");
        assert_eq!(second.count, 2);
        assert_eq!(second.updated_at, at(2));

        let reloaded = store.get("ABC-1").expect("get").expect("entry");
        assert_eq!(reloaded, second);
        assert!(store.get("ABC-2").expect("get").is_none());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/doc.json");
        let store: DocumentStore<Ledger<Note>> = DocumentStore::new(&path);
        store.upsert_at("K-1", at(0), |_| {}).expect("upsert");
        assert!(path.is_file());
        assert!(!temp.path().join("nested/doc.json.tmp").exists());
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.ends_with("}\n"));
    }

    #[test]
    fn corrupt_document_is_moved_aside_and_reset() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("doc.json");
        fs::write(&path, "{ not json").expect("write");
        let store: DocumentStore<Ledger<Note>> = DocumentStore::new(&path);

        let doc = store.load().expect("load");
        assert!(doc.is_empty());
        assert!(temp.path().join("doc.json.corrupt").is_file());
        assert!(!path.exists());
    }
}
