//! Per-root inventory document.
//!
//! A [`Manifest`] is a cache over the directory contents of one storage root.
//! It is never authoritative: adapters rebuild it whenever it is missing,
//! unparsable or disagrees with what is on disk.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{StorageCategory, ThreadId};

/// Manifest document version written by this crate.
pub const MANIFEST_VERSION: u32 = 1;

/// Shape of an inventoried item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

/// Where a merged item came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Thread whose root the item was moved out of.
    pub source_thread_id: ThreadId,
    /// Name of the item in the source root.
    pub original_name: String,
    /// When the item arrived.
    pub merged_at: DateTime<Utc>,
}

/// One inventoried item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Name inside the category directory.
    pub name: String,
    pub kind: EntryKind,
    /// Total size of the item, recursively for directories.
    pub size_bytes: u64,
    /// Number of regular files the item holds (1 for a file).
    pub item_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

/// Inventory of one storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    /// Entries under `files/`.
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
    /// Database files under `db/`.
    #[serde(default)]
    pub databases: Vec<ManifestEntry>,
    /// Vector-store collections under `vs/`.
    #[serde(default)]
    pub collections: Vec<ManifestEntry>,
    /// Memory store entries under `mem/`.
    #[serde(default)]
    pub memories: Vec<ManifestEntry>,
}

impl Manifest {
    /// Empty manifest stamped with `now`.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            updated_at: now,
            files: Vec::new(),
            databases: Vec::new(),
            collections: Vec::new(),
            memories: Vec::new(),
        }
    }

    /// Entries recorded for one category.
    pub fn entries(&self, category: StorageCategory) -> &[ManifestEntry] {
        match category {
            StorageCategory::Files => &self.files,
            StorageCategory::Database => &self.databases,
            StorageCategory::VectorStore => &self.collections,
            StorageCategory::Memory => &self.memories,
        }
    }

    fn entries_mut(&mut self, category: StorageCategory) -> &mut Vec<ManifestEntry> {
        match category {
            StorageCategory::Files => &mut self.files,
            StorageCategory::Database => &mut self.databases,
            StorageCategory::VectorStore => &mut self.collections,
            StorageCategory::Memory => &mut self.memories,
        }
    }

    /// Look up an entry by name.
    pub fn find(&self, category: StorageCategory, name: &str) -> Option<&ManifestEntry> {
        self.entries(category).iter().find(|entry| entry.name == name)
    }

    /// Insert or replace the entry with the same name, keeping the list
    /// sorted by name.
    pub fn upsert(&mut self, category: StorageCategory, entry: ManifestEntry) {
        let entries = self.entries_mut(category);
        match entries.binary_search_by(|existing| existing.name.as_str().cmp(entry.name.as_str())) {
            Ok(index) => entries[index] = entry,
            Err(index) => entries.insert(index, entry),
        }
    }

    /// Names recorded for one category.
    pub fn names(&self, category: StorageCategory) -> BTreeSet<&str> {
        self.entries(category)
            .iter()
            .map(|entry| entry.name.as_str())
            .collect()
    }

    /// Whether every category is empty.
    pub fn is_empty(&self) -> bool {
        StorageCategory::ALL
            .iter()
            .all(|category| self.entries(*category).is_empty())
    }

    /// Copy provenance from `previous` onto entries that still exist under
    /// the same name and kind.
    pub fn carry_provenance_from(&mut self, previous: &Manifest) {
        for category in StorageCategory::ALL {
            for entry in self.entries_mut(category) {
                if entry.provenance.is_some() {
                    continue;
                }
                entry.provenance = previous
                    .find(category, &entry.name)
                    .filter(|old| old.kind == entry.kind)
                    .and_then(|old| old.provenance.clone());
            }
        }
    }
}
