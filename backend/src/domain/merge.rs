//! Merge request and report types shared by the verification flow and the
//! storage adapters.

use std::path::PathBuf;

use serde::Serialize;

use crate::domain::{IdentityId, StorageCategory, ThreadId};

/// One relocation of a source user root into a destination user root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Thread whose anonymous root is being merged.
    pub source_thread_id: ThreadId,
    /// Identity id of the source; prefixes renamed collisions.
    pub source_identity_id: IdentityId,
    pub source_root: PathBuf,
    /// Directory key of the destination root; merges sharing a key are
    /// serialised.
    pub destination_key: String,
    pub destination_root: PathBuf,
}

impl MergeRequest {
    /// Name an item from the source takes when its own name is taken at the
    /// destination.
    ///
    /// # Examples
    /// ```
    /// use std::path::PathBuf;
    /// use identity_isolation::domain::{IdentityId, MergeRequest, ThreadId};
    ///
    /// let thread = ThreadId::new("telegram:111").unwrap();
    /// let request = MergeRequest {
    ///     source_identity_id: IdentityId::derive(&thread, "telegram", "111"),
    ///     source_thread_id: thread,
    ///     source_root: PathBuf::from("data/users/anon_telegram_111"),
    ///     destination_key: "user_1".into(),
    ///     destination_root: PathBuf::from("data/users/user_1"),
    /// };
    /// assert_eq!(request.collision_name("a.txt"), "anon_telegram_111_a.txt");
    /// ```
    pub fn collision_name(&self, name: &str) -> String {
        format!("{}_{name}", self.source_identity_id)
    }
}

/// An item relocated into the destination root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovedItem {
    pub category: StorageCategory,
    pub original_name: String,
    /// Name at the destination; differs from `original_name` on collision.
    pub stored_name: String,
}

impl MovedItem {
    /// Whether the item was relabelled to avoid a collision.
    pub fn renamed(&self) -> bool {
        self.original_name != self.stored_name
    }
}

/// An item left alone because identical content already sits at the
/// destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    pub category: StorageCategory,
    pub name: String,
    /// Destination name holding the identical content.
    pub existing_name: String,
}

/// Outcome of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub moved: Vec<MovedItem>,
    pub skipped: Vec<SkippedItem>,
    /// Whether the emptied source root was removed.
    pub source_removed: bool,
}

impl MergeReport {
    /// Whether the merge relocated nothing.
    pub fn is_noop(&self) -> bool {
        self.moved.is_empty()
    }
}
