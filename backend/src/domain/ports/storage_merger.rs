//! Port for physically relocating one user root into another.

use crate::domain::{MergeReport, MergeRequest, StorageCategory};

use super::define_port_error;

define_port_error! {
    /// Errors raised while moving storage between roots.
    pub enum StorageMergeError {
        /// Moving items of a category failed; earlier categories may already
        /// be at the destination.
        Io { category: StorageCategory, message: String } =>
            "moving {category} failed: {message}",
        /// Both the original and the relabelled name are taken at the
        /// destination by different content.
        Conflict { category: StorageCategory, name: String } =>
            "cannot place {category}/{name}: destination names are taken",
        /// The destination manifest could not be updated.
        Manifest { message: String } => "updating the destination manifest failed: {message}",
    }
}

impl StorageMergeError {
    /// Category the failure happened in; `None` for manifest failures.
    pub fn category(&self) -> Option<StorageCategory> {
        match self {
            Self::Io { category, .. } | Self::Conflict { category, .. } => Some(*category),
            Self::Manifest { .. } => None,
        }
    }

    /// Label naming the failed stage in error details.
    pub fn stage(&self) -> &'static str {
        self.category().map_or("manifest", StorageCategory::dir_name)
    }

    /// Whether repeating the merge may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Manifest { .. })
    }
}

/// Blocking merge of a source root into a destination root.
///
/// Implementations must be safe to re-run for the same pair: items already
/// present at the destination under their original or relabelled name are
/// skipped.
#[cfg_attr(test, mockall::automock)]
pub trait StorageMerger: Send + Sync {
    /// Move every item of every category and reconcile the destination
    /// manifest.
    fn merge(&self, request: &MergeRequest) -> Result<MergeReport, StorageMergeError>;
}
