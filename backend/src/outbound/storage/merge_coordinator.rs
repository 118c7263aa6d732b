//! Filesystem merge of one user root into another.
//!
//! Items are relocated category by category with `rename`, falling back to
//! copy-then-remove across devices. An item is always present in at least
//! one of the two roots. Source copies are removed only once identical
//! content is confirmed at the destination.

use std::io;
use std::sync::Arc;

use cap_std::fs::Dir;
use chrono::{DateTime, Utc};
use mockable::Clock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::ports::{ManifestStore, StorageMergeError, StorageMerger};
use crate::domain::{
    MANIFEST_FILE_NAME, Manifest, ManifestEntry, MergeReport, MergeRequest, MovedItem,
    Provenance, SkippedItem, StorageCategory,
};

use super::fs_support::{
    EntryStats, STAGING_PREFIX, child_exists, copy_entry, create_ambient_dir, entry_stats,
    list_names, open_ambient_if_exists, open_child_if_exists, remove_ambient_empty_dir, remove_entry,
    same_content,
};

enum Placement {
    Moved(String),
    AlreadyPresent(String),
}

/// [`StorageMerger`] over `cap_std` directory handles.
#[derive(Clone)]
pub struct FsMergeCoordinator {
    manifests: Arc<dyn ManifestStore>,
    clock: Arc<dyn Clock>,
}

impl FsMergeCoordinator {
    /// Create a coordinator reconciling destination manifests through
    /// `manifests`.
    pub fn new(manifests: Arc<dyn ManifestStore>, clock: Arc<dyn Clock>) -> Self {
        Self { manifests, clock }
    }

    fn merge_category(
        &self,
        request: &MergeRequest,
        category: StorageCategory,
        source_root: &Dir,
        destination_root: &Dir,
        source_manifest: &Manifest,
        manifest: &mut Manifest,
        report: &mut MergeReport,
    ) -> Result<(), StorageMergeError> {
        let io_error = |error: io::Error| StorageMergeError::io(category, error.to_string());
        let Some(source) = open_child_if_exists(source_root, category.dir_name()).map_err(io_error)?
        else {
            return Ok(());
        };
        destination_root
            .create_dir_all(category.dir_name())
            .map_err(io_error)?;
        let destination = destination_root
            .open_dir(category.dir_name())
            .map_err(io_error)?;
        let merged_at = self.clock.utc();

        for name in list_names(&source).map_err(io_error)? {
            match place(request, category, &source, &destination, &name)? {
                Placement::Moved(stored_name) => {
                    let stats = entry_stats(&destination, &stored_name).map_err(io_error)?;
                    let earlier = source_manifest
                        .find(category, &name)
                        .and_then(|entry| entry.provenance.clone());
                    manifest.upsert(
                        category,
                        moved_entry(request, &name, &stored_name, stats, merged_at, earlier),
                    );
                    debug!(%category, name, stored_name, "item moved");
                    report.moved.push(MovedItem {
                        category,
                        original_name: name,
                        stored_name,
                    });
                }
                Placement::AlreadyPresent(existing_name) => {
                    debug!(%category, name, existing_name, "item already at destination");
                    report.skipped.push(SkippedItem {
                        category,
                        name,
                        existing_name,
                    });
                }
            }
        }

        if let Err(error) = source_root.remove_dir(category.dir_name()) {
            debug!(%category, %error, "source category directory left in place");
        }
        Ok(())
    }

    fn write_manifest(
        &self,
        request: &MergeRequest,
        manifest: &mut Manifest,
    ) -> Result<(), StorageMergeError> {
        manifest.updated_at = self.clock.utc();
        self.manifests
            .write(&request.destination_root, manifest)
            .map_err(|error| StorageMergeError::manifest(error.to_string()))
    }
}

fn moved_entry(
    request: &MergeRequest,
    original_name: &str,
    stored_name: &str,
    stats: EntryStats,
    merged_at: DateTime<Utc>,
    earlier: Option<Provenance>,
) -> ManifestEntry {
    // An item merged before keeps the thread and name it first came from.
    let provenance = earlier.unwrap_or_else(|| Provenance {
        source_thread_id: request.source_thread_id.clone(),
        original_name: original_name.to_owned(),
        merged_at,
    });
    ManifestEntry {
        name: stored_name.to_owned(),
        kind: stats.kind,
        size_bytes: stats.size_bytes,
        item_count: stats.item_count,
        provenance: Some(provenance),
    }
}

/// Put `source/name` at the destination under its own name or, when that is
/// taken by different content, under the collision name.
fn place(
    request: &MergeRequest,
    category: StorageCategory,
    source: &Dir,
    destination: &Dir,
    name: &str,
) -> Result<Placement, StorageMergeError> {
    let io_error = |error: io::Error| StorageMergeError::io(category, format!("{name}: {error}"));
    for candidate in [name.to_owned(), request.collision_name(name)] {
        if !child_exists(destination, &candidate).map_err(io_error)? {
            relocate(source, name, destination, &candidate).map_err(io_error)?;
            return Ok(Placement::Moved(candidate));
        }
        if same_content(source, name, destination, &candidate).map_err(io_error)? {
            remove_entry(source, name).map_err(io_error)?;
            return Ok(Placement::AlreadyPresent(candidate));
        }
    }
    Err(StorageMergeError::conflict(category, name))
}

/// Move an entry between directories; across devices, copy it under a
/// staging name, publish it with a rename, then remove the source.
fn relocate(source: &Dir, name: &str, destination: &Dir, target: &str) -> io::Result<()> {
    match source.rename(name, destination, target) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::CrossesDevices => {
            let staging = format!("{STAGING_PREFIX}{}", Uuid::new_v4().simple());
            let copied = copy_entry(source, name, destination, &staging)
                .and_then(|()| destination.rename(&staging, destination, target));
            if let Err(error) = copied {
                let _cleanup = remove_entry(destination, &staging);
                return Err(error);
            }
            remove_entry(source, name)
        }
        Err(error) => Err(error),
    }
}

/// Whether every category directory is gone from the source root.
fn source_drained(source_root: &Dir) -> io::Result<bool> {
    for category in StorageCategory::ALL {
        if child_exists(source_root, category.dir_name())? {
            return Ok(false);
        }
    }
    Ok(true)
}

impl StorageMerger for FsMergeCoordinator {
    fn merge(&self, request: &MergeRequest) -> Result<MergeReport, StorageMergeError> {
        let mut report = MergeReport::default();
        let Some(source_root) = open_ambient_if_exists(&request.source_root)
            .map_err(|error| StorageMergeError::io(StorageCategory::Files, error.to_string()))?
        else {
            debug!(source = %request.source_root.display(), "nothing to merge");
            report.source_removed = true;
            return Ok(report);
        };
        let destination_root = create_ambient_dir(&request.destination_root)
            .map_err(|error| StorageMergeError::io(StorageCategory::Files, error.to_string()))?;
        let source_manifest = match self.manifests.read(&request.source_root) {
            Ok(manifest) => manifest,
            Err(error) => {
                warn!(%error, "source manifest unreadable; recording fresh provenance");
                Manifest::empty(self.clock.utc())
            }
        };
        let mut manifest = self
            .manifests
            .read(&request.destination_root)
            .map_err(|error| StorageMergeError::manifest(error.to_string()))?;

        for category in StorageCategory::ALL {
            let moved_before = report.moved.len();
            let outcome = self.merge_category(
                request,
                category,
                &source_root,
                &destination_root,
                &source_manifest,
                &mut manifest,
                &mut report,
            );
            if report.moved.len() > moved_before {
                self.write_manifest(request, &mut manifest)?;
            }
            outcome?;
        }

        let drained = source_drained(&source_root)
            .map_err(|error| StorageMergeError::io(StorageCategory::Files, error.to_string()))?;
        if drained {
            match source_root.remove_file(MANIFEST_FILE_NAME) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => warn!(%error, "source manifest left in place"),
            }
            drop(source_root);
            report.source_removed = remove_ambient_empty_dir(&request.source_root).is_ok();
        } else {
            warn!(
                source = %request.source_root.display(),
                "source root still holds category data; leaving it in place"
            );
        }

        info!(
            source = %request.source_root.display(),
            destination = %request.destination_root.display(),
            moved = report.moved.len(),
            skipped = report.skipped.len(),
            source_removed = report.source_removed,
            "merge finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[path = "merge_coordinator_tests.rs"]
mod tests;
