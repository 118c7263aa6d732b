//! Filesystem-backed manifest store.

use std::io;
use std::path::Path;
use std::sync::Arc;

use cap_std::fs::Dir;
use mockable::Clock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::ports::{ManifestStore, ManifestStoreError};
use crate::domain::{
    MANIFEST_FILE_NAME, MANIFEST_VERSION, Manifest, ManifestEntry, StorageCategory,
};

use super::fs_support::{entry_stats, list_names, open_ambient_if_exists, open_child_if_exists};

fn io_error(root: &Path, error: io::Error) -> ManifestStoreError {
    ManifestStoreError::io(format!("{}: {error}", root.display()))
}

/// Why a stored manifest was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staleness {
    Missing,
    Unparsable,
    UnknownVersion,
    Inconsistent,
}

/// Manifest store writing `manifest.json` at the top of each root.
#[derive(Clone)]
pub struct FsManifestStore {
    clock: Arc<dyn Clock>,
}

impl FsManifestStore {
    /// Create a store stamping manifests with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Read the stored manifest of an open root without validating it
    /// against the directory contents.
    fn load(&self, dir: &Dir) -> io::Result<Result<Manifest, Staleness>> {
        let bytes = match dir.read(MANIFEST_FILE_NAME) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(Err(Staleness::Missing));
            }
            Err(error) => return Err(error),
        };
        Ok(match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) if manifest.version == MANIFEST_VERSION => Ok(manifest),
            Ok(_) => Err(Staleness::UnknownVersion),
            Err(_) => Err(Staleness::Unparsable),
        })
    }

    fn scan(&self, dir: &Dir) -> io::Result<Manifest> {
        let mut manifest = Manifest::empty(self.clock.utc());
        for category in StorageCategory::ALL {
            let Some(category_dir) = open_child_if_exists(dir, category.dir_name())? else {
                continue;
            };
            for name in list_names(&category_dir)? {
                let stats = entry_stats(&category_dir, &name)?;
                manifest.upsert(
                    category,
                    ManifestEntry {
                        name,
                        kind: stats.kind,
                        size_bytes: stats.size_bytes,
                        item_count: stats.item_count,
                        provenance: None,
                    },
                );
            }
        }
        Ok(manifest)
    }

    fn is_consistent(dir: &Dir, manifest: &Manifest) -> io::Result<bool> {
        for category in StorageCategory::ALL {
            let on_disk = match open_child_if_exists(dir, category.dir_name())? {
                Some(category_dir) => list_names(&category_dir)?,
                None => Vec::new(),
            };
            let recorded: Vec<&str> = manifest.names(category).into_iter().collect();
            if on_disk.iter().map(String::as_str).ne(recorded) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn rebuild_dir(&self, root: &Path, dir: &Dir) -> Result<Manifest, ManifestStoreError> {
        let previous = self.load(dir).map_err(|error| io_error(root, error))?.ok();
        let mut manifest = self.scan(dir).map_err(|error| io_error(root, error))?;
        if let Some(previous) = previous {
            manifest.carry_provenance_from(&previous);
        }
        write_atomically(dir, &manifest).map_err(|error| match error {
            WriteError::Io(error) => io_error(root, error),
            WriteError::Encode(message) => ManifestStoreError::encode(message),
        })?;
        Ok(manifest)
    }
}

enum WriteError {
    Io(io::Error),
    Encode(String),
}

fn write_atomically(dir: &Dir, manifest: &Manifest) -> Result<(), WriteError> {
    let bytes =
        serde_json::to_vec_pretty(manifest).map_err(|error| WriteError::Encode(error.to_string()))?;
    let staging = format!(".{MANIFEST_FILE_NAME}.{}.tmp", Uuid::new_v4().simple());
    let result = dir
        .write(&staging, &bytes)
        .and_then(|()| dir.rename(&staging, dir, MANIFEST_FILE_NAME));
    if result.is_err() {
        let _cleanup = dir.remove_file(&staging);
    }
    result.map_err(WriteError::Io)
}

impl ManifestStore for FsManifestStore {
    fn read(&self, root: &Path) -> Result<Manifest, ManifestStoreError> {
        let Some(dir) = open_ambient_if_exists(root).map_err(|error| io_error(root, error))? else {
            return Ok(Manifest::empty(self.clock.utc()));
        };
        let staleness = match self.load(&dir).map_err(|error| io_error(root, error))? {
            Ok(manifest) => {
                if Self::is_consistent(&dir, &manifest).map_err(|error| io_error(root, error))? {
                    return Ok(manifest);
                }
                Staleness::Inconsistent
            }
            Err(staleness) => staleness,
        };
        if staleness == Staleness::Missing {
            debug!(root = %root.display(), "manifest missing; building it");
        } else {
            warn!(root = %root.display(), ?staleness, "manifest stale; rebuilding");
        }
        self.rebuild_dir(root, &dir)
    }

    fn write(&self, root: &Path, manifest: &Manifest) -> Result<(), ManifestStoreError> {
        let Some(dir) = open_ambient_if_exists(root).map_err(|error| io_error(root, error))? else {
            return Err(ManifestStoreError::io(format!(
                "{}: root does not exist",
                root.display()
            )));
        };
        write_atomically(&dir, manifest).map_err(|error| match error {
            WriteError::Io(error) => io_error(root, error),
            WriteError::Encode(message) => ManifestStoreError::encode(message),
        })
    }

    fn rebuild(&self, root: &Path) -> Result<Manifest, ManifestStoreError> {
        let Some(dir) = open_ambient_if_exists(root).map_err(|error| io_error(root, error))? else {
            return Ok(Manifest::empty(self.clock.utc()));
        };
        self.rebuild_dir(root, &dir)
    }
}

#[cfg(test)]
mod tests {
    //! Regression coverage for manifest persistence and self-healing.
    use super::*;
    use crate::domain::{EntryKind, Provenance, ThreadId};
    use crate::test_support::MutableClock;
    use crate::test_support::cap_fs::{read_file_to_string, write_file};
    use chrono::Utc;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn store() -> FsManifestStore {
        FsManifestStore::new(Arc::new(MutableClock::new(Utc::now())))
    }

    fn populated_root() -> TempDir {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = create_root(root.path());
        dir.create_dir_all("files/photos").expect("files dir");
        dir.write("files/notes.txt", b"hello").expect("file");
        dir.write("files/photos/a.jpg", b"12345").expect("file");
        dir.create_dir_all("db").expect("db dir");
        dir.write("db/main.sqlite", b"sqlite").expect("file");
        root
    }

    fn create_root(path: &Path) -> Dir {
        super::super::fs_support::create_ambient_dir(path).expect("root")
    }

    #[rstest]
    fn missing_manifest_is_built_from_disk(store: FsManifestStore) {
        let root = populated_root();

        let manifest = store.read(root.path()).expect("manifest");

        let notes = manifest
            .find(StorageCategory::Files, "notes.txt")
            .expect("notes entry");
        assert_eq!((notes.kind, notes.size_bytes, notes.item_count), (EntryKind::File, 5, 1));
        let photos = manifest
            .find(StorageCategory::Files, "photos")
            .expect("photos entry");
        assert_eq!(
            (photos.kind, photos.size_bytes, photos.item_count),
            (EntryKind::Directory, 5, 1)
        );
        assert_eq!(manifest.databases.len(), 1);
        assert!(read_file_to_string(&root.path().join(MANIFEST_FILE_NAME)).is_ok());
    }

    #[rstest]
    fn unparsable_manifest_is_rebuilt(store: FsManifestStore) {
        let root = populated_root();
        write_file(&root.path().join(MANIFEST_FILE_NAME), b"{ not json").expect("garbage");

        let manifest = store.read(root.path()).expect("manifest");

        assert_eq!(manifest.files.len(), 2);
        let stored = read_file_to_string(&root.path().join(MANIFEST_FILE_NAME)).expect("stored");
        assert!(serde_json::from_str::<Manifest>(&stored).is_ok());
    }

    #[rstest]
    fn inconsistent_manifest_is_rebuilt_keeping_provenance(store: FsManifestStore) {
        let root = populated_root();
        let mut manifest = store.read(root.path()).expect("manifest");
        let provenance = Provenance {
            source_thread_id: ThreadId::new("telegram:111").expect("thread id"),
            original_name: "notes.txt".to_owned(),
            merged_at: Utc::now(),
        };
        let mut notes = manifest
            .find(StorageCategory::Files, "notes.txt")
            .cloned()
            .expect("notes entry");
        notes.provenance = Some(provenance.clone());
        manifest.upsert(StorageCategory::Files, notes);
        store.write(root.path(), &manifest).expect("write");

        write_file(&root.path().join("files/extra.txt"), b"x").expect("extra");
        let rebuilt = store.read(root.path()).expect("manifest");

        assert!(rebuilt.find(StorageCategory::Files, "extra.txt").is_some());
        assert_eq!(
            rebuilt
                .find(StorageCategory::Files, "notes.txt")
                .and_then(|entry| entry.provenance.clone()),
            Some(provenance)
        );
    }

    #[rstest]
    fn unknown_version_is_rebuilt(store: FsManifestStore) {
        let root = populated_root();
        let mut manifest = store.read(root.path()).expect("manifest");
        manifest.version = MANIFEST_VERSION + 1;
        store.write(root.path(), &manifest).expect("write");

        let reread = store.read(root.path()).expect("manifest");
        assert_eq!(reread.version, MANIFEST_VERSION);
    }

    #[rstest]
    fn missing_root_reads_empty_without_creating_it(store: FsManifestStore) {
        let parent = tempfile::tempdir().expect("tempdir");
        let root = parent.path().join("users/anon_telegram_111");

        let manifest = store.read(&root).expect("manifest");

        assert!(manifest.is_empty());
        assert!(!crate::test_support::cap_fs::path_exists(&root));
    }
}
