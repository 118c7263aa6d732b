//! Capability-scoped filesystem helpers shared by the storage adapters.
//!
//! Every access goes through `cap_std::fs::Dir` handles opened from the
//! configured roots; nothing here touches ambient `std::fs`.

use std::io::{self, Read};
use std::path::Path;

use cap_std::{ambient_authority, fs::Dir};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::domain::EntryKind;

/// Prefix of staging names created while copying across devices.
pub(super) const STAGING_PREFIX: &str = ".merge-tmp-";

/// Size and file count of one directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct EntryStats {
    pub kind: EntryKind,
    pub size_bytes: u64,
    pub item_count: u64,
}

/// Open `path` as a directory, or `None` when it does not exist.
pub(super) fn open_ambient_if_exists(path: &Path) -> io::Result<Option<Dir>> {
    match Dir::open_ambient_dir(path, ambient_authority()) {
        Ok(dir) => Ok(Some(dir)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

/// Create `path` and its parents, then open it.
pub(super) fn create_ambient_dir(path: &Path) -> io::Result<Dir> {
    Dir::create_ambient_dir_all(path, ambient_authority())?;
    Dir::open_ambient_dir(path, ambient_authority())
}

/// Remove the directory at `path` if it is empty.
pub(super) fn remove_ambient_empty_dir(path: &Path) -> io::Result<()> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        ));
    };
    Dir::open_ambient_dir(parent, ambient_authority())?.remove_dir(name)
}

/// Open a child directory, or `None` when it does not exist.
pub(super) fn open_child_if_exists(parent: &Dir, name: &str) -> io::Result<Option<Dir>> {
    match parent.open_dir(name) {
        Ok(dir) => Ok(Some(dir)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

/// Whether a child exists, without following symlinks.
pub(super) fn child_exists(parent: &Dir, name: &str) -> io::Result<bool> {
    match parent.symlink_metadata(name) {
        Ok(_) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

/// Sorted UTF-8 names of the entries of `dir`, skipping staging leftovers.
///
/// Entries whose names are not valid UTF-8 are logged and left out; they stay
/// where they are.
pub(super) fn list_names(dir: &Dir) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in dir.entries()? {
        let raw = entry?.file_name();
        match raw.into_string() {
            Ok(name) if name.starts_with(STAGING_PREFIX) => {}
            Ok(name) => names.push(name),
            Err(raw) => warn!(name = ?raw, "skipping entry with a non UTF-8 name"),
        }
    }
    names.sort();
    Ok(names)
}

fn is_dir(parent: &Dir, name: &str) -> io::Result<bool> {
    Ok(parent.symlink_metadata(name)?.is_dir())
}

/// Recursive size and file count of `parent/name`.
pub(super) fn entry_stats(parent: &Dir, name: &str) -> io::Result<EntryStats> {
    let metadata = parent.symlink_metadata(name)?;
    if !metadata.is_dir() {
        return Ok(EntryStats {
            kind: EntryKind::File,
            size_bytes: metadata.len(),
            item_count: 1,
        });
    }
    let dir = parent.open_dir(name)?;
    let mut stats = EntryStats {
        kind: EntryKind::Directory,
        size_bytes: 0,
        item_count: 0,
    };
    for child in list_names(&dir)? {
        let nested = entry_stats(&dir, &child)?;
        stats.size_bytes = stats.size_bytes.saturating_add(nested.size_bytes);
        stats.item_count = stats.item_count.saturating_add(nested.item_count);
    }
    Ok(stats)
}

fn file_digest(parent: &Dir, name: &str) -> io::Result<[u8; 32]> {
    let mut file = parent.open(name)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into())
}

/// Whether `left/left_name` and `right/right_name` hold the same content:
/// equal bytes for files, the same names with equal content for directories.
pub(super) fn same_content(
    left: &Dir,
    left_name: &str,
    right: &Dir,
    right_name: &str,
) -> io::Result<bool> {
    let left_meta = left.symlink_metadata(left_name)?;
    let right_meta = right.symlink_metadata(right_name)?;
    if left_meta.is_dir() != right_meta.is_dir() {
        return Ok(false);
    }
    if !left_meta.is_dir() {
        if !left_meta.is_file() || !right_meta.is_file() || left_meta.len() != right_meta.len() {
            return Ok(false);
        }
        return Ok(file_digest(left, left_name)? == file_digest(right, right_name)?);
    }

    let left_dir = left.open_dir(left_name)?;
    let right_dir = right.open_dir(right_name)?;
    let children = list_names(&left_dir)?;
    if children != list_names(&right_dir)? {
        return Ok(false);
    }
    for child in children {
        if !same_content(&left_dir, &child, &right_dir, &child)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Copy `from/name` into `to/target`, recursing into directories.
pub(super) fn copy_entry(from: &Dir, name: &str, to: &Dir, target: &str) -> io::Result<()> {
    if !is_dir(from, name)? {
        from.copy(name, to, target)?;
        return Ok(());
    }
    to.create_dir(target)?;
    let source = from.open_dir(name)?;
    let destination = to.open_dir(target)?;
    for child in list_names(&source)? {
        copy_entry(&source, &child, &destination, &child)?;
    }
    Ok(())
}

/// Remove a file or a whole directory tree.
pub(super) fn remove_entry(parent: &Dir, name: &str) -> io::Result<()> {
    if is_dir(parent, name)? {
        parent.remove_dir_all(name)
    } else {
        parent.remove_file(name)
    }
}
