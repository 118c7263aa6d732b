//! Port for reading and repairing per-root manifests.

use std::path::Path;

use crate::domain::Manifest;

use super::define_port_error;

define_port_error! {
    /// Errors raised by manifest store adapters.
    pub enum ManifestStoreError {
        /// The root or manifest could not be read or written.
        Io { message: String } => "manifest i/o failed: {message}",
        /// The manifest could not be encoded.
        Encode { message: String } => "manifest encoding failed: {message}",
    }
}

/// Blocking access to the manifest of a storage root.
#[cfg_attr(test, mockall::automock)]
pub trait ManifestStore: Send + Sync {
    /// Return the manifest of `root`, rebuilding and persisting it when it is
    /// missing, unparsable, of an unknown version, or inconsistent with the
    /// directory contents.
    fn read(&self, root: &Path) -> Result<Manifest, ManifestStoreError>;

    /// Replace the manifest of `root` atomically.
    fn write(&self, root: &Path, manifest: &Manifest) -> Result<(), ManifestStoreError>;

    /// Rescan `root` and persist a fresh manifest, keeping the provenance of
    /// entries that are still present.
    fn rebuild(&self, root: &Path) -> Result<Manifest, ManifestStoreError>;
}
