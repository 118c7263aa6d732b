//! Creates storage roots and their category directories on first write.

use std::sync::Arc;

use tracing::debug;

use crate::domain::ports::{ManifestStore, RootProvisioner, RootProvisionerError};
use crate::domain::{MANIFEST_FILE_NAME, ResolvedScope, StorageCategory};

use super::fs_support::create_ambient_dir;

/// [`RootProvisioner`] creating directories through `cap_std` and seeding
/// the root manifest.
#[derive(Clone)]
pub struct CapStdRootProvisioner {
    manifests: Arc<dyn ManifestStore>,
}

impl CapStdRootProvisioner {
    /// Create a provisioner that initialises manifests through `manifests`.
    pub fn new(manifests: Arc<dyn ManifestStore>) -> Self {
        Self { manifests }
    }
}

impl RootProvisioner for CapStdRootProvisioner {
    fn ensure(&self, scope: &ResolvedScope) -> Result<(), RootProvisionerError> {
        let root = create_ambient_dir(scope.root()).map_err(|error| {
            RootProvisionerError::io(format!("{}: {error}", scope.root().display()))
        })?;
        for category in StorageCategory::ALL {
            root.create_dir_all(category.dir_name()).map_err(|error| {
                RootProvisionerError::io(format!(
                    "{}: {error}",
                    scope.category_dir(category).display()
                ))
            })?;
        }
        if !root.exists(MANIFEST_FILE_NAME) {
            self.manifests
                .read(scope.root())
                .map_err(|error| RootProvisionerError::io(error.to_string()))?;
        }
        debug!(kind = scope.kind().as_str(), key = scope.key(), "storage root ready");
        Ok(())
    }
}
