//! Filesystem adapters for storage roots, manifests and merges.

mod fs_support;
mod manifest_store;
mod merge_coordinator;
mod root_provisioner;

pub use manifest_store::FsManifestStore;
pub use merge_coordinator::FsMergeCoordinator;
pub use root_provisioner::CapStdRootProvisioner;
