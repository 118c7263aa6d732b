//! Domain ports and supporting types for the hexagonal boundary.

mod macros;
pub(crate) use macros::define_port_error;

mod identity_repository;
mod manifest_store;
mod merge_executor;
mod notification_sender;
mod root_provisioner;
mod storage_merger;
mod verification_code_repository;

#[cfg(test)]
pub use identity_repository::MockIdentityRepository;
pub use identity_repository::{IdentityRepository, IdentityRepositoryError};
#[cfg(test)]
pub use manifest_store::MockManifestStore;
pub use manifest_store::{ManifestStore, ManifestStoreError};
pub use merge_executor::MergeExecutor;
#[cfg(test)]
pub use merge_executor::MockMergeExecutor;
#[cfg(test)]
pub use notification_sender::MockNotificationSender;
pub use notification_sender::{NotificationError, NotificationSender};
#[cfg(test)]
pub use root_provisioner::MockRootProvisioner;
pub use root_provisioner::{RootProvisioner, RootProvisionerError};
#[cfg(test)]
pub use storage_merger::MockStorageMerger;
pub use storage_merger::{StorageMergeError, StorageMerger};
#[cfg(test)]
pub use verification_code_repository::MockVerificationCodeRepository;
pub use verification_code_repository::{
    VerificationCodeRepository, VerificationCodeRepositoryError,
};

#[cfg(test)]
mod tests;
