//! Port for creating storage roots on first write.

use crate::domain::ResolvedScope;

use super::define_port_error;

define_port_error! {
    /// Errors raised while creating a storage root.
    pub enum RootProvisionerError {
        /// A directory could not be created.
        Io { message: String } => "root provisioning failed: {message}",
    }
}

/// Creates a root and its category directories if absent.
#[cfg_attr(test, mockall::automock)]
pub trait RootProvisioner: Send + Sync {
    /// Ensure `scope.root()` and every category directory exist.
    fn ensure(&self, scope: &ResolvedScope) -> Result<(), RootProvisionerError>;
}
