//! Port abstraction for identity registry persistence.
//!
//! The registry keeps one row per conversation thread. Adapters must give
//! insert-or-fetch semantics for [`IdentityRepository::create_or_get`] and
//! linearise every status transition for a single `thread_id` (row lock,
//! conditional update or equivalent). No ordering is required across
//! different threads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Contact, Identity, NewIdentity, PersistentUserId, ThreadId, VerificationMethod,
};

use super::define_port_error;

define_port_error! {
    /// Errors raised by identity repository adapters.
    pub enum IdentityRepositoryError {
        /// Repository connection could not be established.
        Connection { message: String } => "identity repository connection failed: {message}",
        /// Query or mutation failed during execution.
        Query { message: String } => "identity repository query failed: {message}",
        /// A uniqueness constraint other than the thread id rejected a write.
        Conflict { message: String } => "identity repository conflict: {message}",
    }
}

/// Port for reading and transitioning identity rows.
///
/// Transition methods return `Ok(None)` when the thread is unknown and return
/// the row unchanged when it is already verified: a verified row never has
/// its persistent user id replaced through this port.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityRepository: Send + Sync {
    /// Insert the row if the thread is new, otherwise return the stored row
    /// untouched. Concurrent calls for one thread yield a single row.
    async fn create_or_get(&self, identity: &NewIdentity) -> Result<Identity, IdentityRepositoryError>;

    /// Fetch the row for a thread.
    async fn find_by_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<Identity>, IdentityRepositoryError>;

    /// Fetch a row verified through its own code whose contact matches.
    /// Rows linked by another thread never count as proof of a contact.
    async fn find_verified_by_contact(
        &self,
        contact: &Contact,
    ) -> Result<Option<Identity>, IdentityRepositoryError>;

    /// List every thread linked to a persistent user, oldest first.
    async fn list_by_persistent_user(
        &self,
        persistent_user_id: &PersistentUserId,
    ) -> Result<Vec<Identity>, IdentityRepositoryError>;

    /// Move an unverified row to `pending`, recording method and contact.
    async fn mark_pending(
        &self,
        thread_id: &ThreadId,
        method: VerificationMethod,
        contact: &Contact,
    ) -> Result<Option<Identity>, IdentityRepositoryError>;

    /// Move an unverified row to `verified` under the given persistent user.
    async fn mark_verified(
        &self,
        thread_id: &ThreadId,
        persistent_user_id: &PersistentUserId,
        at: DateTime<Utc>,
    ) -> Result<Option<Identity>, IdentityRepositoryError>;

    /// Link an unverified row to an existing persistent user after its data
    /// was merged into that user's root, recording the verified thread that
    /// pulled it in. Any unconfirmed method and contact on the row are
    /// cleared.
    async fn link_to_user(
        &self,
        thread_id: &ThreadId,
        persistent_user_id: &PersistentUserId,
        merged_into: &ThreadId,
        at: DateTime<Utc>,
    ) -> Result<Option<Identity>, IdentityRepositoryError>;
}
