//! Identity registry service.
//!
//! Thin domain layer over [`IdentityRepository`]: derives identity ids for new
//! threads, stamps timestamps from the injected clock, and maps adapter
//! failures into domain errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mockable::Clock;
use tracing::{debug, info};

use crate::domain::ports::{IdentityRepository, IdentityRepositoryError};
use crate::domain::{
    Contact, Error, Identity, IdentityId, NewIdentity, PersistentUserId, ThreadId,
    VerificationMethod,
};

fn map_repository_error(error: IdentityRepositoryError) -> Error {
    match error {
        IdentityRepositoryError::Connection { message } => {
            Error::service_unavailable(format!("identity registry unavailable: {message}"))
        }
        IdentityRepositoryError::Query { message } | IdentityRepositoryError::Conflict { message } => {
            Error::internal(format!("identity registry error: {message}"))
        }
    }
}

fn unknown_thread(thread_id: &ThreadId) -> Error {
    Error::not_found(format!("no identity is registered for thread {thread_id}"))
}

/// Result of moving a thread to `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkPendingOutcome {
    /// The thread now awaits confirmation.
    Pending(Identity),
    /// The thread was already verified; nothing changed.
    AlreadyVerified(PersistentUserId),
}

/// Registry of per-thread identities.
#[derive(Clone)]
pub struct IdentityRegistry {
    repository: Arc<dyn IdentityRepository>,
    clock: Arc<dyn Clock>,
}

impl IdentityRegistry {
    /// Create a registry over a repository and clock.
    pub fn new(repository: Arc<dyn IdentityRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.utc()
    }

    /// Return the identity of a thread, creating an anonymous one on first
    /// contact. Calling twice yields the same row.
    pub async fn create_or_get(
        &self,
        thread_id: &ThreadId,
        channel: &str,
        identifier: &str,
    ) -> Result<Identity, Error> {
        let new = NewIdentity {
            thread_id: thread_id.clone(),
            identity_id: IdentityId::derive(thread_id, channel, identifier),
            channel: channel.to_owned(),
            identifier: identifier.to_owned(),
            created_at: self.now(),
        };
        let identity = self
            .repository
            .create_or_get(&new)
            .await
            .map_err(map_repository_error)?;
        debug!(%thread_id, identity_id = %identity.identity_id, "identity ready");
        Ok(identity)
    }

    /// [`IdentityRegistry::create_or_get`] with channel and identifier taken
    /// from the thread id itself.
    pub async fn ensure(&self, thread_id: &ThreadId) -> Result<Identity, Error> {
        self.create_or_get(thread_id, thread_id.channel(), thread_id.identifier())
            .await
    }

    /// Fetch the identity of a known thread.
    pub async fn resolve(&self, thread_id: &ThreadId) -> Result<Identity, Error> {
        self.repository
            .find_by_thread(thread_id)
            .await
            .map_err(map_repository_error)?
            .ok_or_else(|| unknown_thread(thread_id))
    }

    /// Record a merge request on a thread.
    pub async fn mark_pending(
        &self,
        thread_id: &ThreadId,
        method: VerificationMethod,
        contact: &Contact,
    ) -> Result<MarkPendingOutcome, Error> {
        let identity = self
            .repository
            .mark_pending(thread_id, method, contact)
            .await
            .map_err(map_repository_error)?
            .ok_or_else(|| unknown_thread(thread_id))?;
        Ok(match verified_user(&identity) {
            Some(persistent_user_id) => MarkPendingOutcome::AlreadyVerified(persistent_user_id),
            None => MarkPendingOutcome::Pending(identity),
        })
    }

    /// Link a thread to `persistent_user_id` after its storage was merged.
    ///
    /// Returns the stored row; when the thread had already been verified the
    /// row keeps its original persistent user id.
    pub async fn mark_verified(
        &self,
        thread_id: &ThreadId,
        persistent_user_id: &PersistentUserId,
    ) -> Result<Identity, Error> {
        let identity = self
            .repository
            .mark_verified(thread_id, persistent_user_id, self.now())
            .await
            .map_err(map_repository_error)?
            .ok_or_else(|| unknown_thread(thread_id))?;
        info!(
            %thread_id,
            persistent_user_id = %identity.user_root_key(),
            "identity verified"
        );
        Ok(identity)
    }

    /// Link `thread_id` to the persistent user of the verified thread
    /// `merged_into`.
    pub async fn link_to_user(
        &self,
        thread_id: &ThreadId,
        persistent_user_id: &PersistentUserId,
        merged_into: &ThreadId,
    ) -> Result<Identity, Error> {
        let identity = self
            .repository
            .link_to_user(thread_id, persistent_user_id, merged_into, self.now())
            .await
            .map_err(map_repository_error)?
            .ok_or_else(|| unknown_thread(thread_id))?;
        info!(
            %thread_id,
            merged_into = %merged_into,
            persistent_user_id = %identity.user_root_key(),
            "identity linked"
        );
        Ok(identity)
    }

    /// Find a verified identity holding `contact`.
    pub async fn find_verified_by_contact(
        &self,
        contact: &Contact,
    ) -> Result<Option<Identity>, Error> {
        self.repository
            .find_verified_by_contact(contact)
            .await
            .map_err(map_repository_error)
    }

    /// Every thread linked to one persistent user.
    pub async fn list_threads_for_user(
        &self,
        persistent_user_id: &PersistentUserId,
    ) -> Result<Vec<Identity>, Error> {
        self.repository
            .list_by_persistent_user(persistent_user_id)
            .await
            .map_err(map_repository_error)
    }
}

/// Persistent user id of a verified identity.
pub(crate) fn verified_user(identity: &Identity) -> Option<PersistentUserId> {
    identity
        .persistent_user_id
        .clone()
        .filter(|_| identity.is_verified())
}

#[cfg(test)]
#[path = "identity_registry_tests.rs"]
mod tests;
