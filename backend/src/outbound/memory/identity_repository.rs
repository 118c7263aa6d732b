//! In-memory `IdentityRepository` implementation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::ports::{IdentityRepository, IdentityRepositoryError};
use crate::domain::{
    Contact, Identity, NewIdentity, PersistentUserId, ThreadId, VerificationMethod,
    VerificationStatus,
};

/// Identity table held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryIdentityRepository {
    rows: Mutex<HashMap<ThreadId, Identity>>,
}

impl InMemoryIdentityRepository {
    fn rows(&self) -> Result<MutexGuard<'_, HashMap<ThreadId, Identity>>, IdentityRepositoryError> {
        self.rows
            .lock()
            .map_err(|_| IdentityRepositoryError::query("identity table lock poisoned"))
    }

    /// Apply `change` to an unverified row and return the stored row.
    fn transition(
        &self,
        thread_id: &ThreadId,
        change: impl FnOnce(&mut Identity),
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        let mut rows = self.rows()?;
        let Some(row) = rows.get_mut(thread_id) else {
            return Ok(None);
        };
        if !row.is_verified() {
            change(row);
        }
        Ok(Some(row.clone()))
    }
}

#[async_trait]
impl IdentityRepository for InMemoryIdentityRepository {
    async fn create_or_get(&self, identity: &NewIdentity) -> Result<Identity, IdentityRepositoryError> {
        let mut rows = self.rows()?;
        if let Some(existing) = rows.get(&identity.thread_id) {
            return Ok(existing.clone());
        }
        let clash = rows
            .values()
            .any(|row| row.identity_id == identity.identity_id);
        if clash {
            return Err(IdentityRepositoryError::conflict(format!(
                "identity id {} is already taken",
                identity.identity_id
            )));
        }
        let row = Identity::anonymous(identity.clone());
        rows.insert(identity.thread_id.clone(), row.clone());
        Ok(row)
    }

    async fn find_by_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        Ok(self.rows()?.get(thread_id).cloned())
    }

    async fn find_verified_by_contact(
        &self,
        contact: &Contact,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        let rows = self.rows()?;
        Ok(rows
            .values()
            .filter(|row| {
                row.is_verified()
                    && row.merged_into_thread_id.is_none()
                    && row.verification_contact.as_ref() == Some(contact)
            })
            .min_by_key(|row| row.verified_at)
            .cloned())
    }

    async fn list_by_persistent_user(
        &self,
        persistent_user_id: &PersistentUserId,
    ) -> Result<Vec<Identity>, IdentityRepositoryError> {
        let rows = self.rows()?;
        let mut linked: Vec<_> = rows
            .values()
            .filter(|row| row.persistent_user_id.as_ref() == Some(persistent_user_id))
            .cloned()
            .collect();
        linked.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.thread_id.cmp(&b.thread_id))
        });
        Ok(linked)
    }

    async fn mark_pending(
        &self,
        thread_id: &ThreadId,
        method: VerificationMethod,
        contact: &Contact,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        self.transition(thread_id, |row| {
            row.verification_status = VerificationStatus::Pending;
            row.verification_method = Some(method);
            row.verification_contact = Some(contact.clone());
        })
    }

    async fn mark_verified(
        &self,
        thread_id: &ThreadId,
        persistent_user_id: &PersistentUserId,
        at: DateTime<Utc>,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        self.transition(thread_id, |row| {
            row.verification_status = VerificationStatus::Verified;
            row.persistent_user_id = Some(persistent_user_id.clone());
            row.verified_at = Some(at);
            row.merged_at = Some(at);
        })
    }

    async fn link_to_user(
        &self,
        thread_id: &ThreadId,
        persistent_user_id: &PersistentUserId,
        merged_into: &ThreadId,
        at: DateTime<Utc>,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        self.transition(thread_id, |row| {
            row.verification_status = VerificationStatus::Verified;
            row.persistent_user_id = Some(persistent_user_id.clone());
            row.verified_at = Some(at);
            row.merged_at = Some(at);
            row.merged_into_thread_id = Some(merged_into.clone());
            row.verification_method = None;
            row.verification_contact = None;
        })
    }
}
