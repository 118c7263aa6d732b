//! PostgreSQL-backed `IdentityRepository` implementation using Diesel ORM.
//!
//! Status transitions are single conditional `UPDATE ... RETURNING`
//! statements guarded by `verification_status <> 'verified'`, so a verified
//! row is never rewritten and concurrent transitions for one thread are
//! linearised by the row lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::domain::ports::{IdentityRepository, IdentityRepositoryError};
use crate::domain::{
    Contact, Identity, IdentityId, IdentityValidationError, NewIdentity, PersistentUserId,
    ThreadId, VerificationMethod, VerificationStatus,
};

use super::diesel_basic_error_mapping::{map_basic_diesel_error, map_basic_pool_error};
use super::models::{IdentityRow, NewIdentityRow};
use super::pool::{DbPool, PoolError};
use super::schema::identities;

const VERIFIED: &str = "verified";

/// Diesel-backed implementation of the `IdentityRepository` port.
#[derive(Clone)]
pub struct DieselIdentityRepository {
    pool: DbPool,
}

impl DieselIdentityRepository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, thread_id: &ThreadId) -> Result<Option<Identity>, IdentityRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        identities::table
            .find(thread_id.as_ref())
            .select(IdentityRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?
            .map(row_to_identity)
            .transpose()
    }

    /// Return the updated row, or the stored one when the guard rejected the
    /// update because the thread is already verified.
    async fn updated_or_current(
        &self,
        thread_id: &ThreadId,
        updated: Option<IdentityRow>,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        match updated {
            Some(row) => row_to_identity(row).map(Some),
            None => self.fetch(thread_id).await,
        }
    }
}

fn map_pool_error(error: PoolError) -> IdentityRepositoryError {
    map_basic_pool_error(error, IdentityRepositoryError::connection)
}

fn map_diesel_error(error: diesel::result::Error) -> IdentityRepositoryError {
    map_basic_diesel_error(
        error,
        IdentityRepositoryError::query,
        IdentityRepositoryError::connection,
        IdentityRepositoryError::conflict,
    )
}

fn corrupt(column: &str, error: IdentityValidationError) -> IdentityRepositoryError {
    IdentityRepositoryError::query(format!("stored {column} is invalid: {error}"))
}

/// Convert a database row to a domain identity.
fn row_to_identity(row: IdentityRow) -> Result<Identity, IdentityRepositoryError> {
    Ok(Identity {
        thread_id: ThreadId::new(row.thread_id).map_err(|e| corrupt("thread_id", e))?,
        identity_id: IdentityId::from_stored(row.identity_id)
            .map_err(|e| corrupt("identity_id", e))?,
        channel: row.channel,
        identifier: row.identifier,
        persistent_user_id: row
            .persistent_user_id
            .map(PersistentUserId::new)
            .transpose()
            .map_err(|e| corrupt("persistent_user_id", e))?,
        verification_status: row
            .verification_status
            .parse::<VerificationStatus>()
            .map_err(|e| corrupt("verification_status", e))?,
        verification_method: row
            .verification_method
            .as_deref()
            .map(str::parse::<VerificationMethod>)
            .transpose()
            .map_err(|e| corrupt("verification_method", e))?,
        verification_contact: row
            .verification_contact
            .map(Contact::from_stored)
            .transpose()
            .map_err(|e| corrupt("verification_contact", e))?,
        created_at: row.created_at,
        verified_at: row.verified_at,
        merged_at: row.merged_at,
        merged_into_thread_id: row
            .merged_into_thread_id
            .map(ThreadId::new)
            .transpose()
            .map_err(|e| corrupt("merged_into_thread_id", e))?,
    })
}

#[async_trait]
impl IdentityRepository for DieselIdentityRepository {
    async fn create_or_get(&self, identity: &NewIdentity) -> Result<Identity, IdentityRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let new_row = NewIdentityRow {
            thread_id: identity.thread_id.as_ref(),
            identity_id: identity.identity_id.as_ref(),
            channel: &identity.channel,
            identifier: &identity.identifier,
            verification_status: VerificationStatus::Anonymous.as_str(),
            created_at: identity.created_at,
        };

        diesel::insert_into(identities::table)
            .values(&new_row)
            .on_conflict(identities::thread_id)
            .do_nothing()
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;

        let row = identities::table
            .find(identity.thread_id.as_ref())
            .select(IdentityRow::as_select())
            .first(&mut conn)
            .await
            .map_err(map_diesel_error)?;
        row_to_identity(row)
    }

    async fn find_by_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        self.fetch(thread_id).await
    }

    async fn find_verified_by_contact(
        &self,
        contact: &Contact,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        identities::table
            .filter(identities::verification_status.eq(VERIFIED))
            .filter(identities::verification_contact.eq(contact.as_ref()))
            .filter(identities::merged_into_thread_id.is_null())
            .order((identities::verified_at.asc(), identities::thread_id.asc()))
            .select(IdentityRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?
            .map(row_to_identity)
            .transpose()
    }

    async fn list_by_persistent_user(
        &self,
        persistent_user_id: &PersistentUserId,
    ) -> Result<Vec<Identity>, IdentityRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        identities::table
            .filter(identities::persistent_user_id.eq(persistent_user_id.as_ref()))
            .order((identities::created_at.asc(), identities::thread_id.asc()))
            .select(IdentityRow::as_select())
            .load(&mut conn)
            .await
            .map_err(map_diesel_error)?
            .into_iter()
            .map(row_to_identity)
            .collect()
    }

    async fn mark_pending(
        &self,
        thread_id: &ThreadId,
        method: VerificationMethod,
        contact: &Contact,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        let updated = {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            diesel::update(
                identities::table
                    .find(thread_id.as_ref())
                    .filter(identities::verification_status.ne(VERIFIED)),
            )
            .set((
                identities::verification_status.eq(VerificationStatus::Pending.as_str()),
                identities::verification_method.eq(method.as_str()),
                identities::verification_contact.eq(contact.as_ref()),
            ))
            .returning(IdentityRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?
        };
        self.updated_or_current(thread_id, updated).await
    }

    async fn mark_verified(
        &self,
        thread_id: &ThreadId,
        persistent_user_id: &PersistentUserId,
        at: DateTime<Utc>,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        let updated = {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            diesel::update(
                identities::table
                    .find(thread_id.as_ref())
                    .filter(identities::verification_status.ne(VERIFIED)),
            )
            .set((
                identities::verification_status.eq(VERIFIED),
                identities::persistent_user_id.eq(persistent_user_id.as_ref()),
                identities::verified_at.eq(at),
                identities::merged_at.eq(at),
            ))
            .returning(IdentityRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?
        };
        self.updated_or_current(thread_id, updated).await
    }

    async fn link_to_user(
        &self,
        thread_id: &ThreadId,
        persistent_user_id: &PersistentUserId,
        merged_into: &ThreadId,
        at: DateTime<Utc>,
    ) -> Result<Option<Identity>, IdentityRepositoryError> {
        let updated = {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            diesel::update(
                identities::table
                    .find(thread_id.as_ref())
                    .filter(identities::verification_status.ne(VERIFIED)),
            )
            .set((
                identities::verification_status.eq(VERIFIED),
                identities::persistent_user_id.eq(persistent_user_id.as_ref()),
                identities::verified_at.eq(at),
                identities::merged_at.eq(at),
                identities::merged_into_thread_id.eq(merged_into.as_ref()),
                identities::verification_method.eq(None::<&str>),
                identities::verification_contact.eq(None::<&str>),
            ))
            .returning(IdentityRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?
        };
        self.updated_or_current(thread_id, updated).await
    }
}
