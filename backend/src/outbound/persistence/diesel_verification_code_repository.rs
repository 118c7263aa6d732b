//! PostgreSQL-backed `VerificationCodeRepository` implementation.
//!
//! One code row exists per thread at a time: issuing deletes the previous
//! row and inserts the new one in a single transaction, and the partial
//! unique index `verification_codes_one_active_per_thread` rejects a second
//! unconsumed row if two issues race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};

use crate::domain::ports::{VerificationCodeRepository, VerificationCodeRepositoryError};
use crate::domain::{
    Contact, IdentityValidationError, PersistentUserId, ThreadId, VerificationCode,
    VerificationMethod,
};

use super::diesel_basic_error_mapping::{map_basic_diesel_error, map_basic_pool_error};
use super::models::{NewVerificationCodeRow, VerificationCodeRow};
use super::pool::{DbPool, PoolError};
use super::schema::verification_codes;

/// Diesel-backed implementation of the `VerificationCodeRepository` port.
#[derive(Clone)]
pub struct DieselVerificationCodeRepository {
    pool: DbPool,
}

impl DieselVerificationCodeRepository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_pool_error(error: PoolError) -> VerificationCodeRepositoryError {
    map_basic_pool_error(error, VerificationCodeRepositoryError::connection)
}

fn map_diesel_error(error: diesel::result::Error) -> VerificationCodeRepositoryError {
    map_basic_diesel_error(
        error,
        VerificationCodeRepositoryError::query,
        VerificationCodeRepositoryError::connection,
        VerificationCodeRepositoryError::query,
    )
}

fn corrupt(column: &str, error: IdentityValidationError) -> VerificationCodeRepositoryError {
    VerificationCodeRepositoryError::query(format!("stored {column} is invalid: {error}"))
}

fn row_to_code(row: VerificationCodeRow) -> Result<VerificationCode, VerificationCodeRepositoryError> {
    Ok(VerificationCode {
        thread_id: ThreadId::new(row.thread_id).map_err(|e| corrupt("thread_id", e))?,
        code: row.code,
        contact: Contact::from_stored(row.contact).map_err(|e| corrupt("contact", e))?,
        method: row
            .method
            .parse::<VerificationMethod>()
            .map_err(|e| corrupt("method", e))?,
        created_at: row.created_at,
        expires_at: row.expires_at,
        consumed_at: row.consumed_at,
        reserved_user_id: row
            .reserved_user_id
            .map(PersistentUserId::new)
            .transpose()
            .map_err(|e| corrupt("reserved_user_id", e))?,
    })
}

#[async_trait]
impl VerificationCodeRepository for DieselVerificationCodeRepository {
    async fn replace_active(
        &self,
        code: &VerificationCode,
    ) -> Result<(), VerificationCodeRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let new_row = NewVerificationCodeRow {
            thread_id: code.thread_id.as_ref(),
            code: &code.code,
            contact: code.contact.as_ref(),
            method: code.method.as_str(),
            created_at: code.created_at,
            expires_at: code.expires_at,
            reserved_user_id: code.reserved_user_id.as_ref().map(AsRef::as_ref),
        };

        conn.transaction(|conn| {
            async move {
                diesel::delete(
                    verification_codes::table
                        .filter(verification_codes::thread_id.eq(new_row.thread_id)),
                )
                .execute(conn)
                .await?;
                diesel::insert_into(verification_codes::table)
                    .values(&new_row)
                    .execute(conn)
                    .await?;
                Ok::<_, diesel::result::Error>(())
            }
            .scope_boxed()
        })
        .await
        .map_err(map_diesel_error)
    }

    async fn find_active(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<VerificationCode>, VerificationCodeRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        verification_codes::table
            .filter(verification_codes::thread_id.eq(thread_id.as_ref()))
            .filter(verification_codes::consumed_at.is_null())
            .select(VerificationCodeRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(map_diesel_error)?
            .map(row_to_code)
            .transpose()
    }

    async fn consume(
        &self,
        thread_id: &ThreadId,
        code: &str,
        reserved_user_id: &PersistentUserId,
        at: DateTime<Utc>,
    ) -> Result<bool, VerificationCodeRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let updated = diesel::update(
            verification_codes::table
                .filter(verification_codes::thread_id.eq(thread_id.as_ref()))
                .filter(verification_codes::code.eq(code))
                .filter(verification_codes::consumed_at.is_null()),
        )
        .set((
            verification_codes::consumed_at.eq(at),
            verification_codes::reserved_user_id.eq(reserved_user_id.as_ref()),
        ))
        .execute(&mut conn)
        .await
        .map_err(map_diesel_error)?;
        Ok(updated == 1)
    }

    async fn reinstate(
        &self,
        thread_id: &ThreadId,
        code: &str,
    ) -> Result<bool, VerificationCodeRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let updated = diesel::update(
            verification_codes::table
                .filter(verification_codes::thread_id.eq(thread_id.as_ref()))
                .filter(verification_codes::code.eq(code))
                .filter(verification_codes::consumed_at.is_not_null()),
        )
        .set(verification_codes::consumed_at.eq(None::<DateTime<Utc>>))
        .execute(&mut conn)
        .await
        .map_err(map_diesel_error)?;
        Ok(updated == 1)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, VerificationCodeRepositoryError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let deleted = diesel::delete(
            verification_codes::table.filter(verification_codes::expires_at.lt(now)),
        )
        .execute(&mut conn)
        .await
        .map_err(map_diesel_error)?;
        Ok(u64::try_from(deleted).unwrap_or(u64::MAX))
    }
}
