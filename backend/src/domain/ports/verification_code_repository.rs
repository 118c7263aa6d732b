//! Port abstraction for verification code persistence.
//!
//! At most one unconsumed code exists per thread. Issuing a code replaces any
//! earlier unconsumed code for the same thread, and consumption is a single
//! conditional write so a code can be spent only once even under concurrent
//! confirmations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{PersistentUserId, ThreadId, VerificationCode};

use super::define_port_error;

define_port_error! {
    /// Errors raised by verification code repository adapters.
    pub enum VerificationCodeRepositoryError {
        /// Repository connection could not be established.
        Connection { message: String } => "verification code repository connection failed: {message}",
        /// Query or mutation failed during execution.
        Query { message: String } => "verification code repository query failed: {message}",
    }
}

/// Port for issuing, spending and purging verification codes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VerificationCodeRepository: Send + Sync {
    /// Store `code`, discarding every unconsumed code previously issued for
    /// the same thread.
    async fn replace_active(&self, code: &VerificationCode) -> Result<(), VerificationCodeRepositoryError>;

    /// Return the unconsumed code for a thread, expired or not.
    async fn find_active(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<VerificationCode>, VerificationCodeRepositoryError>;

    /// Mark the matching unconsumed code consumed and record the persistent
    /// user it resolved to. Returns `false` when no unconsumed code matched,
    /// i.e. another confirmation already spent it.
    async fn consume(
        &self,
        thread_id: &ThreadId,
        code: &str,
        reserved_user_id: &PersistentUserId,
        at: DateTime<Utc>,
    ) -> Result<bool, VerificationCodeRepositoryError>;

    /// Undo [`VerificationCodeRepository::consume`] after a failed merge,
    /// keeping the reserved persistent user. Returns `false` when the code
    /// was replaced or purged in the meantime.
    async fn reinstate(
        &self,
        thread_id: &ThreadId,
        code: &str,
    ) -> Result<bool, VerificationCodeRepositoryError>;

    /// Delete every code whose expiry is before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, VerificationCodeRepositoryError>;
}
