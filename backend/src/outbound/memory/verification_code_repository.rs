//! In-memory `VerificationCodeRepository` implementation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::ports::{VerificationCodeRepository, VerificationCodeRepositoryError};
use crate::domain::{PersistentUserId, ThreadId, VerificationCode};

/// Codes held in process memory, one live slot per thread.
///
/// Consumed codes stay in their slot until the thread requests a new code or
/// they are purged, so a reinstate can find them.
#[derive(Debug, Default)]
pub struct InMemoryVerificationCodeRepository {
    slots: Mutex<HashMap<ThreadId, VerificationCode>>,
}

impl InMemoryVerificationCodeRepository {
    fn slots(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<ThreadId, VerificationCode>>, VerificationCodeRepositoryError>
    {
        self.slots
            .lock()
            .map_err(|_| VerificationCodeRepositoryError::query("verification code lock poisoned"))
    }
}

#[async_trait]
impl VerificationCodeRepository for InMemoryVerificationCodeRepository {
    async fn replace_active(
        &self,
        code: &VerificationCode,
    ) -> Result<(), VerificationCodeRepositoryError> {
        self.slots()?.insert(code.thread_id.clone(), code.clone());
        Ok(())
    }

    async fn find_active(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<VerificationCode>, VerificationCodeRepositoryError> {
        Ok(self
            .slots()?
            .get(thread_id)
            .filter(|code| code.consumed_at.is_none())
            .cloned())
    }

    async fn consume(
        &self,
        thread_id: &ThreadId,
        code: &str,
        reserved_user_id: &PersistentUserId,
        at: DateTime<Utc>,
    ) -> Result<bool, VerificationCodeRepositoryError> {
        let mut slots = self.slots()?;
        let Some(stored) = slots
            .get_mut(thread_id)
            .filter(|stored| stored.consumed_at.is_none() && stored.code == code)
        else {
            return Ok(false);
        };
        stored.consumed_at = Some(at);
        stored.reserved_user_id = Some(reserved_user_id.clone());
        Ok(true)
    }

    async fn reinstate(
        &self,
        thread_id: &ThreadId,
        code: &str,
    ) -> Result<bool, VerificationCodeRepositoryError> {
        let mut slots = self.slots()?;
        let Some(stored) = slots
            .get_mut(thread_id)
            .filter(|stored| stored.consumed_at.is_some() && stored.code == code)
        else {
            return Ok(false);
        };
        stored.consumed_at = None;
        Ok(true)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, VerificationCodeRepositoryError> {
        let mut slots = self.slots()?;
        let before = slots.len();
        slots.retain(|_, code| code.expires_at >= now);
        Ok(u64::try_from(before - slots.len()).unwrap_or(u64::MAX))
    }
}
