//! Verification and identity merge flows.
//!
//! A thread proves ownership of a contact by echoing a short-lived code. On
//! confirmation its anonymous root is merged into the persistent user root of
//! that contact, minting the persistent user on first verification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::domain::identity_registry::verified_user;
use crate::domain::keyed_lock::KeyedLocks;
use crate::domain::ports::{
    MergeExecutor, NotificationSender, VerificationCodeRepository,
    VerificationCodeRepositoryError,
};
use crate::domain::{
    Contact, Error, Identity, IdentityRegistry, MarkPendingOutcome, MergeReport, MergeRequest,
    PersistentUserId, StorageLayout, ThreadId, VerificationMethod,
};

mod code;

pub use code::{
    CODE_ALPHABET, CODE_LENGTH_RANGE, CODE_TTL_MINUTES_RANGE, CodeGenerator,
    DEFAULT_CODE_LENGTH, DEFAULT_CODE_TTL_MINUTES, RandomCodeGenerator, VerificationCode,
    VerificationConfig, normalize_code,
};
#[cfg(test)]
pub use code::MockCodeGenerator;

fn map_code_repository_error(error: VerificationCodeRepositoryError) -> Error {
    match error {
        VerificationCodeRepositoryError::Connection { message } => {
            Error::service_unavailable(format!("verification code store unavailable: {message}"))
        }
        VerificationCodeRepositoryError::Query { message } => {
            Error::internal(format!("verification code store error: {message}"))
        }
    }
}

fn invalid_code() -> Error {
    Error::invalid_code(
        "the code is incorrect or has already been used; check it or request a new code",
    )
}

fn expired_code() -> Error {
    Error::expired_code("the code has expired; request a new code to continue")
}

/// Result of a merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestMergeOutcome {
    /// A code was issued and handed to the notification sender.
    CodeIssued {
        /// When the code stops being accepted.
        expires_at: DateTime<Utc>,
    },
    /// The thread is already verified; no code was issued.
    AlreadyVerified(PersistentUserId),
}

/// Port bundle required by the verification service.
#[derive(Clone)]
pub struct VerificationPorts {
    /// Code persistence adapter.
    pub codes: Arc<dyn VerificationCodeRepository>,
    /// Code delivery adapter.
    pub notifier: Arc<dyn NotificationSender>,
    /// Storage merge runner.
    pub merges: Arc<dyn MergeExecutor>,
}

/// Verification service implementing merge request, confirmation and
/// additional-thread merges.
#[derive(Clone)]
pub struct VerificationService {
    registry: IdentityRegistry,
    ports: VerificationPorts,
    layout: StorageLayout,
    generator: Arc<dyn CodeGenerator>,
    config: VerificationConfig,
    contact_locks: Arc<KeyedLocks>,
}

impl VerificationService {
    /// Create a service drawing codes from [`RandomCodeGenerator`].
    pub fn new(
        registry: IdentityRegistry,
        ports: VerificationPorts,
        layout: StorageLayout,
        config: VerificationConfig,
    ) -> Self {
        Self::with_generator(registry, ports, layout, config, Arc::new(RandomCodeGenerator))
    }

    /// Create a service with an injected code generator.
    pub fn with_generator(
        registry: IdentityRegistry,
        ports: VerificationPorts,
        layout: StorageLayout,
        config: VerificationConfig,
        generator: Arc<dyn CodeGenerator>,
    ) -> Self {
        Self {
            registry,
            ports,
            layout,
            generator,
            config,
            contact_locks: Arc::new(KeyedLocks::default()),
        }
    }

    /// Issue a code for `thread_id` and send it to `contact`.
    ///
    /// Any earlier unconsumed code of the thread stops being accepted.
    /// Delivery is fire-and-forget: a failed send is logged, not returned.
    pub async fn request_merge(
        &self,
        thread_id: &ThreadId,
        contact: &str,
        method: VerificationMethod,
    ) -> Result<RequestMergeOutcome, Error> {
        let contact = Contact::new(method, contact)
            .map_err(|err| Error::invalid_request(format!("invalid contact: {err}")))?;
        let identity = self.registry.resolve(thread_id).await?;
        if let Some(persistent_user_id) = verified_user(&identity) {
            return Ok(RequestMergeOutcome::AlreadyVerified(persistent_user_id));
        }

        if let MarkPendingOutcome::AlreadyVerified(persistent_user_id) = self
            .registry
            .mark_pending(thread_id, method, &contact)
            .await?
        {
            return Ok(RequestMergeOutcome::AlreadyVerified(persistent_user_id));
        }

        let previous = self
            .ports
            .codes
            .find_active(thread_id)
            .await
            .map_err(map_code_repository_error)?;
        let mut code = VerificationCode::issue(
            thread_id.clone(),
            self.generator.generate(self.config.code_length()),
            contact.clone(),
            method,
            self.registry.now(),
            &self.config,
        );
        // A reinstated code may already have moved data into its user.
        code.reserved_user_id = previous
            .filter(|previous| previous.contact == contact)
            .and_then(|previous| previous.reserved_user_id);
        self.ports
            .codes
            .replace_active(&code)
            .await
            .map_err(map_code_repository_error)?;
        info!(%thread_id, %method, expires_at = %code.expires_at, "verification code issued");

        let message = format!(
            "Your verification code is {}. It expires in {} minutes.",
            code.code,
            self.config.ttl_minutes()
        );
        if let Err(error) = self.ports.notifier.send(&contact, &message).await {
            warn!(%thread_id, %method, %error, "verification code delivery failed");
        }

        Ok(RequestMergeOutcome::CodeIssued {
            expires_at: code.expires_at,
        })
    }

    /// Confirm a code and link the thread to a persistent user.
    ///
    /// Reuses the persistent user of any thread already verified with the
    /// same contact, otherwise mints one. A failed merge or a failed status
    /// update leaves the code usable again, still reserved for the same
    /// persistent user, and the thread anonymous. The work runs in its own
    /// task, so a caller that stops waiting cannot strand moved data without
    /// the identity update.
    pub async fn confirm_merge(
        &self,
        thread_id: &ThreadId,
        code: &str,
    ) -> Result<PersistentUserId, Error> {
        let service = self.clone();
        let thread_id = thread_id.clone();
        let code = code.to_owned();
        tokio::spawn(async move { service.confirm_to_completion(&thread_id, &code).await })
            .await
            .map_err(|error| Error::internal(format!("confirmation task failed: {error}")))?
    }

    async fn confirm_to_completion(
        &self,
        thread_id: &ThreadId,
        code: &str,
    ) -> Result<PersistentUserId, Error> {
        let identity = self.registry.resolve(thread_id).await?;
        let active = self
            .ports
            .codes
            .find_active(thread_id)
            .await
            .map_err(map_code_repository_error)?
            .ok_or_else(invalid_code)?;
        if !active.matches(code) {
            return Err(invalid_code());
        }
        if active.is_expired(self.registry.now()) {
            return Err(expired_code());
        }

        let _contact_guard = self.contact_locks.acquire(active.contact.as_ref()).await?;
        let persistent_user_id = self.choose_persistent_user(&active).await?;
        let consumed = self
            .ports
            .codes
            .consume(thread_id, &active.code, &persistent_user_id, self.registry.now())
            .await
            .map_err(map_code_repository_error)?;
        if !consumed {
            return Err(invalid_code());
        }

        let identity = match verified_user(&self.registry.resolve(thread_id).await?) {
            Some(existing) => {
                info!(%thread_id, persistent_user_id = %existing, "thread was already verified");
                return Ok(existing);
            }
            None => identity,
        };

        if let Err(error) = self.merge_into(&identity, &persistent_user_id).await {
            self.reinstate(thread_id, &active.code).await;
            return Err(error);
        }

        let verified = match self
            .registry
            .mark_verified(thread_id, &persistent_user_id)
            .await
        {
            Ok(verified) => verified,
            Err(error) => {
                warn!(
                    %thread_id,
                    %persistent_user_id,
                    %error,
                    "storage merged but the identity was not updated"
                );
                self.reinstate(thread_id, &active.code).await;
                return Err(error);
            }
        };
        Ok(verified_user(&verified).unwrap_or(persistent_user_id))
    }

    /// Merge `other_thread_id` into the persistent user of the verified
    /// `caller_thread_id`. Repeating the call is harmless.
    pub async fn merge_additional(
        &self,
        caller_thread_id: &ThreadId,
        other_thread_id: &ThreadId,
    ) -> Result<Identity, Error> {
        let caller = self.registry.resolve(caller_thread_id).await?;
        let persistent_user_id = verified_user(&caller).ok_or_else(|| {
            Error::permission_denied("only a verified thread can merge other threads into its user")
        })?;
        if caller_thread_id == other_thread_id {
            return Err(Error::invalid_request("a thread cannot be merged into itself"));
        }

        let other = self.registry.resolve(other_thread_id).await?;
        match verified_user(&other) {
            Some(existing) if existing == persistent_user_id => return Ok(other),
            Some(_) => {
                return Err(Error::invalid_request(format!(
                    "thread {other_thread_id} already belongs to another user"
                )));
            }
            None => {}
        }

        self.merge_into(&other, &persistent_user_id).await?;
        self.registry
            .link_to_user(other_thread_id, &persistent_user_id, caller_thread_id)
            .await
    }

    /// Delete codes past their expiry.
    pub async fn purge_expired(&self) -> Result<u64, Error> {
        let purged = self
            .ports
            .codes
            .purge_expired(self.registry.now())
            .await
            .map_err(map_code_repository_error)?;
        if purged > 0 {
            info!(purged, "expired verification codes purged");
        }
        Ok(purged)
    }

    async fn choose_persistent_user(
        &self,
        active: &VerificationCode,
    ) -> Result<PersistentUserId, Error> {
        if let Some(reserved) = &active.reserved_user_id {
            return Ok(reserved.clone());
        }
        let existing = self
            .registry
            .find_verified_by_contact(&active.contact)
            .await?
            .as_ref()
            .and_then(verified_user);
        Ok(existing.unwrap_or_else(PersistentUserId::mint))
    }

    async fn merge_into(
        &self,
        source: &Identity,
        persistent_user_id: &PersistentUserId,
    ) -> Result<MergeReport, Error> {
        let request = MergeRequest {
            source_thread_id: source.thread_id.clone(),
            source_identity_id: source.identity_id.clone(),
            source_root: self.layout.user_root(source.identity_id.as_ref()),
            destination_key: persistent_user_id.as_ref().to_owned(),
            destination_root: self.layout.user_root(persistent_user_id.as_ref()),
        };
        self.ports.merges.execute(request).await
    }

    async fn reinstate(&self, thread_id: &ThreadId, code: &str) {
        match self.ports.codes.reinstate(thread_id, code).await {
            Ok(true) => {}
            Ok(false) => warn!(%thread_id, "verification code was replaced before it could be reinstated"),
            Err(error) => warn!(%thread_id, %error, "failed to reinstate verification code"),
        }
    }
}
