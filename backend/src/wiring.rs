//! Composition of services and adapters from [`IsolationSettings`].
//!
//! [`Isolation`] is the entry point embedders use: it owns one registry,
//! resolver and verification service sharing the same repositories, storage
//! layout and merge worker.

use std::sync::Arc;

use mockable::Clock;
use tracing::{info, warn};

use crate::config::IsolationSettings;
use crate::domain::ports::{
    IdentityRepository, ManifestStore, NotificationSender, VerificationCodeRepository,
};
use crate::domain::{
    Error, Identity, IdentityRegistry, Manifest, MergeWorker, PersistentUserId, RequestContext,
    RequestMergeOutcome, ResolvedScope, ScopeResolver, StorageLayout, ThreadId,
    VerificationMethod, VerificationPorts, VerificationService,
};
use crate::outbound::memory::{InMemoryIdentityRepository, InMemoryVerificationCodeRepository};
use crate::outbound::notification::LoggingNotificationSender;
use crate::outbound::persistence::{
    DbPool, DieselIdentityRepository, DieselVerificationCodeRepository, PoolConfig,
};
use crate::outbound::storage::{CapStdRootProvisioner, FsManifestStore, FsMergeCoordinator};

/// Repository and delivery adapters plugged into [`Isolation`].
#[derive(Clone)]
pub struct IsolationPorts {
    /// Identity registry storage.
    pub identities: Arc<dyn IdentityRepository>,
    /// Verification code storage.
    pub codes: Arc<dyn VerificationCodeRepository>,
    /// Code delivery.
    pub notifier: Arc<dyn NotificationSender>,
}

impl IsolationPorts {
    /// In-process repositories with log-only delivery.
    pub fn in_memory() -> Self {
        Self {
            identities: Arc::new(InMemoryIdentityRepository::default()),
            codes: Arc::new(InMemoryVerificationCodeRepository::default()),
            notifier: Arc::new(LoggingNotificationSender),
        }
    }

    /// PostgreSQL repositories sharing `pool`, with log-only delivery.
    pub fn postgres(pool: &DbPool) -> Self {
        Self {
            identities: Arc::new(DieselIdentityRepository::new(pool.clone())),
            codes: Arc::new(DieselVerificationCodeRepository::new(pool.clone())),
            notifier: Arc::new(LoggingNotificationSender),
        }
    }

    /// Replace the delivery adapter.
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSender>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// Fully wired identity and storage isolation subsystem.
#[derive(Clone)]
pub struct Isolation {
    registry: IdentityRegistry,
    resolver: ScopeResolver,
    verification: VerificationService,
    manifests: Arc<dyn ManifestStore>,
}

impl Isolation {
    /// Wire services over the given adapters.
    pub fn from_ports(
        settings: &IsolationSettings,
        ports: IsolationPorts,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let layout = settings.layout();
        let manifests: Arc<dyn ManifestStore> = Arc::new(FsManifestStore::new(clock.clone()));
        let registry = IdentityRegistry::new(ports.identities, clock.clone());
        let resolver = ScopeResolver::new(
            registry.clone(),
            layout.clone(),
            settings.admins(),
            Arc::new(CapStdRootProvisioner::new(manifests.clone())),
        );
        let merger = Arc::new(FsMergeCoordinator::new(manifests.clone(), clock.clone()));
        let worker = MergeWorker::new(merger, clock, settings.merge_worker());
        let verification = VerificationService::new(
            registry.clone(),
            VerificationPorts {
                codes: ports.codes,
                notifier: ports.notifier,
                merges: Arc::new(worker),
            },
            layout,
            settings.verification(),
        );
        Self {
            registry,
            resolver,
            verification,
            manifests,
        }
    }

    /// Wire services over in-process repositories.
    pub fn in_memory(settings: &IsolationSettings, clock: Arc<dyn Clock>) -> Self {
        Self::from_ports(settings, IsolationPorts::in_memory(), clock)
    }

    /// Wire services over PostgreSQL when a database URL is configured,
    /// otherwise over in-process repositories.
    pub async fn connect(settings: &IsolationSettings, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let Some(url) = settings.database_url() else {
            warn!("no database URL configured; identities are kept in memory");
            return Ok(Self::in_memory(settings, clock));
        };
        let pool = DbPool::new(PoolConfig::new(url))
            .await
            .map_err(|error| Error::service_unavailable(error.to_string()))?;
        info!("identity registry connected to postgres");
        Ok(Self::from_ports(settings, IsolationPorts::postgres(&pool), clock))
    }

    /// Identity registry.
    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Scope resolver.
    pub fn resolver(&self) -> &ScopeResolver {
        &self.resolver
    }

    /// Verification service.
    pub fn verification(&self) -> &VerificationService {
        &self.verification
    }

    /// Storage layout of every root.
    pub fn layout(&self) -> &StorageLayout {
        self.resolver.layout()
    }

    /// Resolve the storage root for a read.
    pub async fn resolve_scope(&self, context: &RequestContext) -> Result<ResolvedScope, Error> {
        self.resolver.resolve(context).await
    }

    /// Resolve and create the storage root for a write.
    pub async fn prepare_write(&self, context: &RequestContext) -> Result<ResolvedScope, Error> {
        self.resolver.prepare_write(context).await
    }

    /// Start verification of `thread_id` against `contact`.
    pub async fn request_merge(
        &self,
        thread_id: &ThreadId,
        contact: &str,
        method: VerificationMethod,
    ) -> Result<RequestMergeOutcome, Error> {
        self.verification
            .request_merge(thread_id, contact, method)
            .await
    }

    /// Confirm a code and merge the thread into its persistent user.
    pub async fn confirm_merge(
        &self,
        thread_id: &ThreadId,
        code: &str,
    ) -> Result<PersistentUserId, Error> {
        self.verification.confirm_merge(thread_id, code).await
    }

    /// Merge another thread into the caller's persistent user.
    pub async fn merge_additional(
        &self,
        caller_thread_id: &ThreadId,
        other_thread_id: &ThreadId,
    ) -> Result<Identity, Error> {
        self.verification
            .merge_additional(caller_thread_id, other_thread_id)
            .await
    }

    /// Delete expired verification codes.
    pub async fn purge_expired_codes(&self) -> Result<u64, Error> {
        self.verification.purge_expired().await
    }

    /// Read a root's manifest, rebuilding it when stale.
    pub async fn read_manifest(&self, scope: &ResolvedScope) -> Result<Manifest, Error> {
        let manifests = Arc::clone(&self.manifests);
        let root = scope.root().to_path_buf();
        tokio::task::spawn_blocking(move || manifests.read(&root))
            .await
            .map_err(|error| Error::internal(format!("manifest task failed: {error}")))?
            .map_err(|error| Error::internal(error.to_string()))
    }

    /// Rescan a root and persist a fresh manifest.
    pub async fn rebuild_manifest(&self, scope: &ResolvedScope) -> Result<Manifest, Error> {
        let manifests = Arc::clone(&self.manifests);
        let root = scope.root().to_path_buf();
        tokio::task::spawn_blocking(move || manifests.rebuild(&root))
            .await
            .map_err(|error| Error::internal(format!("manifest task failed: {error}")))?
            .map_err(|error| Error::internal(error.to_string()))
    }
}
