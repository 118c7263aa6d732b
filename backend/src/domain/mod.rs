//! Domain primitives, services and ports.
//!
//! Purpose: own identity resolution and storage isolation rules. Services
//! depend only on the traits in [`ports`]; adapters live in
//! [`crate::outbound`].
//!
//! Public surface:
//! - [`IdentityRegistry`]: per-thread identity rows and their lifecycle.
//! - [`ScopeResolver`]: maps a [`RequestContext`] to a storage root.
//! - [`VerificationService`]: merge request, confirmation and additional
//!   merges.
//! - [`MergeWorker`]: serialised, retried execution of storage merges.
//! - [`Manifest`]: per-root inventory document.

pub mod error;
pub mod identity;
mod identity_registry;
mod keyed_lock;
pub mod manifest;
mod merge;
mod merge_worker;
pub mod ports;
pub mod scope;
mod verification;

pub use self::error::{Error, ErrorCode, ErrorValidationError};
pub use self::identity::{
    Contact, IDENTIFIER_COMPONENT_MAX, Identity, IdentityId, IdentityValidationError, NewIdentity,
    PersistentUserId, THREAD_ID_MAX, ThreadId, UNKNOWN_CHANNEL, VerificationMethod,
    VerificationStatus,
};
pub use self::identity_registry::{IdentityRegistry, MarkPendingOutcome};
pub use self::keyed_lock::KeyedLocks;
pub use self::manifest::{EntryKind, MANIFEST_VERSION, Manifest, ManifestEntry, Provenance};
pub use self::merge::{MergeReport, MergeRequest, MovedItem, SkippedItem};
pub use self::merge_worker::{
    BackoffJitter, MergeWorker, MergeWorkerConfig, MergeWorkerRuntime, RandomJitter,
    RetrySleeper, TokioSleeper,
};
pub use self::scope::{
    AdminAllowList, GroupId, GroupIdValidationError, MANIFEST_FILE_NAME, RequestContext,
    ResolvedScope, ScopeKind, ScopeRequest, ScopeResolver, StorageCategory, StorageLayout,
};
pub use self::verification::{
    CODE_ALPHABET, CodeGenerator, DEFAULT_CODE_LENGTH, DEFAULT_CODE_TTL_MINUTES,
    RandomCodeGenerator, RequestMergeOutcome, VerificationCode, VerificationConfig,
    VerificationPorts, VerificationService, normalize_code,
};
