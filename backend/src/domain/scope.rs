//! Storage scope resolution.
//!
//! Every storage tool resolves its root through [`ScopeResolver`] before it
//! touches content. Resolution is a function of the explicit
//! [`RequestContext`] passed by the caller; no ambient "current thread" state
//! exists anywhere in the crate.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::ports::{RootProvisioner, RootProvisionerError};
use crate::domain::{Error, IdentityRegistry, ThreadId};

/// Directory holding the global shared root under the data root.
pub const SHARED_DIR: &str = "shared";
/// Directory holding one root per group under the data root.
pub const GROUPS_DIR: &str = "groups";
/// Directory holding one root per identity or persistent user.
pub const USERS_DIR: &str = "users";
/// File name of the per-root manifest document.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

const GROUP_ID_MAX: usize = 128;

/// Scope the caller asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeRequest {
    /// Group root when a group is present, otherwise the caller's user root.
    #[default]
    Context,
    /// The single global shared root.
    Shared,
}

/// Isolation tier a resolved root belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Global root visible to everyone; writes need admin rights.
    Shared,
    /// Root shared by the members of one group chat.
    Group,
    /// Root private to one identity or persistent user.
    User,
}

impl ScopeKind {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Group => "group",
            Self::User => "user",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage category directory present under every root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageCategory {
    /// Arbitrary user files.
    Files,
    /// Database files.
    Database,
    /// Vector-store collections.
    VectorStore,
    /// Memory store entries.
    Memory,
}

impl StorageCategory {
    /// Every category in merge order.
    pub const ALL: [Self; 4] = [Self::Files, Self::Database, Self::VectorStore, Self::Memory];

    /// Directory name under a root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Database => "db",
            Self::VectorStore => "vs",
            Self::Memory => "mem",
        }
    }
}

impl fmt::Display for StorageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Validation errors for [`GroupId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupIdValidationError {
    Empty,
    TooLong { max: usize },
    InvalidCharacters,
}

impl fmt::Display for GroupIdValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "group id must not be empty"),
            Self::TooLong { max } => write!(f, "group id must be at most {max} characters"),
            Self::InvalidCharacters => write!(
                f,
                "group id may only contain letters, digits, '_', '-' or '.', and must not start with '.'",
            ),
        }
    }
}

impl std::error::Error for GroupIdValidationError {}

/// Identifier of a group conversation; safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupId(String);

impl GroupId {
    /// Validate and construct a [`GroupId`].
    ///
    /// # Examples
    /// ```
    /// use identity_isolation::domain::GroupId;
    ///
    /// assert!(GroupId::new("eng").is_ok());
    /// assert!(GroupId::new("-100123").is_ok());
    /// assert!(GroupId::new("../etc").is_err());
    /// ```
    pub fn new(raw: impl Into<String>) -> Result<Self, GroupIdValidationError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(GroupIdValidationError::Empty);
        }
        if raw.chars().count() > GROUP_ID_MAX {
            return Err(GroupIdValidationError::TooLong { max: GROUP_ID_MAX });
        }
        let allowed = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !allowed || raw.starts_with('.') {
            return Err(GroupIdValidationError::InvalidCharacters);
        }
        Ok(Self(raw))
    }
}

impl AsRef<str> for GroupId {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<GroupId> for String {
    fn from(value: GroupId) -> Self {
        value.0
    }
}

impl TryFrom<String> for GroupId {
    type Error = GroupIdValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Explicit per-request context threaded through every storage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    thread_id: ThreadId,
    group_id: Option<GroupId>,
    scope: ScopeRequest,
}

impl RequestContext {
    /// Context for a direct conversation asking for its contextual scope.
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            group_id: None,
            scope: ScopeRequest::Context,
        }
    }

    /// Attach the group the message arrived in.
    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// Override the requested scope.
    pub fn with_scope(mut self, scope: ScopeRequest) -> Self {
        self.scope = scope;
        self
    }

    /// Calling thread.
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Group of the conversation, if any.
    pub fn group_id(&self) -> Option<&GroupId> {
        self.group_id.as_ref()
    }

    /// Requested scope.
    pub fn scope(&self) -> ScopeRequest {
        self.scope
    }
}

/// Physical layout of the storage roots below one data directory.
///
/// ```text
/// {data_root}/shared/
/// {data_root}/groups/{group_id}/
/// {data_root}/users/{identity_id or persistent_user_id}/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    data_root: PathBuf,
}

impl StorageLayout {
    /// Layout rooted at `data_root`.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    /// Top-level data directory.
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// The global shared root.
    pub fn shared_root(&self) -> PathBuf {
        self.data_root.join(SHARED_DIR)
    }

    /// Root of one group.
    pub fn group_root(&self, group_id: &GroupId) -> PathBuf {
        self.data_root.join(GROUPS_DIR).join(group_id.as_ref())
    }

    /// Root keyed by an identity id or persistent user id.
    pub fn user_root(&self, key: &str) -> PathBuf {
        self.data_root.join(USERS_DIR).join(key)
    }
}

/// Outcome of scope resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScope {
    kind: ScopeKind,
    key: String,
    root: PathBuf,
}

impl ResolvedScope {
    /// Build a resolved scope.
    pub fn new(kind: ScopeKind, key: impl Into<String>, root: PathBuf) -> Self {
        Self {
            kind,
            key: key.into(),
            root,
        }
    }

    /// Isolation tier.
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Directory key of the root (`shared`, the group id, or the user key).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one storage category.
    pub fn category_dir(&self, category: StorageCategory) -> PathBuf {
        self.root.join(category.dir_name())
    }

    /// Location of the manifest document.
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }
}

/// Threads allowed to write into the shared scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminAllowList {
    admins: HashSet<ThreadId>,
}

impl AdminAllowList {
    /// Build an allow-list from thread ids.
    pub fn new(admins: impl IntoIterator<Item = ThreadId>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }

    /// Parse a comma-separated list; blank and invalid entries are skipped
    /// with a warning.
    ///
    /// # Examples
    /// ```
    /// use identity_isolation::domain::{AdminAllowList, ThreadId};
    ///
    /// let admins = AdminAllowList::parse_csv("telegram:1, telegram:2,,");
    /// assert!(admins.is_admin(&ThreadId::new("telegram:2").unwrap()));
    /// assert_eq!(admins.len(), 2);
    /// ```
    pub fn parse_csv(raw: &str) -> Self {
        let admins = raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| match ThreadId::new(entry) {
                Ok(thread_id) => Some(thread_id),
                Err(error) => {
                    warn!(entry, %error, "ignoring invalid admin thread id");
                    None
                }
            });
        Self::new(admins)
    }

    /// Whether `thread_id` may write the shared scope.
    pub fn is_admin(&self, thread_id: &ThreadId) -> bool {
        self.admins.contains(thread_id)
    }

    /// Number of admins.
    pub fn len(&self) -> usize {
        self.admins.len()
    }

    /// Whether nobody may write the shared scope.
    pub fn is_empty(&self) -> bool {
        self.admins.is_empty()
    }
}

fn map_provision_error(error: RootProvisionerError) -> Error {
    Error::internal(format!("failed to prepare storage root: {error}"))
}

/// Resolves request contexts to storage roots.
///
/// Resolution never touches the filesystem; roots are created only by
/// [`ScopeResolver::prepare_write`].
#[derive(Clone)]
pub struct ScopeResolver {
    registry: IdentityRegistry,
    layout: StorageLayout,
    admins: AdminAllowList,
    provisioner: Arc<dyn RootProvisioner>,
}

impl ScopeResolver {
    /// Create a resolver over the registry and layout.
    pub fn new(
        registry: IdentityRegistry,
        layout: StorageLayout,
        admins: AdminAllowList,
        provisioner: Arc<dyn RootProvisioner>,
    ) -> Self {
        Self {
            registry,
            layout,
            admins,
            provisioner,
        }
    }

    /// Storage layout used for every root.
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Resolve the root for a read or for a caller that has its own write
    /// guard.
    ///
    /// A thread seen for the first time is registered as an anonymous
    /// identity whichever scope it asks for; repeated calls with an
    /// unchanged context return the same root until the thread becomes
    /// verified.
    pub async fn resolve(&self, context: &RequestContext) -> Result<ResolvedScope, Error> {
        let identity = self.registry.ensure(context.thread_id()).await?;
        let resolved = match (context.scope(), context.group_id()) {
            (ScopeRequest::Shared, _) => {
                ResolvedScope::new(ScopeKind::Shared, SHARED_DIR, self.layout.shared_root())
            }
            (ScopeRequest::Context, Some(group_id)) => ResolvedScope::new(
                ScopeKind::Group,
                group_id.as_ref(),
                self.layout.group_root(group_id),
            ),
            (ScopeRequest::Context, None) => {
                let key = identity.user_root_key().to_owned();
                let root = self.layout.user_root(&key);
                ResolvedScope::new(ScopeKind::User, key, root)
            }
        };
        debug!(
            thread_id = %context.thread_id(),
            kind = %resolved.kind(),
            key = resolved.key(),
            "scope resolved"
        );
        Ok(resolved)
    }

    /// Resolve the root for a write and create its directories.
    ///
    /// Shared-scope writes are refused with
    /// [`crate::domain::ErrorCode::PermissionDenied`] unless the calling
    /// thread is an admin; there is no fallback to another scope.
    pub async fn prepare_write(&self, context: &RequestContext) -> Result<ResolvedScope, Error> {
        let resolved = self.resolve(context).await?;
        if resolved.kind() == ScopeKind::Shared && !self.admins.is_admin(context.thread_id()) {
            warn!(thread_id = %context.thread_id(), "shared scope write refused");
            return Err(Error::permission_denied(
                "writing to the shared scope requires admin rights",
            ));
        }
        let provisioner = Arc::clone(&self.provisioner);
        let target = resolved.clone();
        tokio::task::spawn_blocking(move || provisioner.ensure(&target))
            .await
            .map_err(|error| Error::internal(format!("provisioning task failed: {error}")))?
            .map_err(map_provision_error)?;
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests;
