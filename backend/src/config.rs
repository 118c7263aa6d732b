//! Runtime settings loaded via OrthoConfig.
//!
//! Values come from CLI flags, `ISOLATION_*` environment variables or a
//! config file, and are turned into the typed configs the services take.

use std::path::PathBuf;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::domain::{
    AdminAllowList, DEFAULT_CODE_LENGTH, DEFAULT_CODE_TTL_MINUTES, MergeWorkerConfig,
    StorageLayout, VerificationConfig,
};

const DEFAULT_DATA_ROOT: &str = "data";
const DEFAULT_MERGE_MAX_ATTEMPTS: u32 = 3;

/// Settings for the identity and storage isolation subsystem.
#[derive(Debug, Clone, Default, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "ISOLATION")]
pub struct IsolationSettings {
    /// Directory holding the `shared/`, `groups/` and `users/` trees.
    pub data_root: Option<PathBuf>,
    /// Comma-separated thread ids allowed to write the shared scope.
    pub admins: Option<String>,
    /// Verification code lifetime in minutes.
    pub code_ttl_minutes: Option<i64>,
    /// Number of characters in a verification code.
    pub code_length: Option<usize>,
    /// Attempts per storage merge, including the first.
    pub merge_max_attempts: Option<u32>,
    /// PostgreSQL URL; in-process repositories are used when absent.
    pub database_url: Option<String>,
}

impl IsolationSettings {
    /// Configured data root, or `data` relative to the working directory.
    pub fn data_root(&self) -> PathBuf {
        self.data_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT))
    }

    /// Storage layout rooted at [`Self::data_root`].
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(self.data_root())
    }

    /// Parsed admin allow-list; invalid entries are dropped with a warning.
    pub fn admins(&self) -> AdminAllowList {
        self.admins
            .as_deref()
            .map(AdminAllowList::parse_csv)
            .unwrap_or_default()
    }

    /// Code TTL and length, clamped to their supported ranges.
    pub fn verification(&self) -> VerificationConfig {
        VerificationConfig::new(
            self.code_ttl_minutes.unwrap_or(DEFAULT_CODE_TTL_MINUTES),
            self.code_length.unwrap_or(DEFAULT_CODE_LENGTH),
        )
    }

    /// Merge retry policy.
    pub fn merge_worker(&self) -> MergeWorkerConfig {
        MergeWorkerConfig {
            max_attempts: self
                .merge_max_attempts
                .unwrap_or(DEFAULT_MERGE_MAX_ATTEMPTS)
                .max(1),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }

    /// Database URL, ignoring blank values.
    pub fn database_url(&self) -> Option<&str> {
        self.database_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}
