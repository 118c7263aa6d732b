//! Driving port used by the verification flow to run merges.

use async_trait::async_trait;

use crate::domain::{Error, MergeReport, MergeRequest};

/// Runs a merge to completion, including retries, and reports failures as
/// domain errors ([`crate::domain::ErrorCode::PartialMergeFailure`] or
/// [`crate::domain::ErrorCode::MergeConflict`]).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MergeExecutor: Send + Sync {
    async fn execute(&self, request: MergeRequest) -> Result<MergeReport, Error>;
}
