//! Background execution of storage merges.
//!
//! The worker owns destination serialisation (one in-flight merge per
//! destination root), moves the blocking filesystem work off the async
//! executor, and retries I/O failures with jittered exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde_json::json;
use tracing::{info, warn};

use crate::domain::keyed_lock::KeyedLocks;
use crate::domain::ports::{MergeExecutor, StorageMergeError, StorageMerger};
use crate::domain::{Error, MergeReport, MergeRequest};

mod runtime;

pub use runtime::{MergeWorkerRuntime, RandomJitter, TokioSleeper};

/// Retry configuration for merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeWorkerConfig {
    /// Maximum merge attempts (including the first).
    pub max_attempts: u32,
    /// Initial retry backoff.
    pub initial_backoff: Duration,
    /// Maximum retry backoff cap.
    pub max_backoff: Duration,
}

impl Default for MergeWorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Async sleeping abstraction for retries.
#[async_trait]
pub trait RetrySleeper: Send + Sync {
    /// Suspend execution for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Retry backoff jitter abstraction.
pub trait BackoffJitter: Send + Sync {
    /// Return a jittered delay from the exponential base delay.
    ///
    /// ```rust
    /// use identity_isolation::domain::BackoffJitter;
    /// use chrono::{TimeZone, Utc};
    /// use std::time::Duration;
    /// struct Fixed;
    /// impl BackoffJitter for Fixed {
    ///     fn jittered_delay(&self, base: Duration, attempt: u32, _now: chrono::DateTime<chrono::Utc>) -> Duration {
    ///         base + Duration::from_millis(u64::from(attempt))
    ///     }
    /// }
    /// let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time");
    /// assert_eq!(Fixed.jittered_delay(Duration::from_millis(100), 2, now), Duration::from_millis(102));
    /// ```
    fn jittered_delay(&self, base: Duration, attempt: u32, now: DateTime<Utc>) -> Duration;
}

enum AttemptError {
    Storage(StorageMergeError),
    Join(String),
}

fn map_merge_error(error: StorageMergeError, attempts: u32) -> Error {
    let category = error.stage();
    match error {
        StorageMergeError::Io { message, .. } | StorageMergeError::Manifest { message } => {
            Error::partial_merge_failure(format!(
                "merge stopped at {category}; no data was lost and the merge can be retried: {message}"
            ))
            .with_details(json!({ "category": category, "attempts": attempts }))
        }
        StorageMergeError::Conflict { name, .. } => Error::merge_conflict(format!(
            "cannot place {category}/{name}: both the original and relabelled names are taken"
        ))
        .with_details(json!({ "category": category, "name": name })),
    }
}

/// Domain-owned merge worker.
///
/// Each merge runs in its own task that holds the destination lock until the
/// last attempt ends, so dropping the caller's future never lets a second
/// merge into the same root start while the first is still moving files.
#[derive(Clone)]
pub struct MergeWorker {
    merger: Arc<dyn StorageMerger>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn RetrySleeper>,
    jitter: Arc<dyn BackoffJitter>,
    locks: Arc<KeyedLocks>,
    config: MergeWorkerConfig,
}

impl MergeWorker {
    /// Build a worker using default runtime dependencies.
    pub fn new(
        merger: Arc<dyn StorageMerger>,
        clock: Arc<dyn Clock>,
        config: MergeWorkerConfig,
    ) -> Self {
        Self::with_runtime(merger, clock, MergeWorkerRuntime::default(), config)
    }

    /// Build a worker with injected runtime abstractions.
    pub fn with_runtime(
        merger: Arc<dyn StorageMerger>,
        clock: Arc<dyn Clock>,
        runtime: MergeWorkerRuntime,
        config: MergeWorkerConfig,
    ) -> Self {
        Self {
            merger,
            clock,
            sleeper: runtime.sleeper,
            jitter: runtime.jitter,
            locks: Arc::new(KeyedLocks::default()),
            config,
        }
    }

    async fn run_single_attempt(&self, request: &MergeRequest) -> Result<MergeReport, AttemptError> {
        let merger = Arc::clone(&self.merger);
        let request = request.clone();
        tokio::task::spawn_blocking(move || merger.merge(&request))
            .await
            .map_err(|error| AttemptError::Join(format!("merge task failed: {error}")))?
            .map_err(AttemptError::Storage)
    }

    fn retry_base_delay(&self, attempt: u32) -> Duration {
        let exponent = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.config
            .initial_backoff
            .saturating_mul(exponent)
            .min(self.config.max_backoff)
    }

    async fn run(&self, request: MergeRequest) -> Result<MergeReport, Error> {
        let _guard = self.locks.acquire(&request.destination_key).await?;
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.run_single_attempt(&request).await {
                Ok(report) => {
                    info!(
                        thread_id = %request.source_thread_id,
                        identity_id = %request.source_identity_id,
                        destination = %request.destination_key,
                        moved = report.moved.len(),
                        skipped = report.skipped.len(),
                        attempt,
                        "storage merged"
                    );
                    return Ok(report);
                }
                Err(AttemptError::Storage(error)) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.jitter.jittered_delay(
                        self.retry_base_delay(attempt),
                        attempt,
                        self.clock.utc(),
                    );
                    warn!(
                        thread_id = %request.source_thread_id,
                        category = error.stage(),
                        attempt,
                        ?delay,
                        %error,
                        "merge attempt failed; retrying"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(AttemptError::Storage(error)) => {
                    warn!(
                        thread_id = %request.source_thread_id,
                        category = error.stage(),
                        attempt,
                        %error,
                        "merge failed"
                    );
                    return Err(map_merge_error(error, attempt));
                }
                Err(AttemptError::Join(message)) => return Err(Error::internal(message)),
            }
        }

        Err(Error::internal("unreachable merge control-flow state encountered"))
    }
}

#[async_trait]
impl MergeExecutor for MergeWorker {
    async fn execute(&self, request: MergeRequest) -> Result<MergeReport, Error> {
        let worker = self.clone();
        tokio::spawn(async move { worker.run(request).await })
            .await
            .map_err(|error| Error::internal(format!("merge task failed: {error}")))?
    }
}
