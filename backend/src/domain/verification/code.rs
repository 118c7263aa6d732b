//! Verification codes and their generation.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng as _;

use crate::domain::{Contact, PersistentUserId, ThreadId, VerificationMethod};

/// Characters a generated code is drawn from.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Default code length.
pub const DEFAULT_CODE_LENGTH: usize = 6;
/// Accepted code lengths.
pub const CODE_LENGTH_RANGE: std::ops::RangeInclusive<usize> = 4..=16;
/// Default code lifetime in minutes.
pub const DEFAULT_CODE_TTL_MINUTES: i64 = 15;
/// Accepted code lifetimes in minutes.
pub const CODE_TTL_MINUTES_RANGE: std::ops::RangeInclusive<i64> = 1..=1440;

/// Verification settings after clamping to supported ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationConfig {
    ttl_minutes: i64,
    code_length: usize,
}

impl VerificationConfig {
    /// Build a config, clamping out-of-range values.
    ///
    /// # Examples
    /// ```
    /// use identity_isolation::domain::VerificationConfig;
    ///
    /// let config = VerificationConfig::new(0, 64);
    /// assert_eq!(config.ttl_minutes(), 1);
    /// assert_eq!(config.code_length(), 16);
    /// ```
    pub fn new(ttl_minutes: i64, code_length: usize) -> Self {
        Self {
            ttl_minutes: ttl_minutes.clamp(*CODE_TTL_MINUTES_RANGE.start(), *CODE_TTL_MINUTES_RANGE.end()),
            code_length: code_length.clamp(*CODE_LENGTH_RANGE.start(), *CODE_LENGTH_RANGE.end()),
        }
    }

    /// Code lifetime in minutes.
    pub fn ttl_minutes(&self) -> i64 {
        self.ttl_minutes
    }

    /// Code lifetime.
    pub fn ttl(&self) -> TimeDelta {
        TimeDelta::minutes(self.ttl_minutes)
    }

    /// Number of characters per code.
    pub fn code_length(&self) -> usize {
        self.code_length
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_TTL_MINUTES, DEFAULT_CODE_LENGTH)
    }
}

/// Produces verification code values.
#[cfg_attr(test, mockall::automock)]
pub trait CodeGenerator: Send + Sync {
    /// Return a fresh code of `length` characters from [`CODE_ALPHABET`].
    fn generate(&self, length: usize) -> String;
}

/// Draws codes from the thread-local CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self, length: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..length)
            .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
            .collect()
    }
}

/// Normalise user input before comparison: codes are case-insensitive and
/// surrounding whitespace is ignored.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// A code issued to one thread.
#[derive(Clone, PartialEq, Eq)]
pub struct VerificationCode {
    pub thread_id: ThreadId,
    pub code: String,
    pub contact: Contact,
    pub method: VerificationMethod,
    pub created_at: DateTime<Utc>,
    /// Absolute expiry; the code is rejected strictly after this instant.
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    /// Persistent user chosen when the code was spent; survives a reinstate
    /// so a retried confirmation targets the same root.
    pub reserved_user_id: Option<PersistentUserId>,
}

impl VerificationCode {
    /// Issue a code for `thread_id` valid for `config.ttl()` from `now`.
    pub fn issue(
        thread_id: ThreadId,
        code: String,
        contact: Contact,
        method: VerificationMethod,
        now: DateTime<Utc>,
        config: &VerificationConfig,
    ) -> Self {
        Self {
            thread_id,
            code,
            contact,
            method,
            created_at: now,
            expires_at: now + config.ttl(),
            consumed_at: None,
            reserved_user_id: None,
        }
    }

    /// Whether the code can no longer be confirmed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Compare a candidate with the stored value without short-circuiting on
    /// the first differing character.
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = normalize_code(candidate);
        let stored = self.code.as_bytes();
        let given = candidate.as_bytes();
        if stored.len() != given.len() {
            return false;
        }
        stored
            .iter()
            .zip(given)
            .fold(0_u8, |acc, (left, right)| acc | (left ^ right))
            == 0
    }
}

impl fmt::Debug for VerificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationCode")
            .field("thread_id", &self.thread_id)
            .field("code", &"<redacted>")
            .field("contact", &self.contact)
            .field("method", &self.method)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("consumed_at", &self.consumed_at)
            .field("reserved_user_id", &self.reserved_user_id)
            .finish()
    }
}
