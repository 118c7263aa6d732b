//! Identity data model.
//!
//! One [`Identity`] exists per conversation thread. It starts anonymous, keyed
//! by a deterministic [`IdentityId`], and may later be linked to a
//! [`PersistentUserId`] shared by every thread of the same verified person.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Maximum accepted thread id length.
pub const THREAD_ID_MAX: usize = 256;
/// Longest sanitised identifier kept verbatim inside an identity id.
pub const IDENTIFIER_COMPONENT_MAX: usize = 48;
/// Channel assumed for thread ids without a `channel:` prefix.
pub const UNKNOWN_CHANNEL: &str = "unknown";

const IDENTITY_PREFIX: &str = "anon_";
const PERSISTENT_USER_PREFIX: &str = "user_";
const DISAMBIGUATION_HEX_LEN: usize = 16;
const DIGEST_SEPARATOR: char = '-';

/// Validation errors returned by identity constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityValidationError {
    EmptyThreadId,
    ThreadIdTooLong { max: usize },
    ThreadIdControlCharacters,
    EmptyIdentityId,
    InvalidPersistentUserId,
    EmptyContact,
    InvalidEmailContact,
    UnknownStatus(String),
    UnknownMethod(String),
}

impl fmt::Display for IdentityValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyThreadId => write!(f, "thread id must not be empty"),
            Self::ThreadIdTooLong { max } => {
                write!(f, "thread id must be at most {max} characters")
            }
            Self::ThreadIdControlCharacters => {
                write!(f, "thread id must not contain control characters")
            }
            Self::EmptyIdentityId => write!(f, "identity id must not be empty"),
            Self::InvalidPersistentUserId => write!(
                f,
                "persistent user id may only contain letters, digits, '_' or '-'",
            ),
            Self::EmptyContact => write!(f, "contact must not be empty"),
            Self::InvalidEmailContact => write!(f, "email contact must contain '@'"),
            Self::UnknownStatus(raw) => write!(f, "unknown verification status: {raw}"),
            Self::UnknownMethod(raw) => write!(f, "unknown verification method: {raw}"),
        }
    }
}

impl std::error::Error for IdentityValidationError {}

/// Stable identifier of a conversation context, e.g. `telegram:123456`.
///
/// ## Invariants
/// - Non-empty, trimmed, free of control characters, at most
///   [`THREAD_ID_MAX`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThreadId(String);

impl ThreadId {
    /// Validate and construct a [`ThreadId`].
    ///
    /// # Examples
    /// ```
    /// use identity_isolation::domain::ThreadId;
    ///
    /// let thread = ThreadId::new("telegram:111").unwrap();
    /// assert_eq!(thread.channel(), "telegram");
    /// assert_eq!(thread.identifier(), "111");
    /// ```
    pub fn new(raw: impl Into<String>) -> Result<Self, IdentityValidationError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdentityValidationError::EmptyThreadId);
        }
        if trimmed.chars().count() > THREAD_ID_MAX {
            return Err(IdentityValidationError::ThreadIdTooLong { max: THREAD_ID_MAX });
        }
        if trimmed.chars().any(char::is_control) {
            return Err(IdentityValidationError::ThreadIdControlCharacters);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Channel portion (text before the first `:`), or [`UNKNOWN_CHANNEL`].
    pub fn channel(&self) -> &str {
        self.0
            .split_once(':')
            .map_or(UNKNOWN_CHANNEL, |(channel, _)| channel)
    }

    /// Channel-specific identifier (text after the first `:`).
    pub fn identifier(&self) -> &str {
        self.0
            .split_once(':')
            .map_or(self.0.as_str(), |(_, identifier)| identifier)
    }
}

impl AsRef<str> for ThreadId {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<ThreadId> for String {
    fn from(value: ThreadId) -> Self {
        value.0
    }
}

impl TryFrom<String> for ThreadId {
    type Error = IdentityValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Deterministic, immutable anonymous identifier derived from a thread id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityId(String);

impl IdentityId {
    /// Derive the identity id for a thread at first contact.
    ///
    /// The result is `anon_{channel}_{identifier}` with the channel lowercased
    /// and both components reduced to ASCII letters, digits and `_`. A plain
    /// id needs a channel without `_`, so the first `_` after the prefix
    /// always ends the channel. Anything else (a lossy reduction, a channel
    /// holding `_`, a truncated identifier, a thread id that is not literally
    /// `channel:identifier`) gets `-` and a digest of the full thread id
    /// appended. Plain ids never contain `-`, so the two forms
    /// cannot alias each other.
    ///
    /// # Examples
    /// ```
    /// use identity_isolation::domain::{IdentityId, ThreadId};
    ///
    /// let thread = ThreadId::new("telegram:111").unwrap();
    /// let id = IdentityId::derive(&thread, "telegram", "111");
    /// assert_eq!(id.as_ref(), "anon_telegram_111");
    /// ```
    pub fn derive(thread_id: &ThreadId, channel: &str, identifier: &str) -> Self {
        let channel_part = sanitize_component(&channel.to_ascii_lowercase());
        let identifier_part = sanitize_component(identifier);

        let truncated = identifier_part.chars().count() > IDENTIFIER_COMPONENT_MAX;
        let spelled_out = thread_id
            .as_ref()
            .strip_prefix(channel)
            .and_then(|rest| rest.strip_prefix(':'))
            == Some(identifier);
        let lossy = !spelled_out
            || channel_part != channel
            || channel_part.is_empty()
            || channel_part.contains('_')
            || identifier_part != identifier
            || identifier_part.is_empty()
            || truncated;

        let identifier_part: String = identifier_part
            .chars()
            .take(IDENTIFIER_COMPONENT_MAX)
            .collect();
        let mut id = format!("{IDENTITY_PREFIX}{channel_part}_{identifier_part}");
        if lossy {
            id.push(DIGEST_SEPARATOR);
            id.push_str(&thread_digest(thread_id));
        }
        Self(id)
    }

    /// Rehydrate an identity id read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Result<Self, IdentityValidationError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(IdentityValidationError::EmptyIdentityId);
        }
        Ok(Self(raw))
    }
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn thread_digest(thread_id: &ThreadId) -> String {
    let digest = Sha256::digest(thread_id.as_ref().as_bytes());
    hex::encode(digest)
        .chars()
        .take(DISAMBIGUATION_HEX_LEN)
        .collect()
}

impl AsRef<str> for IdentityId {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<IdentityId> for String {
    fn from(value: IdentityId) -> Self {
        value.0
    }
}

impl TryFrom<String> for IdentityId {
    type Error = IdentityValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_stored(value)
    }
}

/// Opaque identifier shared by every verified thread of one person.
///
/// ## Invariants
/// - Only ASCII letters, digits, `_` and `-`; safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PersistentUserId(String);

impl PersistentUserId {
    /// Validate and construct a [`PersistentUserId`].
    pub fn new(raw: impl Into<String>) -> Result<Self, IdentityValidationError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(IdentityValidationError::InvalidPersistentUserId);
        }
        Ok(Self(raw))
    }

    /// Mint a fresh `user_<uuid>` identifier.
    pub fn mint() -> Self {
        Self(format!(
            "{PERSISTENT_USER_PREFIX}{}",
            Uuid::new_v4().simple()
        ))
    }
}

impl AsRef<str> for PersistentUserId {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for PersistentUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<PersistentUserId> for String {
    fn from(value: PersistentUserId) -> Self {
        value.0
    }
}

impl TryFrom<String> for PersistentUserId {
    type Error = IdentityValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Identity lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Auto-created on first contact.
    Anonymous,
    /// A merge was requested and a code is outstanding.
    Pending,
    /// Linked to a persistent user; terminal.
    Verified,
}

impl VerificationStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Pending => "pending",
            Self::Verified => "verified",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = IdentityValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anonymous" => Ok(Self::Anonymous),
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            other => Err(IdentityValidationError::UnknownStatus(other.to_owned())),
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel used to deliver a verification code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    /// Code is sent by email.
    Email,
    /// Code is sent by text message.
    Sms,
}

impl VerificationMethod {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }
}

impl FromStr for VerificationMethod {
    type Err = IdentityValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "sms" | "phone" => Ok(Self::Sms),
            other => Err(IdentityValidationError::UnknownMethod(other.to_owned())),
        }
    }
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised contact address a code is delivered to.
///
/// Email contacts are lowercased so the same mailbox always maps to the same
/// persistent user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact(String);

impl Contact {
    /// Normalise and validate a contact for the given delivery method.
    ///
    /// # Examples
    /// ```
    /// use identity_isolation::domain::{Contact, VerificationMethod};
    ///
    /// let contact = Contact::new(VerificationMethod::Email, " A@Example.com ").unwrap();
    /// assert_eq!(contact.as_ref(), "a@example.com");
    /// ```
    pub fn new(method: VerificationMethod, raw: &str) -> Result<Self, IdentityValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdentityValidationError::EmptyContact);
        }
        match method {
            VerificationMethod::Email => {
                if !trimmed.contains('@') {
                    return Err(IdentityValidationError::InvalidEmailContact);
                }
                Ok(Self(trimmed.to_lowercase()))
            }
            VerificationMethod::Sms => Ok(Self(
                trimmed.chars().filter(|c| !c.is_whitespace()).collect(),
            )),
        }
    }

    /// Rehydrate a contact that was normalised before it was stored.
    pub fn from_stored(raw: impl Into<String>) -> Result<Self, IdentityValidationError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(IdentityValidationError::EmptyContact);
        }
        Ok(Self(raw))
    }
}

impl AsRef<str> for Contact {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Registry row for one conversation thread.
///
/// ## Invariants
/// - `identity_id`, `channel` and `identifier` never change after creation.
/// - `persistent_user_id` is set exactly when `verification_status` is
///   [`VerificationStatus::Verified`] and is never cleared afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Primary key.
    pub thread_id: ThreadId,
    /// Deterministic anonymous id.
    pub identity_id: IdentityId,
    /// Raw channel name.
    pub channel: String,
    /// Raw channel-specific identifier.
    pub identifier: String,
    /// Linked persistent user, once verified.
    pub persistent_user_id: Option<PersistentUserId>,
    /// Lifecycle state.
    pub verification_status: VerificationStatus,
    /// Delivery method of the latest merge request.
    pub verification_method: Option<VerificationMethod>,
    /// Contact of the latest merge request.
    pub verification_contact: Option<Contact>,
    /// First-contact timestamp.
    pub created_at: DateTime<Utc>,
    /// When the thread became verified.
    pub verified_at: Option<DateTime<Utc>>,
    /// When this thread's storage was merged into a persistent user root.
    pub merged_at: Option<DateTime<Utc>>,
    /// Verified thread that pulled this thread in via an additional merge.
    pub merged_into_thread_id: Option<ThreadId>,
}

impl Identity {
    /// Build a fresh anonymous identity.
    pub fn anonymous(new: NewIdentity) -> Self {
        Self {
            thread_id: new.thread_id,
            identity_id: new.identity_id,
            channel: new.channel,
            identifier: new.identifier,
            persistent_user_id: None,
            verification_status: VerificationStatus::Anonymous,
            verification_method: None,
            verification_contact: None,
            created_at: new.created_at,
            verified_at: None,
            merged_at: None,
            merged_into_thread_id: None,
        }
    }

    /// Whether the thread is linked to a persistent user.
    pub fn is_verified(&self) -> bool {
        self.verification_status == VerificationStatus::Verified
    }

    /// Directory key of the thread's user root: the persistent user id when
    /// verified, otherwise the identity id.
    pub fn user_root_key(&self) -> &str {
        match (&self.persistent_user_id, self.is_verified()) {
            (Some(persistent), true) => persistent.as_ref(),
            _ => self.identity_id.as_ref(),
        }
    }
}

/// Insert payload for a thread seen for the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIdentity {
    /// Primary key.
    pub thread_id: ThreadId,
    /// Derived identity id.
    pub identity_id: IdentityId,
    /// Raw channel name.
    pub channel: String,
    /// Raw channel-specific identifier.
    pub identifier: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    //! Regression coverage for identity primitives.
    use super::*;
    use rstest::rstest;

    fn thread(raw: &str) -> ThreadId {
        ThreadId::new(raw).expect("valid thread id")
    }

    #[rstest]
    #[case("telegram:111", "telegram", "111")]
    #[case("http:abc:def", "http", "abc:def")]
    #[case("cli-session", UNKNOWN_CHANNEL, "cli-session")]
    fn thread_id_splits_channel_and_identifier(
        #[case] raw: &str,
        #[case] channel: &str,
        #[case] identifier: &str,
    ) {
        let id = thread(raw);
        assert_eq!(id.channel(), channel);
        assert_eq!(id.identifier(), identifier);
    }

    #[rstest]
    #[case("", IdentityValidationError::EmptyThreadId)]
    #[case("   ", IdentityValidationError::EmptyThreadId)]
    #[case("telegram:\n1", IdentityValidationError::ThreadIdControlCharacters)]
    fn thread_id_rejects_invalid_input(
        #[case] raw: &str,
        #[case] expected: IdentityValidationError,
    ) {
        assert_eq!(ThreadId::new(raw), Err(expected));
    }

    #[rstest]
    fn thread_id_rejects_overlong_input() {
        let raw = "x".repeat(THREAD_ID_MAX + 1);
        assert_eq!(
            ThreadId::new(raw),
            Err(IdentityValidationError::ThreadIdTooLong { max: THREAD_ID_MAX })
        );
    }

    #[rstest]
    fn identity_id_is_plain_when_lossless() {
        let id = IdentityId::derive(&thread("telegram:111"), "telegram", "111");
        assert_eq!(id.as_ref(), "anon_telegram_111");
    }

    #[rstest]
    fn mixed_case_channel_does_not_alias_lowercase_channel() {
        let upper = IdentityId::derive(&thread("Telegram:111"), "Telegram", "111");
        let lower = IdentityId::derive(&thread("telegram:111"), "telegram", "111");
        assert!(upper.as_ref().starts_with("anon_telegram_111-"));
        assert_ne!(upper, lower);
    }

    #[rstest]
    fn lossy_sanitisation_appends_thread_digest() {
        let dotted = IdentityId::derive(&thread("email:a.b"), "email", "a.b");
        let underscored = IdentityId::derive(&thread("email:a_b"), "email", "a_b");

        assert!(dotted.as_ref().starts_with("anon_email_a_b-"));
        assert_eq!(underscored.as_ref(), "anon_email_a_b");
        assert_ne!(dotted, underscored);
    }

    #[rstest]
    #[case("a_b:c", "a:b_c")]
    #[case("web_x:1", "web:x_1")]
    #[case("unknown:a_b", "a_b")]
    fn underscores_never_move_the_channel_boundary(#[case] first: &str, #[case] second: &str) {
        let first = thread(first);
        let second = thread(second);
        let first_id = IdentityId::derive(&first, first.channel(), first.identifier());
        let second_id = IdentityId::derive(&second, second.channel(), second.identifier());
        assert_ne!(first_id, second_id);
    }

    #[rstest]
    fn plain_ids_cannot_impersonate_digest_ids() {
        let lossy_thread = thread("email:a.b");
        let lossy = IdentityId::derive(&lossy_thread, "email", "a.b");
        let (_, digest) = lossy
            .as_ref()
            .split_once(DIGEST_SEPARATOR)
            .expect("digest suffix");
        let forged_identifier = format!("a_b_{digest}");
        let forged_thread = thread(&format!("email:{forged_identifier}"));

        let forged = IdentityId::derive(&forged_thread, "email", &forged_identifier);

        assert!(!forged.as_ref().contains(DIGEST_SEPARATOR));
        assert_ne!(forged, lossy);
    }

    #[rstest]
    fn derivation_is_deterministic() {
        let first = IdentityId::derive(&thread("web:x/y"), "web", "x/y");
        let second = IdentityId::derive(&thread("web:x/y"), "web", "x/y");
        assert_eq!(first, second);
    }

    #[rstest]
    fn long_identifiers_are_truncated_and_disambiguated() {
        let identifier = "a".repeat(IDENTIFIER_COMPONENT_MAX + 10);
        let raw = format!("web:{identifier}");
        let id = IdentityId::derive(&thread(&raw), "web", &identifier);
        let expected_len =
            "anon_web_".len() + IDENTIFIER_COMPONENT_MAX + 1 + DISAMBIGUATION_HEX_LEN;
        assert_eq!(id.as_ref().len(), expected_len);
    }

    #[rstest]
    fn minted_persistent_ids_are_prefixed_and_unique() {
        let first = PersistentUserId::mint();
        let second = PersistentUserId::mint();
        assert!(first.as_ref().starts_with("user_"));
        assert_ne!(first, second);
        assert!(PersistentUserId::new(first.as_ref()).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("../escape")]
    #[case("user id")]
    fn persistent_user_id_rejects_unsafe_values(#[case] raw: &str) {
        assert_eq!(
            PersistentUserId::new(raw),
            Err(IdentityValidationError::InvalidPersistentUserId)
        );
    }

    #[rstest]
    #[case(VerificationStatus::Anonymous)]
    #[case(VerificationStatus::Pending)]
    #[case(VerificationStatus::Verified)]
    fn status_round_trips_through_storage_form(#[case] status: VerificationStatus) {
        assert_eq!(status.as_str().parse::<VerificationStatus>(), Ok(status));
    }

    #[rstest]
    fn sms_contacts_drop_whitespace() {
        let contact = Contact::new(VerificationMethod::Sms, "+44 7700 900123").expect("contact");
        assert_eq!(contact.as_ref(), "+447700900123");
    }

    #[rstest]
    fn email_contacts_require_at_sign() {
        assert_eq!(
            Contact::new(VerificationMethod::Email, "not-an-email"),
            Err(IdentityValidationError::InvalidEmailContact)
        );
    }

    #[rstest]
    fn user_root_key_prefers_persistent_id_once_verified() {
        let thread_id = thread("telegram:111");
        let mut identity = Identity::anonymous(NewIdentity {
            identity_id: IdentityId::derive(&thread_id, "telegram", "111"),
            thread_id,
            channel: "telegram".to_owned(),
            identifier: "111".to_owned(),
            created_at: Utc::now(),
        });
        assert_eq!(identity.user_root_key(), "anon_telegram_111");

        let persistent = PersistentUserId::mint();
        identity.persistent_user_id = Some(persistent.clone());
        assert_eq!(identity.user_root_key(), "anon_telegram_111");

        identity.verification_status = VerificationStatus::Verified;
        assert_eq!(identity.user_root_key(), persistent.as_ref());
    }
}
