//! Internal Diesel row structs for the identity tables.
//!
//! These types never leave the persistence layer; repositories convert them
//! to domain values before returning.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use super::schema::{identities, verification_codes};

/// Row struct for reading from the identities table.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = identities)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub(crate) struct IdentityRow {
    pub thread_id: String,
    pub identity_id: String,
    pub channel: String,
    pub identifier: String,
    pub persistent_user_id: Option<String>,
    pub verification_status: String,
    pub verification_method: Option<String>,
    pub verification_contact: Option<String>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub merged_into_thread_id: Option<String>,
}

/// Insertable struct for first contact from a thread.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = identities)]
pub(crate) struct NewIdentityRow<'a> {
    pub thread_id: &'a str,
    pub identity_id: &'a str,
    pub channel: &'a str,
    pub identifier: &'a str,
    pub verification_status: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Row struct for reading from the verification_codes table.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = verification_codes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub(crate) struct VerificationCodeRow {
    pub thread_id: String,
    pub code: String,
    pub contact: String,
    pub method: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub reserved_user_id: Option<String>,
}

/// Insertable struct for a freshly issued code.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = verification_codes)]
pub(crate) struct NewVerificationCodeRow<'a> {
    pub thread_id: &'a str,
    pub code: &'a str,
    pub contact: &'a str,
    pub method: &'a str,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reserved_user_id: Option<&'a str>,
}
