//! Diesel table definitions for the identity registry.
//!
//! Kept in sync with `migrations/` by hand.

diesel::table! {
    identities (thread_id) {
        thread_id -> Text,
        identity_id -> Text,
        channel -> Text,
        identifier -> Text,
        persistent_user_id -> Nullable<Text>,
        verification_status -> Text,
        verification_method -> Nullable<Text>,
        verification_contact -> Nullable<Text>,
        created_at -> Timestamptz,
        verified_at -> Nullable<Timestamptz>,
        merged_at -> Nullable<Timestamptz>,
        merged_into_thread_id -> Nullable<Text>,
    }
}

diesel::table! {
    verification_codes (id) {
        id -> Int8,
        thread_id -> Text,
        code -> Text,
        contact -> Text,
        method -> Text,
        created_at -> Timestamptz,
        expires_at -> Timestamptz,
        consumed_at -> Nullable<Timestamptz>,
        reserved_user_id -> Nullable<Text>,
    }
}

diesel::joinable!(verification_codes -> identities (thread_id));

diesel::allow_tables_to_appear_in_same_query!(identities, verification_codes);
