//! PostgreSQL persistence for the identity registry and verification codes.
//!
//! Repositories are thin translators between Diesel rows (`models.rs`,
//! `schema.rs`, both private) and domain values. Connections come from a
//! `bb8` pool via `diesel-async`; schema changes ship as embedded
//! migrations.

mod diesel_basic_error_mapping;
mod diesel_identity_repository;
mod diesel_verification_code_repository;
mod migrations;
mod models;
mod pool;
mod schema;

pub use diesel_identity_repository::DieselIdentityRepository;
pub use diesel_verification_code_repository::DieselVerificationCodeRepository;
pub use migrations::{MIGRATIONS, MigrationError, run_pending_migrations};
pub use pool::{DbPool, PoolConfig, PoolError};
