//! In-process adapters for the registry ports.
//!
//! Used when no database URL is configured and as the test backend. Each
//! repository guards its table with one mutex, which linearises every
//! transition for a thread the same way a row lock would.

mod identity_repository;
mod verification_code_repository;

pub use identity_repository::InMemoryIdentityRepository;
pub use verification_code_repository::InMemoryVerificationCodeRepository;
