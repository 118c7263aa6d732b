//! Identity resolution and multi-tenant storage isolation.
//!
//! Conversation threads get an anonymous identity on first contact and a
//! private storage root. Verifying a contact links the thread to a
//! persistent user and merges its root into that user's root.

pub mod config;
pub mod domain;
pub mod outbound;
pub mod wiring;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::IsolationSettings;
pub use wiring::{Isolation, IsolationPorts};
