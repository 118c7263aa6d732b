//! Outbound adapters implementing the domain ports.
//!
//! - **memory**: in-process registry and code repositories
//! - **persistence**: PostgreSQL repositories using Diesel
//! - **storage**: `cap_std` filesystem roots, manifests and merges
//! - **notification**: log-only code delivery
//!
//! Adapters translate between domain types and infrastructure
//! representations and hold no business rules.

pub mod memory;
pub mod notification;
pub mod persistence;
pub mod storage;
