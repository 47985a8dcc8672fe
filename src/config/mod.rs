//! # Configuration Module
//!
//! Centralised configuration constants for the storage engine. Constants are
//! grouped by functional area and their interdependencies are enforced with
//! compile-time assertions.
//!
//! Runtime configuration (page size, cache capacity, lock timeout) is set via
//! [`crate::storage::PagerBuilder`] and
//! [`crate::transaction::TransactionManager::with_lock_timeout`]; the values
//! here are their defaults and bounds.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
