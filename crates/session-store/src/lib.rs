//! Durable account credential storage
//!
//! Holds the configured account seeds (id plus an opaque session token pair)
//! as an ordered JSON array on disk. The order in the file is configuration
//! order and drives the pool's round-robin tie-break, so it is preserved
//! across every load/persist cycle.
//!
//! Only membership is durable. Health state and failure counters live in the
//! pool and reset on restart; a credential that was unavailable yesterday is
//! retried from scratch today.

pub mod error;
pub mod store;

pub use error::{Error, Result};
pub use store::{AccountSeed, CredentialStore, SessionCredential};
