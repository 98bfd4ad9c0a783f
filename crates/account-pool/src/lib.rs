//! Session-credential pool for an authentication-gated research upstream
//!
//! Manages multiple interchangeable accounts with a three-state health
//! machine, capability-partitioned round-robin selection, a request-outcome
//! feedback loop, and a heartbeat prober. The pool reads credentials from
//! `session_store::CredentialStore` (single source of truth) and maintains
//! per-account health independently.
//!
//! Account lifecycle:
//! 1. Admin adds an account: seed persisted, admitted as `Normal`, probed
//!    immediately so its real state is known before first selection
//! 2. `select()` prefers `Normal` accounts, spreads round-robin, and falls
//!    back to `Degraded` ones only when no `Normal` account exists
//! 3. The caller reports each real call's classified outcome; auth
//!    rejections park the account immediately, retryable failures escalate
//!    at the configured threshold
//! 4. Only a heartbeat probe success brings an `Unavailable` account back
//! 5. With nothing usable, `select()` yields the auto-fallback sentinel or
//!    a no-account-available error, per configuration

pub mod classify;
pub mod error;
pub mod heartbeat;
pub mod pool;
pub mod probe;
pub mod state;

pub use classify::{classify_status, is_downgrade_signal};
pub use error::{Error, Result};
pub use heartbeat::spawn_heartbeat_task;
pub use pool::{
    AccountSnapshot, HeartbeatSettings, Pool, PoolSettings, PoolSnapshot, SelectedAccount,
    Selection,
};
pub use probe::{HttpProbe, Probe, classify_probe_response};
pub use state::{AccountState, Outcome, OutcomeSource};
