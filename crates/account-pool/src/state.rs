//! Account health state machine
//!
//! Pure transition function: given the current state, the failure counter,
//! and a classified outcome, the next state is fully determined. Timestamps
//! are stamped by the pool, not here, so the function stays time-free and
//! exhaustively testable.
//!
//! Transitions:
//! - Normal → Degraded (upstream signals reduced capability)
//! - Normal/Degraded → Unavailable (auth rejected, or failures hit the threshold)
//! - Degraded → Normal (full-capability success)
//! - Unavailable → Normal/Degraded (heartbeat probe success ONLY; a caller's
//!   real request never resurrects an account, so live traffic is not routed
//!   to a likely-broken credential on the strength of a stale report)

use serde::Serialize;

/// Health/capability status of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    /// Fully capable, selected ahead of everything else.
    Normal,
    /// Usable at reduced upstream capability; selected only when no Normal
    /// account exists.
    Degraded,
    /// Auth rejected or repeatedly failing; never selected.
    Unavailable,
}

impl AccountState {
    /// Status label for snapshots, metrics, and logging.
    pub fn label(&self) -> &'static str {
        match self {
            AccountState::Normal => "normal",
            AccountState::Degraded => "degraded",
            AccountState::Unavailable => "unavailable",
        }
    }
}

/// Classification of a single upstream interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Worked at full capability.
    Success,
    /// Worked, but the upstream signalled a reduced tier.
    Downgraded,
    RateLimited,
    AuthInvalid,
    /// Timeouts, transport errors, 5xx, anything unclassifiable.
    UnknownError,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Downgraded => "downgraded",
            Outcome::RateLimited => "rate_limited",
            Outcome::AuthInvalid => "auth_invalid",
            Outcome::UnknownError => "unknown_error",
        }
    }

    /// Whether the upstream interaction itself succeeded. A downgraded call
    /// still completed, so it resets the failure counter.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Downgraded)
    }
}

/// Where an outcome was observed. Only heartbeat probes may move an account
/// out of `Unavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeSource {
    Heartbeat,
    Request,
}

/// Result of applying one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: AccountState,
    pub consecutive_failures: u32,
}

/// Apply one classified outcome to an account's (state, counter) pair.
///
/// `failure_threshold` is the number of consecutive retryable failures
/// (rate limits and unknown errors share the one counter) after which a
/// usable account is parked as `Unavailable`.
pub fn apply(
    state: AccountState,
    consecutive_failures: u32,
    outcome: Outcome,
    source: OutcomeSource,
    failure_threshold: u32,
) -> Transition {
    use AccountState::*;
    use Outcome::*;

    match (state, outcome) {
        // Heartbeat is the only path out of Unavailable.
        (Unavailable, Success) if source == OutcomeSource::Heartbeat => Transition {
            state: Normal,
            consecutive_failures: 0,
        },
        (Unavailable, Downgraded) if source == OutcomeSource::Heartbeat => Transition {
            state: Degraded,
            consecutive_failures: 0,
        },
        (Unavailable, _) => Transition {
            state: Unavailable,
            consecutive_failures,
        },

        (_, Success) => Transition {
            state: Normal,
            consecutive_failures: 0,
        },
        (_, Downgraded) => Transition {
            state: Degraded,
            consecutive_failures: 0,
        },
        (_, AuthInvalid) => Transition {
            state: Unavailable,
            consecutive_failures: consecutive_failures + 1,
        },
        (_, RateLimited | UnknownError) => {
            let failures = consecutive_failures + 1;
            Transition {
                state: if failures >= failure_threshold {
                    Unavailable
                } else {
                    state
                },
                consecutive_failures: failures,
            }
        }
    }
}
