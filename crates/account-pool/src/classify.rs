//! Outcome classification for upstream responses
//!
//! Maps an HTTP status and response body onto an [`Outcome`] for the
//! feedback loop. Auth rejections and rate limits are unambiguous from the
//! status alone; capability downgrades hide inside 2xx bodies as phrases the
//! upstream emits when an account drops out of its premium tier.

use crate::state::Outcome;

/// Downgrade phrases in otherwise-successful upstream responses.
///
/// These indicate the account kept working but lost premium capability
/// (exhausted pro quota, lapsed plan), not that the request failed.
const DOWNGRADE_PATTERNS: &[&str] = &[
    "out of pro searches",
    "pro quota exhausted",
    "upgrade your plan",
    "quick search only",
];

/// Scan a successful response body for a capability-downgrade signal.
pub fn is_downgrade_signal(body: &str) -> bool {
    let lower = body.to_lowercase();
    DOWNGRADE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classify an upstream response by HTTP status and body.
///
/// 401/403 mean the session pair is rejected. 402 is a lapsed subscription:
/// the credential still authenticates, so it downgrades rather than dies.
/// 2xx responses are scanned for downgrade phrases. Everything else
/// (timeouts surface as no status at all, 5xx, oddities) is an unknown
/// error and counts toward the failure threshold.
pub fn classify_status(status: u16, body: &str) -> Outcome {
    match status {
        401 | 403 => Outcome::AuthInvalid,
        402 => Outcome::Downgraded,
        429 => Outcome::RateLimited,
        s if (200..300).contains(&s) => {
            if is_downgrade_signal(body) {
                Outcome::Downgraded
            } else {
                Outcome::Success
            }
        }
        _ => Outcome::UnknownError,
    }
}
