//! Lightweight capability probing
//!
//! A probe exercises one account against a cheap upstream endpoint (the user
//! settings document) and classifies the result. The trait is dyn-compatible
//! so the heartbeat task can hold `Arc<dyn Probe>` and tests can substitute
//! a canned implementation; probe failures are always absorbed into an
//! [`Outcome`], never raised to callers.

use std::future::Future;
use std::pin::Pin;

use session_store::SessionCredential;
use tracing::debug;

use crate::classify::classify_status;
use crate::state::Outcome;

/// Cookie names the upstream expects for the session pair.
const SESSION_COOKIE: &str = "__Secure-next-auth.session-token";
const CSRF_COOKIE: &str = "next-auth.csrf-token";

/// Subscription tiers that mean full capability. Anything else in a valid
/// settings document is a reduced tier.
const FULL_TIERS: &[&str] = &["pro", "enterprise", "max"];

/// One capability check against the upstream.
pub trait Probe: Send + Sync {
    /// Exercise the credential and classify the result. The per-probe
    /// timeout is enforced by the caller, not the implementation.
    fn check<'a>(
        &'a self,
        account_id: &'a str,
        credential: &'a SessionCredential,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;
}

/// Production probe: GET the upstream settings endpoint with the account's
/// cookie pair and read the subscription tier out of the response.
pub struct HttpProbe {
    client: reqwest::Client,
    settings_url: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, base_url: &str, probe_path: &str) -> Self {
        Self {
            client,
            settings_url: format!("{}{}", base_url.trim_end_matches('/'), probe_path),
        }
    }
}

impl Probe for HttpProbe {
    fn check<'a>(
        &'a self,
        account_id: &'a str,
        credential: &'a SessionCredential,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let cookie = format!(
                "{SESSION_COOKIE}={}; {CSRF_COOKIE}={}",
                credential.session_token, credential.csrf_token
            );
            let response = self
                .client
                .get(&self.settings_url)
                .header(reqwest::header::COOKIE, cookie)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    let outcome = classify_probe_response(status, &body);
                    debug!(account_id, status, outcome = outcome.label(), "probe completed");
                    outcome
                }
                Err(e) => {
                    debug!(account_id, error = %e, "probe transport error");
                    Outcome::UnknownError
                }
            }
        })
    }
}

/// Classify a settings-endpoint response.
///
/// A 2xx with a parseable settings document succeeds at the tier the
/// document claims; a 2xx we cannot parse proves nothing about capability
/// and classifies as an unknown error. Non-2xx statuses use the shared
/// status classification.
pub fn classify_probe_response(status: u16, body: &str) -> Outcome {
    if !(200..300).contains(&status) {
        return classify_status(status, body);
    }
    let Ok(settings) = serde_json::from_str::<serde_json::Value>(body) else {
        return Outcome::UnknownError;
    };
    match settings.get("subscription_tier").and_then(|v| v.as_str()) {
        Some(tier) if FULL_TIERS.contains(&tier.to_lowercase().as_str()) => Outcome::Success,
        _ => Outcome::Downgraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pro_tier_is_success() {
        let body = r#"{"subscription_tier":"pro","searches_remaining":412}"#;
        assert_eq!(classify_probe_response(200, body), Outcome::Success);
    }

    #[test]
    fn enterprise_tier_is_success() {
        let body = r#"{"subscription_tier":"enterprise"}"#;
        assert_eq!(classify_probe_response(200, body), Outcome::Success);
    }

    #[test]
    fn tier_comparison_is_case_insensitive() {
        let body = r#"{"subscription_tier":"Pro"}"#;
        assert_eq!(classify_probe_response(200, body), Outcome::Success);
    }

    #[test]
    fn free_tier_is_downgraded() {
        let body = r#"{"subscription_tier":"free"}"#;
        assert_eq!(classify_probe_response(200, body), Outcome::Downgraded);
    }

    #[test]
    fn missing_tier_is_downgraded() {
        let body = r#"{"searches_remaining":3}"#;
        assert_eq!(classify_probe_response(200, body), Outcome::Downgraded);
    }

    #[test]
    fn unparseable_body_is_unknown() {
        assert_eq!(
            classify_probe_response(200, "<html>maintenance</html>"),
            Outcome::UnknownError
        );
    }

    #[test]
    fn auth_rejection_is_auth_invalid() {
        assert_eq!(
            classify_probe_response(401, r#"{"error":"invalid session"}"#),
            Outcome::AuthInvalid
        );
    }

    #[test]
    fn rate_limit_is_rate_limited() {
        assert_eq!(classify_probe_response(429, ""), Outcome::RateLimited);
    }

    #[test]
    fn server_error_is_unknown() {
        assert_eq!(classify_probe_response(503, ""), Outcome::UnknownError);
    }

    #[test]
    fn http_probe_builds_url_without_double_slash() {
        let probe = HttpProbe::new(
            reqwest::Client::new(),
            "https://upstream.example/",
            "/rest/user/settings",
        );
        assert_eq!(
            probe.settings_url,
            "https://upstream.example/rest/user/settings"
        );
    }
}
