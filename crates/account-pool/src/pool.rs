//! Pool state, round-robin selection, and the outcome feedback loop
//!
//! The pool owns every account's live health record. The credential store
//! remains the single source of truth for token data; selection reads
//! credentials at selection time. All state mutations funnel through the
//! transition function in [`crate::state`], serialized by one write lock, so
//! no component ever assigns an account state directly.
//!
//! Selection and snapshots are reads; transitions, membership changes, and
//! settings updates are writes. Nothing holds the write lock across I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use session_store::{AccountSeed, CredentialStore, SessionCredential};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::state::{self, AccountState, Outcome, OutcomeSource};

/// Heartbeat prober knobs, runtime-mutable through the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub max_concurrent_probes: usize,
}

/// Runtime pool behavior. Updates replace the whole value under one write
/// lock, so concurrent readers never observe a half-applied change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub heartbeat: HeartbeatSettings,
    /// When no account is usable, tell the caller to proceed without a
    /// pooled credential instead of failing.
    pub fallback_to_auto: bool,
    /// Consecutive retryable failures before a usable account is parked.
    pub failure_threshold: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatSettings {
                enabled: true,
                interval_secs: 300,
                timeout_secs: 30,
                max_concurrent_probes: 4,
            },
            fallback_to_auto: false,
            failure_threshold: 3,
        }
    }
}

impl PoolSettings {
    /// Reject inconsistent settings before they reach the running pool.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval_secs == 0 {
            return Err(Error::Config("heartbeat interval_secs must be positive".into()));
        }
        if self.heartbeat.timeout_secs == 0 {
            return Err(Error::Config("heartbeat timeout_secs must be positive".into()));
        }
        if self.heartbeat.timeout_secs >= self.heartbeat.interval_secs {
            return Err(Error::Config(
                "heartbeat timeout_secs must be less than interval_secs".into(),
            ));
        }
        if self.heartbeat.max_concurrent_probes == 0 {
            return Err(Error::Config("max_concurrent_probes must be positive".into()));
        }
        if self.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be positive".into()));
        }
        Ok(())
    }
}

/// Live health record for one account. Membership is durable; this is not.
#[derive(Debug, Clone)]
struct AccountRecord {
    id: String,
    state: AccountState,
    consecutive_failures: u32,
    last_checked_at: Option<SystemTime>,
    last_success_at: Option<SystemTime>,
    last_outcome: Option<Outcome>,
}

impl AccountRecord {
    fn new(id: String) -> Self {
        Self {
            id,
            state: AccountState::Normal,
            consecutive_failures: 0,
            last_checked_at: None,
            last_success_at: None,
            last_outcome: None,
        }
    }
}

/// A selected account with its credential pair, ready for a request.
#[derive(Debug)]
pub struct SelectedAccount {
    pub id: String,
    pub session_token: String,
    pub csrf_token: String,
}

/// Result of a successful selection.
#[derive(Debug)]
pub enum Selection {
    /// Use this pooled account.
    Account(SelectedAccount),
    /// No pooled account is usable and fallback is enabled: proceed without
    /// a pooled credential.
    Auto,
}

/// One account's externally visible status, tokens masked.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub id: String,
    pub state: AccountState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<Outcome>,
    pub token_suffix: String,
}

/// Read-only pool view for dashboards and the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// "healthy" (all normal), "degraded" (some usable), or "unhealthy".
    pub status: &'static str,
    pub accounts_total: usize,
    pub accounts_normal: usize,
    pub accounts_degraded: usize,
    pub accounts_unavailable: usize,
    pub accounts: Vec<AccountSnapshot>,
}

impl PoolSnapshot {
    /// Whether at least one account is selectable.
    pub fn has_capacity(&self) -> bool {
        self.accounts_normal + self.accounts_degraded > 0
    }
}

/// Session-credential pool managing multiple interchangeable accounts.
///
/// Uses an `AtomicUsize` for the round-robin cursor and `RwLock`s for the
/// account records and runtime settings. The credential store is shared via
/// `Arc` and provides the token data.
pub struct Pool {
    accounts: RwLock<Vec<AccountRecord>>,
    settings: RwLock<PoolSettings>,
    cursor: AtomicUsize,
    store: Arc<CredentialStore>,
    probe_tx: mpsc::UnboundedSender<String>,
}

impl Pool {
    /// Create a pool over the store's current membership, all accounts
    /// starting as Normal with zero failures.
    ///
    /// Returns the pool and the receiver side of the immediate-probe queue;
    /// hand the receiver to [`crate::heartbeat::spawn_heartbeat_task`]. If
    /// the receiver is dropped instead, probe requests are discarded.
    pub async fn new(
        store: Arc<CredentialStore>,
        settings: PoolSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>)> {
        settings.validate()?;
        let accounts: Vec<AccountRecord> = store
            .ids()
            .await
            .into_iter()
            .map(AccountRecord::new)
            .collect();
        info!(accounts = accounts.len(), "pool initialized");
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                accounts: RwLock::new(accounts),
                settings: RwLock::new(settings),
                cursor: AtomicUsize::new(0),
                store,
                probe_tx,
            },
            probe_rx,
        ))
    }

    /// Select the account for the next request.
    ///
    /// Normal accounts are preferred; Degraded ones serve only when no
    /// Normal account exists; Unavailable ones are never candidates. Within
    /// the chosen partition, load spreads round-robin in configuration
    /// order. The cursor advances exactly one atomic step per call, so
    /// concurrent callers cannot double-select one account while skipping
    /// another.
    ///
    /// Never performs network I/O. With no usable account this returns
    /// [`Selection::Auto`] or `NoAccountAvailable` per the fallback setting.
    pub async fn select(&self) -> Result<Selection> {
        let (candidates, partition) = self.candidates().await;
        if candidates.is_empty() {
            return self.no_candidate().await;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..candidates.len() {
            let id = &candidates[(start + offset) % candidates.len()];
            match self.store.get(id).await {
                Some(credential) => {
                    metrics::counter!("pool_selections_total", "partition" => partition)
                        .increment(1);
                    debug!(account_id = %id, partition, "account selected");
                    return Ok(Selection::Account(SelectedAccount {
                        id: id.clone(),
                        session_token: credential.session_token,
                        csrf_token: credential.csrf_token,
                    }));
                }
                None => {
                    // Membership raced a removal; park the orphan and move on.
                    warn!(account_id = %id, "account in pool but not in credential store");
                    self.apply_outcome(id, Outcome::AuthInvalid, OutcomeSource::Request)
                        .await;
                }
            }
        }
        self.no_candidate().await
    }

    /// Report the classified result of a real upstream call made with the
    /// given account. Reports for unknown ids are ignored: the account may
    /// have been removed between selection and reporting.
    pub async fn report_outcome(&self, account_id: &str, outcome: Outcome) {
        metrics::counter!("pool_outcome_reports_total", "outcome" => outcome.label()).increment(1);
        self.apply_outcome(account_id, outcome, OutcomeSource::Request)
            .await;
    }

    /// Feed a heartbeat probe result into the state machine. This is the
    /// only path that can bring an Unavailable account back.
    pub async fn apply_probe_outcome(&self, account_id: &str, outcome: Outcome) {
        self.apply_outcome(account_id, outcome, OutcomeSource::Heartbeat)
            .await;
    }

    /// Add a new account: validate and persist the seed, admit it to the
    /// live pool as Normal, and queue an immediate probe so its real state
    /// is known before selection first offers it.
    pub async fn add_account(&self, seed: AccountSeed) -> Result<()> {
        let id = seed.id.clone();
        self.store.add(seed).await?;
        {
            let mut accounts = self.accounts.write().await;
            if !accounts.iter().any(|a| a.id == id) {
                accounts.push(AccountRecord::new(id.clone()));
            }
        }
        info!(account_id = %id, "account added to pool");
        let _ = self.probe_tx.send(id);
        Ok(())
    }

    /// Remove an account by id. Idempotent: removing an unknown id succeeds
    /// without side effects.
    pub async fn remove_account(&self, account_id: &str) -> Result<()> {
        let removed = self.store.remove(account_id).await?;
        self.accounts
            .write()
            .await
            .retain(|a| a.id != account_id);
        if removed {
            info!(account_id, "account removed from pool");
        }
        Ok(())
    }

    /// Current runtime settings.
    pub async fn settings(&self) -> PoolSettings {
        self.settings.read().await.clone()
    }

    /// Replace the runtime settings wholesale. Takes effect on the
    /// heartbeat's next cycle; invalid settings are rejected and nothing
    /// changes.
    pub async fn update_settings(&self, settings: PoolSettings) -> Result<()> {
        settings.validate()?;
        *self.settings.write().await = settings;
        info!("pool settings updated");
        Ok(())
    }

    /// Account ids in configuration order.
    pub async fn account_ids(&self) -> Vec<String> {
        self.accounts.read().await.iter().map(|a| a.id.clone()).collect()
    }

    /// Credential lookup for the heartbeat prober.
    pub(crate) async fn credential(&self, account_id: &str) -> Option<SessionCredential> {
        self.store.get(account_id).await
    }

    /// Read-only snapshot with per-account status and pool totals. Tokens
    /// appear only as a masked suffix.
    pub async fn snapshot(&self) -> PoolSnapshot {
        let records: Vec<AccountRecord> = self.accounts.read().await.clone();

        let mut accounts = Vec::with_capacity(records.len());
        let (mut normal, mut degraded, mut unavailable) = (0usize, 0usize, 0usize);
        for record in &records {
            match record.state {
                AccountState::Normal => normal += 1,
                AccountState::Degraded => degraded += 1,
                AccountState::Unavailable => unavailable += 1,
            }
            let token_suffix = match self.store.get(&record.id).await {
                Some(credential) => credential.masked_suffix(),
                None => "****".to_string(),
            };
            accounts.push(AccountSnapshot {
                id: record.id.clone(),
                state: record.state,
                consecutive_failures: record.consecutive_failures,
                last_checked_at: unix_secs(record.last_checked_at),
                last_success_at: unix_secs(record.last_success_at),
                last_outcome: record.last_outcome,
                token_suffix,
            });
        }

        let total = records.len();
        let status = if total > 0 && normal == total {
            "healthy"
        } else if normal + degraded > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        PoolSnapshot {
            status,
            accounts_total: total,
            accounts_normal: normal,
            accounts_degraded: degraded,
            accounts_unavailable: unavailable,
            accounts,
        }
    }

    /// Candidate ids for selection: the Normal partition if non-empty,
    /// otherwise the Degraded one, in configuration order.
    async fn candidates(&self) -> (Vec<String>, &'static str) {
        let accounts = self.accounts.read().await;
        let normal: Vec<String> = accounts
            .iter()
            .filter(|a| a.state == AccountState::Normal)
            .map(|a| a.id.clone())
            .collect();
        if !normal.is_empty() {
            return (normal, "normal");
        }
        let degraded = accounts
            .iter()
            .filter(|a| a.state == AccountState::Degraded)
            .map(|a| a.id.clone())
            .collect();
        (degraded, "degraded")
    }

    async fn no_candidate(&self) -> Result<Selection> {
        if self.settings.read().await.fallback_to_auto {
            debug!("no pooled account usable, falling back to auto");
            metrics::counter!("pool_selections_total", "partition" => "auto").increment(1);
            return Ok(Selection::Auto);
        }
        metrics::counter!("pool_selections_total", "partition" => "none").increment(1);
        Err(Error::NoAccountAvailable(self.exhausted_message().await))
    }

    /// Run one outcome through the transition function and stamp timestamps.
    /// The upstream call that produced the outcome happened outside any
    /// lock; only this short transition runs under the write lock.
    async fn apply_outcome(&self, account_id: &str, outcome: Outcome, source: OutcomeSource) {
        let threshold = self.settings.read().await.failure_threshold;
        let went_unavailable = {
            let mut accounts = self.accounts.write().await;
            let Some(record) = accounts.iter_mut().find(|a| a.id == account_id) else {
                debug!(account_id, "outcome for unknown account ignored");
                return;
            };

            let prior = record.state;
            let next = state::apply(prior, record.consecutive_failures, outcome, source, threshold);
            record.state = next.state;
            record.consecutive_failures = next.consecutive_failures;

            let now = SystemTime::now();
            record.last_checked_at = Some(now);
            // A request-sourced success on an Unavailable account is rejected
            // by the state machine, so it does not count as a pool success.
            let accepted_success = outcome.is_success()
                && !(prior == AccountState::Unavailable && source == OutcomeSource::Request);
            if accepted_success {
                record.last_success_at = Some(now);
            }
            record.last_outcome = Some(outcome);

            if next.state != prior {
                info!(
                    account_id,
                    from = prior.label(),
                    to = next.state.label(),
                    outcome = outcome.label(),
                    "account state changed"
                );
            }
            prior != AccountState::Unavailable && next.state == AccountState::Unavailable
        };

        // Fresh unavailable verdicts from live traffic get re-checked
        // immediately instead of waiting out a full heartbeat interval.
        if went_unavailable && source == OutcomeSource::Request {
            let _ = self.probe_tx.send(account_id.to_string());
        }
    }

    /// Build the no-account-available error payload.
    async fn exhausted_message(&self) -> String {
        let snapshot = self.snapshot().await;
        serde_json::json!({
            "error": {
                "type": "no_account_available",
                "message": "No usable account in pool",
                "pool": {
                    "accounts_total": snapshot.accounts_total,
                    "accounts_normal": snapshot.accounts_normal,
                    "accounts_degraded": snapshot.accounts_degraded,
                    "accounts_unavailable": snapshot.accounts_unavailable
                }
            }
        })
        .to_string()
    }
}

fn unix_secs(t: Option<SystemTime>) -> Option<u64> {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}
