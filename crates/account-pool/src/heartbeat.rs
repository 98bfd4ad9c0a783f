//! Background heartbeat probing
//!
//! One long-lived task owns all probing: the periodic sweep over the whole
//! account list, and the immediate single-account checks queued when an
//! account is added or a live request drives one to Unavailable. Settings
//! are re-read on every iteration, so admin changes to the interval,
//! timeout, or enablement apply on the very next cycle without a restart.
//!
//! Sweeps run probes with bounded concurrency and a per-probe timeout; each
//! result is applied to the pool independently, so aborting the task
//! mid-sweep is safe (unvisited accounts keep their prior state until the
//! next interval).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pool::{HeartbeatSettings, Pool};
use crate::probe::Probe;
use crate::state::Outcome;

/// Spawn the heartbeat task.
///
/// `requests` is the immediate-probe queue handed out by [`Pool::new`]. The
/// task runs until aborted at shutdown; aborting mid-sweep cannot corrupt
/// pool state because each probe result is applied independently.
pub fn spawn_heartbeat_task(
    pool: Arc<Pool>,
    probe: Arc<dyn Probe>,
    mut requests: mpsc::UnboundedReceiver<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut period_secs = pool.settings().await.heartbeat.interval_secs;
        let mut ticker = tokio::time::interval(Duration::from_secs(period_secs));
        // Skip the immediate first tick: accounts start Normal and newly
        // added ones arrive through the request queue anyway.
        ticker.tick().await;

        loop {
            // Interval updates apply on the next cycle. The ticker keeps its
            // deadline across immediate-probe wakeups, so a busy request
            // queue cannot starve the periodic sweep.
            let hb = pool.settings().await.heartbeat;
            if hb.interval_secs != period_secs {
                period_secs = hb.interval_secs;
                ticker = tokio::time::interval(Duration::from_secs(period_secs));
                ticker.tick().await;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let hb = pool.settings().await.heartbeat;
                    if hb.enabled {
                        sweep(&pool, &probe, &hb).await;
                    }
                }
                request = requests.recv() => {
                    match request {
                        Some(account_id) => {
                            let hb = pool.settings().await.heartbeat;
                            // Disabled heartbeat freezes accounts in their
                            // last known state: on-demand checks are dropped
                            // too, not just the periodic sweep.
                            if hb.enabled {
                                probe_account(&pool, probe.as_ref(), &account_id, hb.timeout_secs)
                                    .await;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    })
}

/// Probe every account once, at most `max_concurrent_probes` in flight.
async fn sweep(pool: &Arc<Pool>, probe: &Arc<dyn Probe>, hb: &HeartbeatSettings) {
    let sweep_id = Uuid::new_v4().simple().to_string();
    let ids = pool.account_ids().await;
    debug!(sweep_id, accounts = ids.len(), "heartbeat sweep started");

    let semaphore = Arc::new(Semaphore::new(hb.max_concurrent_probes));
    let mut probes = JoinSet::new();
    for account_id in ids {
        let pool = Arc::clone(pool);
        let probe = Arc::clone(probe);
        let semaphore = Arc::clone(&semaphore);
        let timeout_secs = hb.timeout_secs;
        probes.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            probe_account(&pool, probe.as_ref(), &account_id, timeout_secs).await;
        });
    }
    while probes.join_next().await.is_some() {}
    debug!(sweep_id, "heartbeat sweep finished");
}

/// Probe one account and feed the classified result into the pool. A probe
/// that outlives its timeout counts as an unknown error.
async fn probe_account(pool: &Pool, probe: &dyn Probe, account_id: &str, timeout_secs: u64) {
    let Some(credential) = pool.credential(account_id).await else {
        debug!(account_id, "skipping probe, no stored credential");
        return;
    };

    let started = Instant::now();
    let outcome = match tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        probe.check(account_id, &credential),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(account_id, timeout_secs, "probe timed out");
            Outcome::UnknownError
        }
    };

    metrics::counter!("pool_probe_outcomes_total", "outcome" => outcome.label()).increment(1);
    metrics::histogram!("pool_probe_duration_seconds", "outcome" => outcome.label())
        .record(started.elapsed().as_secs_f64());

    pool.apply_probe_outcome(account_id, outcome).await;
}
