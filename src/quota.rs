use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex, Notify, oneshot},
    time::MissedTickBehavior,
};
use tracing::{info, warn};

use crate::{
    config::Config,
    domain::{Client, ClientUsage, QuotaBreach},
    reconcile::ReconcileHandle,
    state::{JsonSnapshotStore, StoreError},
};

#[derive(Debug, Clone)]
pub struct QuotaHandle {
    usage: Arc<Notify>,
    shutdown: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl QuotaHandle {
    /// Called by the stats poller after each committed sample.
    pub fn usage_committed(&self) {
        self.usage.notify_one();
    }

    pub async fn shutdown(&self) {
        let tx = self.shutdown.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuotaOptions {
    /// Catches expiries when no traffic arrives to trigger a pass.
    pub tick: Duration,
    /// Online ip observations older than this are ignored.
    pub ip_window: Duration,
}

impl QuotaOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick: Duration::from_secs(config.quota_tick_secs),
            ip_window: Duration::from_secs(config.stats_interval_secs.saturating_mul(3)),
        }
    }
}

pub fn spawn_quota_worker(
    config: &Config,
    store: Arc<Mutex<JsonSnapshotStore>>,
    reconcile: ReconcileHandle,
) -> (QuotaHandle, tokio::task::JoinHandle<()>) {
    spawn_quota_worker_with_options(QuotaOptions::from_config(config), store, reconcile)
}

pub fn spawn_quota_worker_with_options(
    options: QuotaOptions,
    store: Arc<Mutex<JsonSnapshotStore>>,
    reconcile: ReconcileHandle,
) -> (QuotaHandle, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let handle = QuotaHandle {
        usage: Arc::new(Notify::new()),
        shutdown: Arc::new(Mutex::new(Some(shutdown_tx))),
    };
    let usage = handle.usage.clone();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(options.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = usage.notified() => {}
                _ = &mut shutdown_rx => break,
            }
            if let Err(err) =
                run_quota_pass_at(Utc::now(), &store, &reconcile, options.ip_window).await
            {
                warn!(%err, "quota pass failed");
            }
        }
    });

    (handle, task)
}

/// First limit `client` is past, if any. Expiry wins over traffic, traffic over ips.
pub fn evaluate_breach(
    client: &Client,
    usage: &ClientUsage,
    now: DateTime<Utc>,
    ip_window: Duration,
) -> Option<QuotaBreach> {
    if client.is_expired_at(now) {
        return Some(QuotaBreach::Expired);
    }
    if client.is_over_traffic(usage.total_bytes()) {
        return Some(QuotaBreach::Traffic);
    }
    if client.ip_limit > 0
        && let (Some(online), Some(observed_at)) = (usage.online_ips, usage.online_observed_at)
    {
        let fresh = chrono::Duration::from_std(ip_window)
            .map(|window| now - observed_at <= window)
            .unwrap_or(true);
        if fresh && online > client.ip_limit {
            return Some(QuotaBreach::IpLimit);
        }
    }
    None
}

/// Disables every enabled client past a limit in one store write, then asks for one
/// recompile. Returns what was disabled.
pub async fn run_quota_pass_at(
    now: DateTime<Utc>,
    store: &Arc<Mutex<JsonSnapshotStore>>,
    reconcile: &ReconcileHandle,
    ip_window: Duration,
) -> Result<Vec<(String, QuotaBreach)>, StoreError> {
    let disabled = {
        let mut store = store.lock().await;
        let breaches: Vec<(String, QuotaBreach)> = store
            .list_clients()
            .into_iter()
            .filter(|c| c.enabled)
            .filter_map(|c| {
                let usage = store.get_client_usage(&c.client_id);
                evaluate_breach(&c, &usage, now, ip_window).map(|b| (c.client_id, b))
            })
            .collect();
        if breaches.is_empty() {
            return Ok(Vec::new());
        }

        let flipped = store.disable_clients(&breaches)?;
        breaches
            .into_iter()
            .filter(|(id, _)| flipped.contains(id))
            .collect::<Vec<_>>()
    };

    for (client_id, breach) in &disabled {
        info!(client_id, reason = breach.as_str(), "client disabled by quota");
    }
    if !disabled.is_empty() {
        reconcile.request_full();
    }
    Ok(disabled)
}
