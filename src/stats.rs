use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex, mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    config::Config,
    domain::client_id_from_stats_tag,
    engine::stats::{EngineStats, StatReading, StatsError},
    quota::QuotaHandle,
    state::{JsonSnapshotStore, StoreError, UsageSample},
    supervisor::{BeforeStop, BeforeStopFuture, EngineStatus},
};

#[derive(Debug)]
pub enum PollError {
    Query(StatsError),
    QueryTimeout(Duration),
    Store(StoreError),
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query(err) => write!(f, "{err}"),
            Self::QueryTimeout(after) => {
                write!(f, "stats query timed out after {}ms", after.as_millis())
            }
            Self::Store(err) => write!(f, "usage commit failed: {err}"),
        }
    }
}

impl std::error::Error for PollError {}

impl From<StatsError> for PollError {
    fn from(value: StatsError) -> Self {
        Self::Query(value)
    }
}

impl From<StoreError> for PollError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// No running engine instance to ask.
    NotRunning,
    Committed { clients: usize, bytes: u64 },
}

/// Last counter values seen from one engine instance. A new instance starts from zero.
#[derive(Debug, Default)]
pub struct Baselines {
    instance_id: Option<String>,
    readings: BTreeMap<String, StatReading>,
}

impl Baselines {
    fn for_instance(&self, instance_id: &str) -> BTreeMap<String, StatReading> {
        if self.instance_id.as_deref() == Some(instance_id) {
            self.readings.clone()
        } else {
            BTreeMap::new()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsPollerOptions {
    pub interval: Duration,
    pub query_timeout: Duration,
    pub warn_throttle: Duration,
}

impl StatsPollerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.stats_interval_secs),
            query_timeout: Duration::from_secs(3),
            warn_throttle: Duration::from_secs(60),
        }
    }

    /// How long a stop waits for its final sample.
    pub fn flush_wait(&self) -> Duration {
        self.query_timeout * 3
    }
}

#[derive(Debug)]
struct FlushRequest {
    instance_id: String,
    done: oneshot::Sender<()>,
}

/// Handed to the supervisor: before an instance is stopped on purpose, the poller takes one
/// more sample from it so traffic since the last cycle is not lost with its counters.
#[derive(Debug, Clone)]
pub struct FlushHandle {
    tx: mpsc::Sender<FlushRequest>,
    wait: Duration,
}

/// Poller side of [`flush_channel`].
#[derive(Debug)]
pub struct FlushRequests {
    rx: mpsc::Receiver<FlushRequest>,
}

pub fn flush_channel(wait: Duration) -> (FlushHandle, FlushRequests) {
    let (tx, rx) = mpsc::channel(4);
    (FlushHandle { tx, wait }, FlushRequests { rx })
}

impl BeforeStop for FlushHandle {
    fn before_stop<'a>(&'a self, instance_id: &'a str) -> BeforeStopFuture<'a> {
        Box::pin(async move {
            let (done, finished) = oneshot::channel();
            let request = FlushRequest {
                instance_id: instance_id.to_string(),
                done,
            };
            let flushed = async {
                if self.tx.send(request).await.is_err() {
                    debug!(instance_id, "stats poller gone; no final sample");
                    return;
                }
                let _ = finished.await;
            };
            if tokio::time::timeout(self.wait, flushed).await.is_err() {
                warn!(
                    instance_id,
                    wait_ms = self.wait.as_millis() as u64,
                    "final stats sample did not finish; stopping anyway"
                );
            }
        })
    }
}

pub fn spawn_stats_poller_with_options(
    opts: StatsPollerOptions,
    store: Arc<Mutex<JsonSnapshotStore>>,
    stats: Arc<dyn EngineStats>,
    engine_status: watch::Receiver<EngineStatus>,
    quota: QuotaHandle,
    flushes: FlushRequests,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(opts.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut baselines = Baselines::default();
        let mut last_warn_at: Option<Instant> = None;
        let mut flushes = flushes.rx;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                Some(request) = flushes.recv() => {
                    let result = poll_instance_at(
                        Utc::now(),
                        &store,
                        stats.as_ref(),
                        &request.instance_id,
                        &mut baselines,
                        opts.query_timeout,
                    )
                    .await;
                    match result {
                        Ok(PollOutcome::Committed { clients, bytes }) => {
                            debug!(instance_id = %request.instance_id, clients, bytes, "final stats sample committed");
                            quota.usage_committed();
                        }
                        Ok(PollOutcome::NotRunning) => {}
                        Err(err) => {
                            warn!(instance_id = %request.instance_id, error = %err, "final stats sample failed");
                        }
                    }
                    let _ = request.done.send(());
                    continue;
                }
            }

            let status = engine_status.borrow().clone();
            let result = poll_once_at(
                Utc::now(),
                &store,
                stats.as_ref(),
                &status,
                &mut baselines,
                opts.query_timeout,
            )
            .await;

            match result {
                Ok(PollOutcome::NotRunning) => {
                    debug!(
                        engine_state = status.state.as_str(),
                        "stats poll skipped: engine not running"
                    );
                }
                Ok(PollOutcome::Committed { clients, bytes }) => {
                    last_warn_at = None;
                    debug!(clients, bytes, "stats poll committed");
                    quota.usage_committed();
                }
                Err(err) => {
                    let now = Instant::now();
                    let should_warn = last_warn_at
                        .map(|t| now.duration_since(t) >= opts.warn_throttle)
                        .unwrap_or(true);
                    if should_warn {
                        warn!(error = %err, "stats poll failed; cycle skipped");
                        last_warn_at = Some(now);
                    } else {
                        debug!(error = %err, "stats poll failed (throttled)");
                    }
                }
            }
        }
    })
}

/// One poll cycle. Either the whole sample is committed and the baselines advance, or
/// nothing is written and the baselines stay put, so the next cycle neither loses nor
/// double counts traffic.
pub async fn poll_once_at(
    now: DateTime<Utc>,
    store: &Arc<Mutex<JsonSnapshotStore>>,
    stats: &dyn EngineStats,
    status: &EngineStatus,
    baselines: &mut Baselines,
    query_timeout: Duration,
) -> Result<PollOutcome, PollError> {
    let Some(instance_id) = status.running_instance() else {
        return Ok(PollOutcome::NotRunning);
    };
    poll_instance_at(now, store, stats, instance_id, baselines, query_timeout).await
}

/// Same as [`poll_once_at`] against a named instance, whatever the engine state says.
pub async fn poll_instance_at(
    now: DateTime<Utc>,
    store: &Arc<Mutex<JsonSnapshotStore>>,
    stats: &dyn EngineStats,
    instance_id: &str,
    baselines: &mut Baselines,
    query_timeout: Duration,
) -> Result<PollOutcome, PollError> {
    let readings = tokio::time::timeout(query_timeout, stats.query_traffic())
        .await
        .map_err(|_| PollError::QueryTimeout(query_timeout))??;

    let previous = baselines.for_instance(instance_id);
    let mut sample = UsageSample {
        observed_at: now,
        ..Default::default()
    };
    for (tag, reading) in &readings {
        let Some(client_id) = client_id_from_stats_tag(tag) else {
            continue;
        };
        let before = previous.get(tag).copied().unwrap_or_default();
        let up = counter_delta(before.uplink, reading.uplink);
        let down = counter_delta(before.downlink, reading.downlink);
        if up > 0 || down > 0 {
            sample.deltas.insert(client_id.to_string(), (up, down));
        }
    }

    let ip_limited: Vec<String> = {
        let store = store.lock().await;
        store
            .list_clients()
            .into_iter()
            .filter(|c| c.enabled && c.ip_limit > 0)
            .map(|c| c.client_id)
            .collect()
    };
    for client_id in ip_limited {
        let tag = crate::domain::client_stats_tag(&client_id);
        match tokio::time::timeout(query_timeout, stats.online_ips(&tag)).await {
            Ok(Ok(Some(count))) => {
                sample.online_ips.insert(client_id, Some(count));
            }
            Ok(Ok(None)) => {}
            Ok(Err(err)) => debug!(client_id, error = %err, "online ip query failed"),
            Err(_) => debug!(client_id, "online ip query timed out"),
        }
    }

    let clients = sample.deltas.len();
    let bytes = sample
        .deltas
        .values()
        .map(|(up, down)| up.saturating_add(*down))
        .sum();

    if !sample.deltas.is_empty() || !sample.online_ips.is_empty() {
        store.lock().await.commit_usage_sample(&sample)?;
    }

    baselines.instance_id = Some(instance_id.to_string());
    baselines.readings = readings;

    Ok(PollOutcome::Committed { clients, bytes })
}

/// Cumulative counters only go down when the engine reset them; count from zero then.
fn counter_delta(before: u64, now: u64) -> u64 {
    if now >= before { now - before } else { now }
}
