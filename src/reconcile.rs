use std::{sync::Arc, time::Duration};

use chrono::Utc;
use rand::{SeedableRng, rngs::StdRng};
use sha2::{Digest as _, Sha256};
use tokio::{
    sync::{Mutex, mpsc},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    backoff::{Backoff, BackoffPolicy},
    compiler::compile_store,
    config::Config,
    engine::LifecycleError,
    state::JsonSnapshotStore,
    supervisor::SupervisorHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileRequest {
    /// Recompile the latest snapshot and apply it.
    Full,
}

/// Fire-and-forget trigger for a compile + apply pass. Requests coalesce.
#[derive(Debug, Clone)]
pub struct ReconcileHandle {
    tx: Option<mpsc::UnboundedSender<ReconcileRequest>>,
}

impl ReconcileHandle {
    pub fn noop() -> Self {
        Self { tx: None }
    }

    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<ReconcileRequest>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn request(&self, req: ReconcileRequest) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(req);
        }
    }

    pub fn request_full(&self) {
        self.request(ReconcileRequest::Full);
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub debounce: Duration,
    pub periodic_full: Duration,
    pub backoff: BackoffPolicy,
}

impl ReconcilerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: Duration::from_millis(config.reconcile_debounce_ms),
            periodic_full: Duration::from_secs(30),
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

pub fn spawn_reconciler(
    config: &Config,
    store: Arc<Mutex<JsonSnapshotStore>>,
    supervisor: SupervisorHandle,
) -> (ReconcileHandle, tokio::task::JoinHandle<()>) {
    spawn_reconciler_with_options(ReconcilerOptions::from_config(config), store, supervisor)
}

pub fn spawn_reconciler_with_options(
    options: ReconcilerOptions,
    store: Arc<Mutex<JsonSnapshotStore>>,
    supervisor: SupervisorHandle,
) -> (ReconcileHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ReconcileHandle { tx: Some(tx) };
    let task = tokio::spawn(reconciler_task(store, supervisor, rx, options));
    (handle, task)
}

async fn reconciler_task(
    store: Arc<Mutex<JsonSnapshotStore>>,
    supervisor: SupervisorHandle,
    mut rx: mpsc::UnboundedReceiver<ReconcileRequest>,
    options: ReconcilerOptions,
) {
    // Startup applies whatever the store holds right away.
    let mut pending = true;
    let mut debounce_until: Option<Instant> = Some(Instant::now());
    let mut backoff_until: Option<Instant> = None;
    let mut backoff = Backoff::new(options.backoff, StdRng::from_entropy());
    let mut last_attempted: Option<String> = None;

    let mut periodic = tokio::time::interval_at(
        Instant::now() + options.periodic_full,
        options.periodic_full,
    );
    periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let now = Instant::now();
        let run_at = if pending {
            let debounce_at = debounce_until.unwrap_or(now);
            let backoff_at = backoff_until.unwrap_or(now);
            Some(std::cmp::max(debounce_at, backoff_at))
        } else {
            None
        };

        tokio::select! {
            _ = periodic.tick() => {
                pending = true;
                debounce_until = Some(Instant::now() + options.debounce);
            }
            maybe = rx.recv() => {
                match maybe {
                    Some(ReconcileRequest::Full) => {
                        pending = true;
                        debounce_until = Some(Instant::now() + options.debounce);
                    }
                    None => break,
                }
            }
            _ = async {
                if let Some(at) = run_at {
                    tokio::time::sleep_until(at).await;
                }
            }, if run_at.is_some() => {
                debounce_until = None;
                // Requests that land while this pass runs leave `pending` set again.
                pending = false;
                if let Err(err) = reconcile_once(&store, &supervisor, &mut last_attempted).await {
                    let delay = backoff.next_delay();
                    debug!(error = %err, ?delay, "reconcile apply failed; backing off");
                    backoff_until = Some(Instant::now() + delay);
                    pending = true;
                    continue;
                }
                backoff.reset();
                backoff_until = None;
            }
        }
    }
}

/// One compile + apply pass over the latest snapshot.
///
/// Compile errors keep the engine on its previous document. A document the supervisor
/// already acted on is not re-submitted: the supervisor owns restarts of the current
/// document, and fatal failures are reported once instead of retried on every tick.
/// Only errors worth retrying soon are returned.
pub async fn reconcile_once(
    store: &Arc<Mutex<JsonSnapshotStore>>,
    supervisor: &SupervisorHandle,
    last_attempted: &mut Option<String>,
) -> Result<(), LifecycleError> {
    let compiled = {
        let store = store.lock().await;
        compile_store(&store, Utc::now())
    };
    let document = match compiled {
        Ok(document) => document,
        Err(errors) => {
            warn!(
                issues = errors.issues().len(),
                error = %errors,
                "compile failed; engine keeps its current config"
            );
            return Ok(());
        }
    };

    let digest = hex::encode(Sha256::digest(document.as_bytes()));
    if last_attempted.as_deref() == Some(digest.as_str()) {
        debug!(digest, "compiled config unchanged");
        return Ok(());
    }

    let clients = document.client_tags().len();
    match supervisor.apply(document).await {
        Ok(()) => {
            info!(digest, clients, "engine config applied");
            *last_attempted = Some(digest);
            Ok(())
        }
        Err(LifecycleError::Superseded) => Ok(()),
        Err(err @ (LifecycleError::WaitTimeout { .. } | LifecycleError::SupervisorGone)) => Err(err),
        Err(err) => {
            warn!(
                digest,
                kind = err.kind(),
                error = %err,
                "engine did not take the compiled config"
            );
            *last_attempted = Some(digest);
            Ok(())
        }
    }
}
